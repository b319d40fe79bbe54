use std::env;
use std::fs;

use peexplorer::exceptions::loader::{load as load_exceptions, ExceptionLoaderOptions, ExtraArm64Directory};
use peexplorer::image::Image;
use peexplorer::load_config::chpe::ChpeMetadata;
use peexplorer::load_config::loader::{load as load_config, LoadConfigLoaderOptions};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: peexplorer <path-to-pe-image>"))?;
    let bytes = fs::read(&path)?;
    let image = Image::parse(bytes)?;

    let load_config_directory = load_config(&image, &LoadConfigLoaderOptions::default())?;

    // A hybrid ARM64X image carries a second ARM64 exception directory
    // (`extra_rfe_table`) alongside its native AMD64 one; parse it as an
    // extra table when CHPE metadata resolved one.
    let extra_arm64 = load_config_directory.as_ref().and_then(|directory| {
        match &directory.chpe_metadata {
            Some(ChpeMetadata::Arm64X(arm64x)) if arm64x.extra_rfe_table != 0 => {
                Some(ExtraArm64Directory {
                    rva: arm64x.extra_rfe_table,
                    size: arm64x.extra_rfe_table_size,
                })
            }
            _ => None,
        }
    });

    let exceptions = load_exceptions(&image, &ExceptionLoaderOptions::default(), extra_arm64)?;
    println!(
        "exception directory: {} runtime function(s) across {} table(s)",
        exceptions.total_entries(),
        exceptions.tables.len()
    );

    match load_config_directory {
        Some(directory) => {
            println!(
                "load config directory: version={:?}, {} diagnostic(s)",
                directory.descriptor.version,
                directory.errors.len()
            );
            if let Some(lock_prefixes) = &directory.lock_prefix_table {
                println!("  lock prefix table: {} entries", lock_prefixes.len());
            }
            if let Some(cf) = &directory.cf_guard_functions {
                println!("  cf guard function table: {} entries", cf.len());
            }
            if let Some(dvrt) = &directory.dynamic_relocations {
                println!("  dynamic relocation table: version {}", dvrt.version);
            }
        }
        None => println!("load config directory: absent"),
    }

    Ok(())
}
