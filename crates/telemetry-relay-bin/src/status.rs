//! `status` subcommand.

use batch_file_store::{BatchFileStore, StoreCounts};
use telemetry_config_and_utils::{Config, Paths};

/// Batch file counts of the configured working directory.
pub fn working_dir_counts(
    config: &Config,
    paths: &Paths,
) -> Result<StoreCounts, Box<dyn std::error::Error>> {
    let dir = Paths::analytics_dir_under(&config.storage_base(paths));
    Ok(BatchFileStore::new(dir).counts()?)
}

pub fn print_status(config: &Config, paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let dir = Paths::analytics_dir_under(&config.storage_base(paths));
    let counts = working_dir_counts(config, paths)?;
    println!("working directory: {}", dir.display());
    println!("fresh:       {}", counts.fresh);
    println!("quarantined: {}", counts.quarantined);
    Ok(())
}
