use config::{Config, ConfigError, Environment, File};
use drover_types::BlockLimits;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// path of the staging database; ":memory:" keeps it in process
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// size of the upload worker pool
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    /// seconds to wait on the completion queue per poll
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
    /// empty polls tolerated before the drain gives up
    #[serde(default = "default_n_tries")]
    pub n_tries: usize,
    /// an external producer maps files into blocks; skip packing and
    /// per-file status updates
    #[serde(default)]
    pub upload_only: bool,
    #[serde(default = "default_physics_group")]
    pub physics_group: String,
    #[serde(default = "default_dataset_type")]
    pub dataset_type: String,
    #[serde(default = "default_primary_dataset_type")]
    pub primary_dataset_type: String,
    /// debug: dump each serialized block payload to copy_block_path
    #[serde(default)]
    pub copy_block: bool,
    #[serde(default = "default_copy_block_path")]
    pub copy_block_path: String,
    /// seconds between daemon cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    // block capacity limits; unsetting any one of them leaves blocks
    // unbounded on the capacity axes
    #[serde(default = "default_max_block_files")]
    pub max_block_files: Option<u64>,
    #[serde(default = "default_max_block_events")]
    pub max_block_events: Option<u64>,
    #[serde(default = "default_max_block_size")]
    pub max_block_size: Option<u64>,
    /// seconds a block may stay open before the timeout sweep closes it
    #[serde(default = "default_max_block_time")]
    pub max_block_time: Option<i64>,
}

fn default_n_workers() -> usize {
    4
}
fn default_wait_time() -> u64 {
    2
}
fn default_n_tries() -> usize {
    300
}
fn default_physics_group() -> String {
    "NoGroup".to_string()
}
fn default_dataset_type() -> String {
    "PRODUCTION".to_string()
}
fn default_primary_dataset_type() -> String {
    "mc".to_string()
}
fn default_copy_block_path() -> String {
    "block.json".to_string()
}
fn default_poll_interval() -> u64 {
    100
}
fn default_max_block_files() -> Option<u64> {
    Some(500)
}
fn default_max_block_events() -> Option<u64> {
    Some(250_000_000)
}
fn default_max_block_size() -> Option<u64> {
    Some(5_000_000_000_000)
}
fn default_max_block_time() -> Option<i64> {
    Some(86_400)
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            n_workers: default_n_workers(),
            wait_time: default_wait_time(),
            n_tries: default_n_tries(),
            upload_only: false,
            physics_group: default_physics_group(),
            dataset_type: default_dataset_type(),
            primary_dataset_type: default_primary_dataset_type(),
            copy_block: false,
            copy_block_path: default_copy_block_path(),
            poll_interval: default_poll_interval(),
            max_block_files: default_max_block_files(),
            max_block_events: default_max_block_events(),
            max_block_size: default_max_block_size(),
            max_block_time: default_max_block_time(),
        }
    }
}

impl UploadConfig {
    pub fn block_limits(&self) -> BlockLimits {
        BlockLimits {
            max_files: self.max_block_files,
            max_events: self.max_block_events,
            max_size: self.max_block_size,
            max_age: self.max_block_time,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Settings {
    fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            // Add the config file as a source
            .add_source(File::with_name("config"))
            // Optionally add environment variables with a prefix
            .add_source(Environment::with_prefix("APP"))
            .build()?;

        settings.try_deserialize()
    }
}

pub fn get_settings() -> Result<Settings, ConfigError> {
    match Settings::new() {
        Ok(settings) => Ok(settings),
        Err(e) => {
            println!("Failed to load settings: {:?}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = UploadConfig::default();
        assert_eq!(cfg.n_workers, 4);
        assert_eq!(cfg.wait_time, 2);
        assert_eq!(cfg.n_tries, 300);
        assert!(!cfg.upload_only);
        assert_eq!(cfg.physics_group, "NoGroup");
        assert_eq!(cfg.dataset_type, "PRODUCTION");
        assert_eq!(cfg.primary_dataset_type, "mc");
        assert!(!cfg.copy_block);

        let limits = cfg.block_limits();
        assert_eq!(limits.max_files, Some(500));
        assert_eq!(limits.max_age, Some(86_400));
    }
}
