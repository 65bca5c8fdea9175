use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Low/high queue depth pair. Work stops being issued once a queue reaches
/// `high` and resumes only after it drains below `low`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_path: String,
    pub root_paths: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub crawl_threads: usize,
    pub idle_threshold_secs: u64,
    pub archive_extensions: Vec<String>,
    pub legacy_encoding: String,
    pub batch_size: usize,
    pub insertable_watermarks: Watermarks,
    pub maintenance_watermarks: Watermarks,
    pub update_watermarks: Watermarks,
    pub max_phase_repeats: u32,
    pub full_relist_interval_secs: u64,
    pub equality_reverify_secs: u64,
    pub long_diff_warning_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "deep_index.db".to_string(),
            root_paths: Vec::new(),
            ignore_patterns: Vec::new(),
            crawl_threads: 4,
            idle_threshold_secs: 0,
            archive_extensions: vec!["tar".to_string(), "tgz".to_string(), "gz".to_string()],
            legacy_encoding: "utf-8".to_string(),
            batch_size: 256,
            insertable_watermarks: Watermarks::new(64, 256),
            maintenance_watermarks: Watermarks::new(256, 1024),
            update_watermarks: Watermarks::new(512, 2048),
            max_phase_repeats: 4,
            full_relist_interval_secs: 3600,
            equality_reverify_secs: 7 * 24 * 3600,
            long_diff_warning_secs: 120,
        }
    }
}

impl AppConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn long_diff_warning(&self) -> Duration {
        Duration::from_secs(self.long_diff_warning_secs)
    }

    pub fn full_relist_interval(&self) -> Duration {
        Duration::from_secs(self.full_relist_interval_secs)
    }

    pub fn equality_reverify(&self) -> Duration {
        Duration::from_secs(self.equality_reverify_secs)
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(
            Environment::with_prefix("DEEP_INDEX")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("root_paths")
                .with_list_parse_key("ignore_patterns")
                .with_list_parse_key("archive_extensions"),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        let mut should_add = true;
        let result_clone = result.clone();

        for res_dir in &result_clone {
            let res_dir_path = Path::new(res_dir);

            if dir_path.starts_with(res_dir_path) {
                should_add = false;
                break;
            }

            if res_dir_path.starts_with(dir_path) {
                result.retain(|x| x != res_dir);
            }
        }

        if should_add {
            result.push(dir);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_overlapping_with_subdirectory() {
        let dirs = vec![
            "/home/user/docs".to_string(),
            "/home/user".to_string(),
            "/home/user/music".to_string(),
            "/var/data".to_string(),
        ];
        let result = non_overlapping_directories(dirs);
        assert_eq!(result.len(), 2);
        assert!(result.contains(&"/home/user".to_string()));
        assert!(result.contains(&"/var/data".to_string()));
    }

    #[test]
    fn test_defaults_keep_watermarks_ordered() {
        let config = AppConfig::default();
        for marks in [
            config.insertable_watermarks,
            config.maintenance_watermarks,
            config.update_watermarks,
        ] {
            assert!(marks.low < marks.high);
        }
        assert!(config.maintenance_watermarks.high > config.insertable_watermarks.high);
    }
}
