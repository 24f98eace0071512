use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub local_storage_dir: String,
    pub persist_storage: bool,
    pub write_metadata: bool,
    pub default_request_queue_id: String,
    pub force_cloud: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String, // "DEBUG", "INFO", "WARN", "ERROR"
    #[serde(default = "default_log_to_console")]
    pub log_to_console: bool,
}

fn default_log_to_console() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_storage_dir: "./storage".to_string(),
            persist_storage: true,
            write_metadata: false,
            default_request_queue_id: "default".to_string(),
            force_cloud: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            log_to_console: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the config directory path.
pub fn get_config_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "crawlqueue", "coordinator") {
        let config_dir = proj_dirs.config_dir().to_path_buf();
        fs::create_dir_all(&config_dir).ok();
        config_dir
    } else {
        PathBuf::from(".")
    }
}

/// Get the config file path.
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Get the logs directory path.
pub fn get_logs_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "crawlqueue", "coordinator") {
        let logs_dir = proj_dirs.data_dir().join("logs");
        fs::create_dir_all(&logs_dir).ok();
        logs_dir
    } else {
        let logs_dir = std::env::temp_dir().join("crawl_queue_coordinator_logs");
        fs::create_dir_all(&logs_dir).ok();
        logs_dir
    }
}

/// Generate a timestamped log file path for this session.
pub fn get_log_file_path() -> PathBuf {
    let logs_dir = get_logs_dir();
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    logs_dir.join(format!("crawl_queue_coordinator_{}.log", timestamp))
}

/// Load configuration from file, or create a default one if it doesn't exist.
pub fn load_config() -> AppConfig {
    let config_path = get_config_path();

    if config_path.exists() {
        if let Ok(content) = fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<AppConfig>(&content) {
                return config;
            }
        }
    }

    let default_config = AppConfig::default();
    let toml_content = r#"# crawl-queue-coordinator configuration

[storage]
# Where the local on-disk emulator keeps its request files when no remote
# token is configured.
local_storage_dir = "./storage"
# false keeps all state in memory only; nothing is written to disk.
persist_storage = true
# Maintain __metadata__.json next to the request files.
write_metadata = false
default_request_queue_id = "default"
# Open remote storage even when local storage is otherwise configured.
force_cloud = false

[logging]
# Log level: "DEBUG", "INFO", "WARN", "ERROR"
level = "INFO"
# Whether to also log to console (useful for development)
log_to_console = true
"#;

    fs::write(&config_path, toml_content).ok();
    default_config
}
