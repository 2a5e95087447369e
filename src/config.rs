//! 运行时配置
//!
//! YAML 格式，所有字段都有默认值；默认目录位于 `dirs::config_dir()/plugin-runtime`

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::plugin::version::PluginVersion;

const APP_DIR: &str = "plugin-runtime";

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("读取配置文件失败: {path} - {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("写入配置文件失败: {path} - {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置解析失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 升级计划的执行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStrategy {
    /// 原地覆盖，旧版本多出的文件保留
    #[default]
    Coverage,
    /// 先删除旧目录再写入
    Remove,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace / debug / info / warn / error
    pub level: String,
    /// 是否写入日志文件
    pub enabled: bool,
    pub log_dir: Option<PathBuf>,
    /// 内存中保留的日志条数
    pub max_logs: usize,
    pub max_file_size: u64,
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enabled: true,
            log_dir: None,
            max_logs: 1000,
            max_file_size: 10 * 1024 * 1024,
            retention_days: 7,
        }
    }
}

impl LoggingConfig {
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| default_root().join("logs"))
    }
}

/// 插件运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub plugins_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub database_path: PathBuf,
    /// 宿主版本，用于检查插件的 min_host_version
    pub host_version: String,
    pub upgrade_strategy: UpgradeStrategy,
    /// 解析清单、解析入口点时的并发上限
    pub max_concurrency: usize,
    /// 只作用于 HTTP 传输层
    pub download_timeout_secs: u64,
    /// 启动时额外拉取的远程插件包
    pub remote_feeds: Vec<String>,
    /// 预加载后是否立即实例化
    pub instantiate_on_start: bool,
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let root = default_root();
        Self {
            plugins_dir: root.join("plugins"),
            temp_dir: root.join("tmp"),
            database_path: root.join("runtime.db"),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            upgrade_strategy: UpgradeStrategy::default(),
            max_concurrency: 6,
            download_timeout_secs: 300,
            remote_feeds: Vec::new(),
            instantiate_on_start: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// 从 YAML 文件加载
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// 文件不存在时返回默认配置
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency 必须大于 0".to_string()));
        }
        self.parsed_host_version()?;
        Ok(())
    }

    pub fn parsed_host_version(&self) -> Result<PluginVersion, ConfigError> {
        PluginVersion::parse(&self.host_version)
            .map_err(|e| ConfigError::Invalid(format!("host_version {}", e)))
    }

    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        default_root().join("config.yaml")
    }
}

fn default_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
