//! 宿主侧插件运行时
//!
//! 发现插件、解析依赖与版本、按依赖顺序分两阶段加载，
//! 并管理跨进程重启生效的安装、升级与移除。

pub mod config;
pub mod database;
pub mod logger;
pub mod plugin;
pub mod settings;

pub use config::{ConfigError, LoggingConfig, RuntimeConfig, UpgradeStrategy};
pub use plugin::{PluginRuntime, RuntimeError};
