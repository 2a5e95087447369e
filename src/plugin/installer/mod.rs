//! 插件安装器模块
//!
//! 提供插件安装与计划升级/移除功能：
//! - 从本地文件或 URL 安装插件包 (zip / tar.gz)
//! - 插件包验证与校验和检查
//! - 已安装插件注册表
//! - 持久化的升级/移除计划，启动时统一执行

mod downloader;
mod extractor;
mod installer;
mod plan;
mod registry;
mod types;
mod validator;

pub use downloader::{file_name_from_url, DownloadProgressFn, Downloader, HttpDownloader};
pub use extractor::{copy_dir_recursive, find_plugin_root, ArchiveExtractor, PackageExtractor};
pub use installer::{PluginInstaller, STAGING_DIR};
pub use plan::{PlanStore, PLAN_CONTAINER, REMOVE_KEY, UPGRADE_KEY};
pub use registry::PluginRegistry;
pub use types::{
    CheckReport, InstallError, InstallOutcome, InstallSource, InstallStage, InstallStatus,
    InstalledPlugin, PackageFormat, PlanRemoveRecord, PlanUpgradeRecord,
};
pub use validator::PackageValidator;
