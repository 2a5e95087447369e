//! 插件安装器类型定义
//!
//! 定义安装相关的错误类型、来源、已安装记录以及升级/移除计划

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::plugin::checker::ResolveError;
use crate::plugin::types::{PluginDescriptor, PluginError, PluginId};
use crate::plugin::version::PluginVersion;
use crate::settings::SettingsError;

/// 安装错误类型
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("下载失败: {0}")]
    DownloadFailed(String),

    #[error("包格式无效: {0}")]
    InvalidPackage(String),

    #[error("清单无效: {0}")]
    InvalidManifest(String),

    #[error("解压失败: {0}")]
    ExtractFailed(String),

    #[error("安装失败: {0}")]
    InstallFailed(String),

    #[error("插件已存在: {0}")]
    AlreadyExists(String),

    /// 同一插件已有待执行的升级计划
    #[error("插件已有待执行的升级计划: {0}")]
    AlreadyPlanned(String),

    #[error("插件不存在: {0}")]
    NotFound(String),

    #[error("插件 {plugin} 要求宿主版本 >= {required}，当前宿主版本 {actual}")]
    HostVersionMismatch {
        plugin: PluginId,
        required: PluginVersion,
        actual: PluginVersion,
    },

    #[error("校验和不匹配: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("依赖解析失败: {0}")]
    Resolve(#[from] ResolveError),

    #[error("设置存储错误: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("网络错误: {0}")]
    NetworkError(String),

    #[error("JSON 解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("URL 解析错误: {0}")]
    UrlParseError(String),

    #[error("安装已取消")]
    Cancelled,
}

impl From<PluginError> for InstallError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::InvalidManifest(msg) => InstallError::InvalidManifest(msg),
            PluginError::ManifestNotFound(path) => InstallError::InvalidPackage(format!(
                "未找到清单文件: {}",
                path.display()
            )),
            PluginError::Cancelled => InstallError::Cancelled,
            PluginError::IoError(e) => InstallError::IoError(e),
            other => InstallError::InstallFailed(other.to_string()),
        }
    }
}

/// 安装阶段 (进度报告中的子阶段名)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStage {
    Downloading,
    Validating,
    Resolving,
    Extracting,
    /// 暂存升级计划
    Staging,
    Registering,
    Complete,
    Failed,
}

impl std::fmt::Display for InstallStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallStage::Downloading => write!(f, "downloading"),
            InstallStage::Validating => write!(f, "validating"),
            InstallStage::Resolving => write!(f, "resolving"),
            InstallStage::Extracting => write!(f, "extracting"),
            InstallStage::Staging => write!(f, "staging"),
            InstallStage::Registering => write!(f, "registering"),
            InstallStage::Complete => write!(f, "complete"),
            InstallStage::Failed => write!(f, "failed"),
        }
    }
}

/// 包格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Zip,
    TarGz,
}

impl PackageFormat {
    /// 从文件扩展名检测格式
    pub fn from_extension(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
            Some(PackageFormat::TarGz)
        } else if file_name.ends_with(".zip") {
            Some(PackageFormat::Zip)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PackageFormat::Zip => "zip",
            PackageFormat::TarGz => "tar.gz",
        }
    }
}

/// 安装来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InstallSource {
    /// 本地插件包
    Local {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
    /// URL 下载
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },
}

impl InstallSource {
    pub fn local(path: impl AsRef<Path>) -> Self {
        InstallSource::Local {
            path: path.as_ref().to_string_lossy().to_string(),
            sha256: None,
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        InstallSource::Url {
            url: url.into(),
            sha256: None,
        }
    }

    /// 设置期望的 SHA256 校验和
    pub fn with_sha256(self, checksum: impl Into<String>) -> Self {
        let checksum = Some(checksum.into());
        match self {
            InstallSource::Local { path, .. } => InstallSource::Local {
                path,
                sha256: checksum,
            },
            InstallSource::Url { url, .. } => InstallSource::Url {
                url,
                sha256: checksum,
            },
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            InstallSource::Local { sha256, .. } | InstallSource::Url { sha256, .. } => {
                sha256.as_deref()
            }
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            InstallSource::Local { path, .. } => path,
            InstallSource::Url { url, .. } => url,
        }
    }
}

/// 已安装插件信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPlugin {
    pub id: PluginId,
    pub name: String,
    pub version: PluginVersion,
    pub description: String,
    pub author: Option<String>,
    pub install_path: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub source: InstallSource,
}

impl InstalledPlugin {
    /// 由插件描述生成安装记录
    pub fn from_descriptor(
        descriptor: &PluginDescriptor,
        install_path: PathBuf,
        source: InstallSource,
    ) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            author: descriptor.author.clone(),
            install_path,
            installed_at: Utc::now(),
            source,
        }
    }
}

/// 单个插件的安装结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    /// 已解压到插件目录并登记
    Installed,
    /// 已安装旧版本，新版本已暂存为升级计划，下次启动时生效
    UpgradeStaged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub id: PluginId,
    pub version: PluginVersion,
    pub status: InstallStatus,
    pub install_path: PathBuf,
}

/// 持久化的升级计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanUpgradeRecord {
    pub id: PluginId,
    /// 当前安装目录
    pub current_path: PathBuf,
    /// 暂存的新版本插件包
    pub source_path: PathBuf,
    pub version: PluginVersion,
    pub planned_at: DateTime<Utc>,
}

/// 持久化的移除计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRemoveRecord {
    pub id: PluginId,
    pub target_path: PathBuf,
    pub planned_at: DateTime<Utc>,
}

/// 启动时执行计划的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckReport {
    pub removed: Vec<PluginId>,
    pub upgraded: Vec<PluginId>,
    /// 执行失败的计划，记录保留到下次启动重试
    pub failed: Vec<(PluginId, String)>,
}

impl CheckReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.upgraded.is_empty() && self.failed.is_empty()
    }
}
