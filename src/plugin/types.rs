//! 插件系统类型定义
//!
//! 定义 Plugin trait、PluginId、PluginManifest、PluginDescriptor 等核心类型

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use super::dependency::{DependencyConstraint, DependencySpec};
use super::version::PluginVersion;
use crate::settings::SettingsError;

/// 插件清单文件名
pub const MANIFEST_FILE: &str = "plugin.json";

/// 插件错误类型
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("清单文件不存在: {0}")]
    ManifestNotFound(PathBuf),

    #[error("清单文件无效: {0}")]
    InvalidManifest(String),

    #[error("插件 {plugin} 的二进制模块不存在: {path}")]
    BinaryModuleNotFound { plugin: PluginId, path: PathBuf },

    #[error("二进制模块加载失败: {path} - {message}")]
    ModuleLoad { path: PathBuf, message: String },

    #[error("插件 {plugin} 的入口点未找到: {entry_point}")]
    EntryPointNotFound {
        plugin: PluginId,
        entry_point: String,
    },

    #[error("插件 {plugin} 构造失败: {message}")]
    Construct { plugin: PluginId, message: String },

    #[error("插件 {plugin} 钩子执行失败: {message}")]
    Hook { plugin: PluginId, message: String },

    #[error("插件 {plugin} 的依赖 {dependency} 不可用")]
    DependencyUnavailable {
        plugin: PluginId,
        dependency: PluginId,
    },

    #[error("插件不存在: {0}")]
    NotFound(String),

    #[error("不支持的材料类型: {0}")]
    UnsupportedMaterial(String),

    #[error("下载失败: {0}")]
    Download(String),

    #[error("解压失败: {0}")]
    Extract(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("设置存储错误: {0}")]
    Settings(#[from] SettingsError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// 插件标识
///
/// 比较与哈希均忽略 ASCII 大小写，展示时保留原始写法
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 统一小写形式，用于目录名和持久化键
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for PluginId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for PluginId {}

impl Hash for PluginId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for PluginId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginId {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.0.bytes().map(|b| b.to_ascii_lowercase());
        let rhs = other.0.bytes().map(|b| b.to_ascii_lowercase());
        lhs.cmp(rhs)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PluginId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 插件来源位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PluginLocation {
    Local(PathBuf),
    Remote(String),
}

impl fmt::Display for PluginLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginLocation::Local(path) => write!(f, "{}", path.display()),
            PluginLocation::Remote(url) => f.write_str(url),
        }
    }
}

/// 插件生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    NotStarted,
    /// 二进制模块已加载、入口点已解析，尚未构造实例
    Preloaded,
    /// 实例已构造，on_loaded 已执行
    Instantiated,
    Enabled,
    Disabled,
    /// 失败后不再重试
    Failed,
}

impl LifecycleState {
    /// 是否已有活动实例
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            LifecycleState::Instantiated | LifecycleState::Enabled | LifecycleState::Disabled
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Preloaded => "preloaded",
            LifecycleState::Instantiated => "instantiated",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 插件清单 (plugin.json)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    /// 插件 id，大小写不敏感
    pub id: String,
    /// 展示名称，缺省时使用 id
    #[serde(default)]
    pub name: String,
    pub version: String,
    /// 数值越小越先处理
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// 二进制模块路径 (相对于插件目录)
    pub binary_module: String,
    /// 入口点名称 (二进制模块导出的构造函数符号)
    pub entry_point: String,
    #[serde(default)]
    pub min_host_version: Option<String>,
}

impl PluginManifest {
    /// 从 JSON 文本解析清单
    pub fn from_json(text: &str) -> Result<Self, PluginError> {
        serde_json::from_str(text)
            .map_err(|e| PluginError::InvalidManifest(format!("无法解析 {}: {}", MANIFEST_FILE, e)))
    }

    /// 验证清单有效性
    pub fn validate(&self) -> Result<(), PluginError> {
        if self.id.trim().is_empty() {
            return Err(PluginError::InvalidManifest("插件 id 不能为空".to_string()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(PluginError::InvalidManifest(format!(
                "插件 id 只能包含字母、数字、'-'、'_'、'.': {}",
                self.id
            )));
        }
        // id 直接用作插件目录名
        if self.id.starts_with('.') {
            return Err(PluginError::InvalidManifest(format!(
                "插件 id 不能以 '.' 开头: {}",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(PluginError::InvalidManifest("插件版本不能为空".to_string()));
        }
        PluginVersion::parse(&self.version)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;

        if self.binary_module.trim().is_empty() {
            return Err(PluginError::InvalidManifest(
                "binary_module 不能为空".to_string(),
            ));
        }
        let module_path = Path::new(&self.binary_module);
        if module_path.is_absolute()
            || module_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PluginError::InvalidManifest(format!(
                "binary_module 必须是插件目录内的相对路径: {}",
                self.binary_module
            )));
        }
        if self.entry_point.trim().is_empty() {
            return Err(PluginError::InvalidManifest(
                "entry_point 不能为空".to_string(),
            ));
        }
        Ok(())
    }

    /// 校验并转换为不可变的插件描述
    pub fn into_descriptor(self) -> Result<PluginDescriptor, PluginError> {
        self.validate()?;

        let version = PluginVersion::parse(&self.version)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
        let min_host_version = self
            .min_host_version
            .as_deref()
            .map(PluginVersion::parse)
            .transpose()
            .map_err(|e| PluginError::InvalidManifest(format!("min_host_version {}", e)))?;
        let dependencies = self
            .dependencies
            .iter()
            .map(DependencyConstraint::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let name = if self.name.trim().is_empty() {
            self.id.clone()
        } else {
            self.name
        };

        Ok(PluginDescriptor {
            id: PluginId::new(self.id),
            name,
            version,
            priority: self.priority,
            description: self.description,
            author: self.author,
            dependencies,
            binary_module: self.binary_module,
            entry_point: self.entry_point,
            min_host_version,
        })
    }
}

/// 插件描述
///
/// 由清单解析而来，之后以 `Arc` 共享，不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub name: String,
    pub version: PluginVersion,
    pub priority: i32,
    pub description: String,
    pub author: Option<String>,
    pub dependencies: Vec<DependencyConstraint>,
    pub binary_module: String,
    pub entry_point: String,
    pub min_host_version: Option<PluginVersion>,
}

impl PluginDescriptor {
    /// 检查宿主版本是否满足插件要求
    pub fn supports_host(&self, host_version: &PluginVersion) -> bool {
        self.min_host_version
            .as_ref()
            .map_or(true, |min| host_version >= min)
    }

    /// 二进制模块在插件目录下的绝对路径
    pub fn binary_module_path(&self, plugin_dir: &Path) -> PathBuf {
        plugin_dir.join(&self.binary_module)
    }
}

/// 插件信息 (用于展示)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: PluginId,
    pub name: String,
    pub version: PluginVersion,
    pub priority: i32,
    pub description: String,
    pub author: Option<String>,
    pub state: LifecycleState,
    pub location: PluginLocation,
    pub instantiated_at: Option<DateTime<Utc>>,
}

/// 插件 trait - 插件实例由宿主以完全信任方式在进程内运行
///
/// 所有钩子都有空实现，插件按需覆盖
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 实例构造完成后调用一次
    async fn on_loaded(&self, _descriptor: &PluginDescriptor) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_enable(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_disable(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// 宿主退出前调用
    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
