//! 材料、工件与产品
//!
//! 插件候选在管道中依次经历三种形态：
//! 材料 (未解析的来源) → 工件 (清单文本 + 本地插件目录) → 产品 (已排序、入口点已解析)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::plugin::module::{EntryPointHandle, ModuleHandle};
use crate::plugin::types::{PluginDescriptor, PluginLocation};

/// 材料类型，预处理器按类型注册
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    LocalFile,
    Remote,
    Archive,
}

impl fmt::Display for MaterialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MaterialKind::LocalFile => "local_file",
            MaterialKind::Remote => "remote",
            MaterialKind::Archive => "archive",
        };
        f.write_str(s)
    }
}

/// 材料
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Material {
    /// 插件目录，或目录中的 plugin.json
    LocalFile(PathBuf),
    /// 远程插件包地址
    Remote(String),
    /// 本地插件包 (zip / tar.gz)
    Archive(PathBuf),
}

impl Material {
    pub fn kind(&self) -> MaterialKind {
        match self {
            Material::LocalFile(_) => MaterialKind::LocalFile,
            Material::Remote(_) => MaterialKind::Remote,
            Material::Archive(_) => MaterialKind::Archive,
        }
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Material::LocalFile(path) | Material::Archive(path) => {
                write!(f, "{}:{}", self.kind(), path.display())
            }
            Material::Remote(url) => write!(f, "{}:{}", self.kind(), url),
        }
    }
}

/// 工件：预处理完成，清单文本已读出，插件文件已位于本地目录
#[derive(Debug, Clone)]
pub struct Workpiece {
    pub material: Material,
    pub manifest_text: String,
    pub plugin_dir: PathBuf,
    pub location: PluginLocation,
}

impl Workpiece {
    pub fn new(
        material: Material,
        manifest_text: String,
        plugin_dir: PathBuf,
        location: PluginLocation,
    ) -> Self {
        Self {
            material,
            manifest_text,
            plugin_dir,
            location,
        }
    }
}

/// 产品：可交给加载器预加载的插件
///
/// 只能由主处理器产出
#[derive(Debug, Clone)]
pub struct Product {
    descriptor: Arc<PluginDescriptor>,
    location: PluginLocation,
    plugin_dir: PathBuf,
    module: ModuleHandle,
    entry_point: EntryPointHandle,
}

impl Product {
    pub(crate) fn new(
        descriptor: Arc<PluginDescriptor>,
        location: PluginLocation,
        plugin_dir: PathBuf,
        module: ModuleHandle,
        entry_point: EntryPointHandle,
    ) -> Self {
        Self {
            descriptor,
            location,
            plugin_dir,
            module,
            entry_point,
        }
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn location(&self) -> &PluginLocation {
        &self.location
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    pub fn entry_point(&self) -> &EntryPointHandle {
        &self.entry_point
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Arc<PluginDescriptor>,
        PluginLocation,
        PathBuf,
        ModuleHandle,
        EntryPointHandle,
    ) {
        (
            self.descriptor,
            self.location,
            self.plugin_dir,
            self.module,
            self.entry_point,
        )
    }
}
