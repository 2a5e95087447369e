//! 插件扫描器
//!
//! 把插件目录转换为管道材料：
//! - 含 plugin.json 的子目录 → 本地材料
//! - 放入目录的 .zip / .tar.gz / .tgz → 插件包材料
//! - 配置的远程地址 → 远程材料

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::installer::{PackageFormat, STAGING_DIR};
use super::pipeline::Material;
use super::types::{PluginError, MANIFEST_FILE};

pub struct PluginScanner {
    plugins_dir: PathBuf,
    remote_feeds: Vec<String>,
}

impl PluginScanner {
    pub fn new(plugins_dir: PathBuf) -> Self {
        Self {
            plugins_dir,
            remote_feeds: Vec::new(),
        }
    }

    pub fn with_remote_feeds(mut self, feeds: Vec<String>) -> Self {
        self.remote_feeds = feeds;
        self
    }

    pub fn default_plugins_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plugin-runtime")
            .join("plugins")
    }

    pub fn with_defaults() -> Self {
        Self::new(Self::default_plugins_dir())
    }

    pub async fn ensure_plugins_dir(&self) -> Result<(), PluginError> {
        if !self.plugins_dir.exists() {
            fs::create_dir_all(&self.plugins_dir).await?;
        }
        Ok(())
    }

    /// 扫描插件目录，结果按路径排序，远程材料排在最后
    pub async fn scan(&self) -> Result<Vec<Material>, PluginError> {
        self.ensure_plugins_dir().await?;

        let mut found = Vec::new();
        let mut entries = fs::read_dir(&self.plugins_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let hidden = entry
                .file_name()
                .to_str()
                .map_or(true, |name| name.starts_with('.') || name == STAGING_DIR);
            if hidden {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if fs::metadata(path.join(MANIFEST_FILE)).await.is_ok() {
                    found.push(Material::LocalFile(path));
                } else {
                    debug!("[扫描] 跳过没有清单的目录: {}", path.display());
                }
            } else if PackageFormat::from_extension(&path).is_some() {
                found.push(Material::Archive(path));
            }
        }

        found.sort_by(|a, b| material_path(a).cmp(&material_path(b)));
        found.extend(self.remote_feeds.iter().cloned().map(Material::Remote));

        debug!(
            "[扫描] {} 中发现 {} 个插件材料",
            self.plugins_dir.display(),
            found.len()
        );
        Ok(found)
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }
}

fn material_path(material: &Material) -> Option<&Path> {
    match material {
        Material::LocalFile(path) | Material::Archive(path) => Some(path),
        Material::Remote(_) => None,
    }
}
