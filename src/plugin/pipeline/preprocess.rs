//! 预处理器
//!
//! 每种材料类型一个处理器，把材料转换为工件：
//! - 本地目录：直接读取 plugin.json
//! - 插件包：解压到缓存目录后读取
//! - 远程地址：下载插件包后按插件包处理

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::material::{Material, MaterialKind, Workpiece};
use crate::logger::sanitize_url;
use crate::plugin::installer::{
    file_name_from_url, find_plugin_root, ArchiveExtractor, Downloader, InstallError,
    PackageExtractor, PackageFormat,
};
use crate::plugin::types::{PluginError, PluginLocation, MANIFEST_FILE};

/// 预处理器
#[async_trait]
pub trait PreprocessingProcessor: Send + Sync {
    fn kind(&self) -> MaterialKind;

    async fn process(
        &self,
        material: &Material,
        cancel: &CancellationToken,
    ) -> Result<Workpiece, PluginError>;
}

/// 材料类型 → 预处理器
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<MaterialKind, Arc<dyn PreprocessingProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册本地目录、插件包、HTTP 三种默认处理器
    pub fn with_defaults(cache_dir: PathBuf, downloader: Arc<dyn Downloader>) -> Self {
        let archive = ArchiveProcessor::new(cache_dir.clone());
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFileProcessor));
        registry.register(Arc::new(archive.clone()));
        registry.register(Arc::new(HttpProcessor::new(cache_dir, downloader, archive)));
        registry
    }

    /// 注册处理器，返回被替换的旧处理器
    pub fn register(
        &mut self,
        processor: Arc<dyn PreprocessingProcessor>,
    ) -> Option<Arc<dyn PreprocessingProcessor>> {
        self.processors.insert(processor.kind(), processor)
    }

    pub fn get(&self, kind: MaterialKind) -> Option<&Arc<dyn PreprocessingProcessor>> {
        self.processors.get(&kind)
    }
}

/// 本地插件目录
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileProcessor;

#[async_trait]
impl PreprocessingProcessor for LocalFileProcessor {
    fn kind(&self) -> MaterialKind {
        MaterialKind::LocalFile
    }

    async fn process(
        &self,
        material: &Material,
        cancel: &CancellationToken,
    ) -> Result<Workpiece, PluginError> {
        let Material::LocalFile(path) = material else {
            return Err(PluginError::UnsupportedMaterial(material.to_string()));
        };
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let (plugin_dir, manifest_path) = if path.is_dir() {
            (path.clone(), path.join(MANIFEST_FILE))
        } else {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (dir, path.clone())
        };
        let manifest_text = read_manifest(&manifest_path).await?;

        Ok(Workpiece::new(
            material.clone(),
            manifest_text,
            plugin_dir.clone(),
            PluginLocation::Local(plugin_dir),
        ))
    }
}

/// 本地插件包，解压到 `<cache_dir>/archives/<路径摘要>`
#[derive(Clone)]
pub struct ArchiveProcessor {
    cache_dir: PathBuf,
    extractor: Arc<dyn PackageExtractor>,
}

impl ArchiveProcessor {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self::with_extractor(cache_dir, Arc::new(ArchiveExtractor::new()))
    }

    pub fn with_extractor(cache_dir: PathBuf, extractor: Arc<dyn PackageExtractor>) -> Self {
        Self {
            cache_dir,
            extractor,
        }
    }

    /// 解压并定位插件根目录，返回 (根目录, 清单文本)
    async fn unpack(
        &self,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, String), PluginError> {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if !archive.is_file() {
            return Err(PluginError::ManifestNotFound(archive.to_path_buf()));
        }

        let target = self.cache_dir.join("archives").join(cache_key(archive));
        if fs::metadata(&target).await.is_ok() {
            fs::remove_dir_all(&target).await?;
        }

        let extractor = self.extractor.clone();
        let source = archive.to_path_buf();
        let dest = target.clone();
        let root = tokio::task::spawn_blocking(move || {
            extractor.extract(&source, &dest)?;
            find_plugin_root(&dest)
        })
        .await
        .map_err(|e| PluginError::Extract(e.to_string()))?
        .map_err(|e| PluginError::Extract(e.to_string()))?;

        debug!(
            "[管道] 已解压插件包 {} -> {}",
            archive.display(),
            root.display()
        );
        let manifest_text = read_manifest(&root.join(MANIFEST_FILE)).await?;
        Ok((root, manifest_text))
    }
}

#[async_trait]
impl PreprocessingProcessor for ArchiveProcessor {
    fn kind(&self) -> MaterialKind {
        MaterialKind::Archive
    }

    async fn process(
        &self,
        material: &Material,
        cancel: &CancellationToken,
    ) -> Result<Workpiece, PluginError> {
        let Material::Archive(path) = material else {
            return Err(PluginError::UnsupportedMaterial(material.to_string()));
        };
        let (root, manifest_text) = self.unpack(path, cancel).await?;
        Ok(Workpiece::new(
            material.clone(),
            manifest_text,
            root,
            PluginLocation::Local(path.clone()),
        ))
    }
}

/// 远程插件包
pub struct HttpProcessor {
    cache_dir: PathBuf,
    downloader: Arc<dyn Downloader>,
    archive: ArchiveProcessor,
}

impl HttpProcessor {
    pub fn new(cache_dir: PathBuf, downloader: Arc<dyn Downloader>, archive: ArchiveProcessor) -> Self {
        Self {
            cache_dir,
            downloader,
            archive,
        }
    }
}

#[async_trait]
impl PreprocessingProcessor for HttpProcessor {
    fn kind(&self) -> MaterialKind {
        MaterialKind::Remote
    }

    async fn process(
        &self,
        material: &Material,
        cancel: &CancellationToken,
    ) -> Result<Workpiece, PluginError> {
        let Material::Remote(url) = material else {
            return Err(PluginError::UnsupportedMaterial(material.to_string()));
        };

        let file_name = file_name_from_url(url)
            .filter(|name| PackageFormat::from_extension(Path::new(name)).is_some())
            .unwrap_or_else(|| "package.zip".to_string());
        let package = self
            .cache_dir
            .join("downloads")
            .join(format!("{}-{}", cache_key(Path::new(url)), file_name));

        let no_progress = |_: u64, _: u64| {};
        self.downloader
            .download(url, &package, &no_progress, cancel)
            .await
            .map_err(|e| match e {
                InstallError::Cancelled => PluginError::Cancelled,
                other => PluginError::Download(format!("{}: {}", sanitize_url(url), other)),
            })?;

        let unpacked = self.archive.unpack(&package, cancel).await;
        let _ = fs::remove_file(&package).await;
        let (root, manifest_text) = unpacked?;

        Ok(Workpiece::new(
            material.clone(),
            manifest_text,
            root,
            PluginLocation::Remote(url.clone()),
        ))
    }
}

async fn read_manifest(path: &Path) -> Result<String, PluginError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PluginError::ManifestNotFound(path.to_path_buf()))
        }
        Err(e) => Err(PluginError::IoError(e)),
    }
}

/// 来源路径的短摘要，作为缓存目录名
fn cache_key(source: &Path) -> String {
    let digest = Sha256::digest(source.to_string_lossy().as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::installer::DownloadProgressFn;
    use crate::plugin::testing::{manifest_json, write_plugin_dir, write_plugin_zip};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CopyDownloader {
        source: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for CopyDownloader {
        async fn download(
            &self,
            _url: &str,
            target: &Path,
            on_progress: DownloadProgressFn<'_>,
            _cancel: &CancellationToken,
        ) -> Result<u64, InstallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(target.parent().unwrap())?;
            let size = std::fs::copy(&self.source, target)?;
            on_progress(size, size);
            Ok(size)
        }
    }

    #[tokio::test]
    async fn test_local_file_processor_reads_manifest() {
        let dir = TempDir::new().unwrap();
        let plugin_dir = write_plugin_dir(dir.path(), "hello", "1.0.0", 0, &[]);
        let cancel = CancellationToken::new();

        let from_dir = LocalFileProcessor
            .process(&Material::LocalFile(plugin_dir.clone()), &cancel)
            .await
            .unwrap();
        assert_eq!(from_dir.plugin_dir, plugin_dir);
        assert_eq!(from_dir.location, PluginLocation::Local(plugin_dir.clone()));
        assert!(from_dir.manifest_text.contains("\"hello\""));

        let from_file = LocalFileProcessor
            .process(&Material::LocalFile(plugin_dir.join(MANIFEST_FILE)), &cancel)
            .await
            .unwrap();
        assert_eq!(from_file.plugin_dir, plugin_dir);
    }

    #[tokio::test]
    async fn test_local_file_processor_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let err = LocalFileProcessor
            .process(
                &Material::LocalFile(dir.path().to_path_buf()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ManifestNotFound(_)));
    }

    #[tokio::test]
    async fn test_processor_rejects_other_kind() {
        let err = LocalFileProcessor
            .process(
                &Material::Remote("https://example.com/a.zip".to_string()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedMaterial(_)));
    }

    #[tokio::test]
    async fn test_archive_processor_extracts_to_cache() {
        let dir = TempDir::new().unwrap();
        let archive = write_plugin_zip(dir.path(), "zipped", "1.0.0", &[]);
        let processor = ArchiveProcessor::new(dir.path().join("cache"));

        let workpiece = processor
            .process(&Material::Archive(archive.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(workpiece.plugin_dir.starts_with(dir.path().join("cache")));
        assert!(workpiece.plugin_dir.join("lib/plugin.bin").is_file());
        assert_eq!(workpiece.location, PluginLocation::Local(archive.clone()));

        // 同一插件包再次处理时覆盖原缓存
        let again = processor
            .process(&Material::Archive(archive), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.plugin_dir, workpiece.plugin_dir);
    }

    #[tokio::test]
    async fn test_http_processor_downloads_then_extracts() {
        let dir = TempDir::new().unwrap();
        let archive = write_plugin_zip(dir.path(), "remote", "1.0.0", &[]);
        let downloader = Arc::new(CopyDownloader {
            source: archive,
            calls: AtomicUsize::new(0),
        });
        let cache = dir.path().join("cache");
        let registry = ProcessorRegistry::with_defaults(cache.clone(), downloader.clone());

        let url = "https://example.com/plugins/remote.zip?token=abc".to_string();
        let processor = registry.get(MaterialKind::Remote).unwrap();
        let workpiece = processor
            .process(&Material::Remote(url.clone()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(workpiece.location, PluginLocation::Remote(url));
        assert_eq!(workpiece.manifest_text, manifest_json("remote", "1.0.0", 0, &[]));
        let leftovers = std::fs::read_dir(cache.join("downloads")).unwrap().count();
        assert_eq!(leftovers, 0, "下载的插件包解压后应删除");
    }

    #[test]
    fn test_registry_replaces_processor() {
        let mut registry = ProcessorRegistry::new();
        assert!(registry.get(MaterialKind::LocalFile).is_none());
        assert!(registry.register(Arc::new(LocalFileProcessor)).is_none());
        assert!(registry.register(Arc::new(LocalFileProcessor)).is_some());
        assert!(registry.get(MaterialKind::LocalFile).is_some());
        assert!(registry.get(MaterialKind::Archive).is_none());
    }
}
