//! 插件包验证器
//!
//! 主要功能：
//! - 验证包格式（zip/tar.gz）与压缩包完整性
//! - 读取并校验包内清单
//! - 验证包完整性（SHA256 校验和）

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::types::{InstallError, PackageFormat};
use crate::plugin::types::{PluginDescriptor, PluginManifest, MANIFEST_FILE};

/// 清单文件在包内允许的最大深度 (根目录或一级子目录)
const MAX_MANIFEST_DEPTH: usize = 2;

/// 包验证器
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageValidator;

impl PackageValidator {
    pub fn new() -> Self {
        Self
    }

    /// 验证包格式（zip/tar.gz）
    ///
    /// 检测扩展名、文件魔数并尝试遍历压缩包结构
    pub fn validate_format(&self, path: &Path) -> Result<PackageFormat, InstallError> {
        if !path.is_file() {
            return Err(InstallError::InvalidPackage(format!(
                "文件不存在: {}",
                path.display()
            )));
        }

        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            return Err(InstallError::InvalidPackage("文件为空".to_string()));
        }

        let format = PackageFormat::from_extension(path).ok_or_else(|| {
            InstallError::InvalidPackage(format!(
                "不支持的包格式，仅支持 .zip 和 .tar.gz: {}",
                path.display()
            ))
        })?;

        self.validate_magic_bytes(path, format)?;

        match format {
            PackageFormat::Zip => self.validate_zip_integrity(path)?,
            PackageFormat::TarGz => self.validate_targz_integrity(path)?,
        }

        Ok(format)
    }

    fn validate_magic_bytes(&self, path: &Path, format: PackageFormat) -> Result<(), InstallError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 2];
        reader
            .read_exact(&mut magic)
            .map_err(|e| InstallError::InvalidPackage(format!("无法读取文件头: {}", e)))?;

        let (expected, label) = match format {
            // PK
            PackageFormat::Zip => ([0x50, 0x4B], "ZIP"),
            // gzip
            PackageFormat::TarGz => ([0x1f, 0x8b], "tar.gz"),
        };
        if magic != expected {
            return Err(InstallError::InvalidPackage(format!(
                "无效的 {} 文件格式",
                label
            )));
        }
        Ok(())
    }

    fn validate_zip_integrity(&self, path: &Path) -> Result<(), InstallError> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| InstallError::InvalidPackage(format!("无法读取 ZIP 文件: {}", e)))?;

        if archive.len() == 0 {
            return Err(InstallError::InvalidPackage("ZIP 压缩包为空".to_string()));
        }

        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(|e| {
                InstallError::InvalidPackage(format!("ZIP 文件损坏，无法读取条目 {}: {}", i, e))
            })?;
            if file.name().is_empty() {
                return Err(InstallError::InvalidPackage(format!(
                    "ZIP 条目 {} 的文件名无效",
                    i
                )));
            }
        }

        Ok(())
    }

    fn validate_targz_integrity(&self, path: &Path) -> Result<(), InstallError> {
        let file = File::open(path)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

        let mut entry_count = 0;
        for entry in archive
            .entries()
            .map_err(|e| InstallError::InvalidPackage(format!("无法读取 tar.gz 文件: {}", e)))?
        {
            let entry = entry
                .map_err(|e| InstallError::InvalidPackage(format!("tar.gz 文件损坏: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| InstallError::InvalidPackage(format!("tar.gz 条目路径无效: {}", e)))?;
            if path.as_os_str().is_empty() {
                return Err(InstallError::InvalidPackage(
                    "tar.gz 条目路径为空".to_string(),
                ));
            }
            entry_count += 1;
        }

        if entry_count == 0 {
            return Err(InstallError::InvalidPackage(
                "tar.gz 压缩包为空".to_string(),
            ));
        }

        Ok(())
    }

    /// 验证包完整性（校验和）
    ///
    /// 未提供校验和时跳过
    pub fn validate_integrity(
        &self,
        path: &Path,
        checksum: Option<&str>,
    ) -> Result<(), InstallError> {
        let Some(expected) = checksum else {
            return Ok(());
        };

        let mut reader = BufReader::new(File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        let actual = format!("{:x}", hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(InstallError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        Ok(())
    }

    /// 读取包内清单并转换为插件描述
    pub fn extract_and_validate_manifest(
        &self,
        path: &Path,
        format: PackageFormat,
    ) -> Result<PluginDescriptor, InstallError> {
        let manifest_content = match format {
            PackageFormat::Zip => self.extract_manifest_from_zip(path)?,
            PackageFormat::TarGz => self.extract_manifest_from_targz(path)?,
        };

        let descriptor = PluginManifest::from_json(&manifest_content)?.into_descriptor()?;
        Ok(descriptor)
    }

    /// 清单路径是否位于根目录或一级子目录
    fn is_manifest_entry(entry: &Path) -> bool {
        let components: Vec<_> = entry.components().collect();
        !components.is_empty()
            && components.len() <= MAX_MANIFEST_DEPTH
            && entry.file_name().is_some_and(|n| n == MANIFEST_FILE)
            && !entry.to_string_lossy().contains("__MACOSX")
    }

    fn extract_manifest_from_zip(&self, path: &Path) -> Result<String, InstallError> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| InstallError::InvalidPackage(format!("无法读取 ZIP 文件: {}", e)))?;

        // 优先取层级最浅的清单
        let mut best: Option<(usize, usize)> = None;
        for i in 0..archive.len() {
            let file = archive
                .by_index(i)
                .map_err(|e| InstallError::InvalidPackage(format!("无法读取 ZIP 条目: {}", e)))?;
            let Some(name) = file.enclosed_name().map(Path::to_path_buf) else {
                continue;
            };
            if Self::is_manifest_entry(&name) {
                let depth = name.components().count();
                if best.map_or(true, |(d, _)| depth < d) {
                    best = Some((depth, i));
                }
            }
        }

        let Some((_, index)) = best else {
            return Err(InstallError::InvalidPackage(format!(
                "压缩包中未找到 {}",
                MANIFEST_FILE
            )));
        };

        let mut file = archive
            .by_index(index)
            .map_err(|e| InstallError::InvalidPackage(format!("无法读取 ZIP 条目: {}", e)))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| InstallError::InvalidManifest(format!("无法读取 {}: {}", MANIFEST_FILE, e)))?;
        Ok(content)
    }

    fn extract_manifest_from_targz(&self, path: &Path) -> Result<String, InstallError> {
        let file = File::open(path)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

        let mut found: Option<(usize, String)> = None;
        for entry in archive
            .entries()
            .map_err(|e| InstallError::InvalidPackage(format!("无法读取 tar.gz 文件: {}", e)))?
        {
            let mut entry = entry
                .map_err(|e| InstallError::InvalidPackage(format!("tar.gz 条目读取失败: {}", e)))?;
            let entry_path = entry
                .path()
                .map_err(|e| InstallError::InvalidPackage(format!("tar.gz 条目路径无效: {}", e)))?
                .into_owned();

            if !Self::is_manifest_entry(&entry_path) {
                continue;
            }
            let depth = entry_path.components().count();
            if found.as_ref().is_some_and(|(d, _)| *d <= depth) {
                continue;
            }

            let mut content = String::new();
            entry.read_to_string(&mut content).map_err(|e| {
                InstallError::InvalidManifest(format!("无法读取 {}: {}", MANIFEST_FILE, e))
            })?;
            found = Some((depth, content));
        }

        found.map(|(_, content)| content).ok_or_else(|| {
            InstallError::InvalidPackage(format!("压缩包中未找到 {}", MANIFEST_FILE))
        })
    }
}
