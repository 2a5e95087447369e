//! 插件包解压
//!
//! 支持 zip 与 tar.gz，解压后定位包含 plugin.json 的插件根目录

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::types::{InstallError, PackageFormat};
use crate::plugin::types::MANIFEST_FILE;

/// 解压插件包
pub trait PackageExtractor: Send + Sync {
    fn extract(&self, archive: &Path, target_dir: &Path) -> Result<(), InstallError>;
}

/// 按扩展名选择 zip / tar.gz 解压
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_zip(&self, path: &Path, dest: &Path) -> Result<(), InstallError> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| InstallError::ExtractFailed(format!("无法读取 ZIP 文件: {}", e)))?;

        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(|e| {
                InstallError::ExtractFailed(format!("无法读取 ZIP 条目 {}: {}", i, e))
            })?;

            // enclosed_name 拒绝越出目标目录的条目
            let outpath = match file.enclosed_name() {
                Some(path) => dest.join(path),
                None => continue,
            };

            // 跳过 macOS 元数据
            if outpath.to_string_lossy().contains("__MACOSX") {
                continue;
            }

            if file.is_dir() {
                fs::create_dir_all(&outpath)?;
                continue;
            }

            if let Some(p) = outpath.parent() {
                fs::create_dir_all(p)?;
            }
            let mut outfile = File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = file.unix_mode() {
                    fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
                }
            }
        }

        Ok(())
    }

    fn extract_targz(&self, path: &Path, dest: &Path) -> Result<(), InstallError> {
        let file = File::open(path)?;
        let gz = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(gz);

        for entry in archive
            .entries()
            .map_err(|e| InstallError::ExtractFailed(format!("无法读取 tar.gz: {}", e)))?
        {
            let mut entry = entry
                .map_err(|e| InstallError::ExtractFailed(format!("tar.gz 条目读取失败: {}", e)))?;

            // unpack_in 同样拒绝越出目标目录的条目
            entry
                .unpack_in(dest)
                .map_err(|e| InstallError::ExtractFailed(format!("解压失败: {}", e)))?;
        }

        Ok(())
    }
}

impl PackageExtractor for ArchiveExtractor {
    fn extract(&self, archive: &Path, target_dir: &Path) -> Result<(), InstallError> {
        let format = PackageFormat::from_extension(archive).ok_or_else(|| {
            InstallError::InvalidPackage(format!(
                "不支持的包格式，仅支持 .zip 和 .tar.gz: {}",
                archive.display()
            ))
        })?;

        fs::create_dir_all(target_dir)?;
        match format {
            PackageFormat::Zip => self.extract_zip(archive, target_dir),
            PackageFormat::TarGz => self.extract_targz(archive, target_dir),
        }
    }
}

/// 查找插件根目录（包含 plugin.json 的目录）
///
/// 依次检查解压目录本身和一级子目录
pub fn find_plugin_root(extract_dir: &Path) -> Result<PathBuf, InstallError> {
    if extract_dir.join(MANIFEST_FILE).is_file() {
        return Ok(extract_dir.to_path_buf());
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(extract_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
        .collect();
    candidates.sort();

    candidates.into_iter().next().ok_or_else(|| {
        InstallError::InvalidPackage(format!("未找到 {} 文件", MANIFEST_FILE))
    })
}

/// 递归复制目录，已存在的文件被覆盖
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            // fs::copy 会连同权限位一起复制
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn write_targz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_zip_and_find_root() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("hello.zip");
        write_zip(
            &archive,
            &[("hello/plugin.json", "{}"), ("hello/lib/libhello.so", "bin")],
        );

        let target = dir.path().join("out");
        ArchiveExtractor::new().extract(&archive, &target).unwrap();

        let root = find_plugin_root(&target).unwrap();
        assert_eq!(root, target.join("hello"));
        assert!(root.join("lib/libhello.so").exists());
    }

    #[test]
    fn test_extract_targz() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("hello.tar.gz");
        write_targz(&archive, &[("plugin.json", "{}"), ("libhello.so", "bin")]);

        let target = dir.path().join("out");
        ArchiveExtractor::new().extract(&archive, &target).unwrap();
        assert_eq!(find_plugin_root(&target).unwrap(), target);
    }

    #[test]
    fn test_extract_unknown_format() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("hello.rar");
        fs::write(&archive, "x").unwrap();
        let result = ArchiveExtractor::new().extract(&archive, &dir.path().join("out"));
        assert!(matches!(result, Err(InstallError::InvalidPackage(_))));
    }

    #[test]
    fn test_find_root_missing_manifest() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        assert!(find_plugin_root(dir.path()).is_err());
    }

    #[test]
    fn test_copy_dir_overwrites() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "new").unwrap();
        fs::write(src.join("sub/b.txt"), "b").unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("a.txt"), "old").unwrap();
        fs::write(dst.join("keep.txt"), "keep").unwrap();

        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
        assert!(dst.join("keep.txt").exists());
    }
}
