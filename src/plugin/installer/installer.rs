//! 插件安装器核心实现
//!
//! 提供插件安装与计划升级/移除的核心逻辑：
//! - install: 获取 (下载) → 验证 → 依赖解析 → 按依赖顺序解压登记
//! - plan_upgrade / plan_remove: 只写入计划记录，不触碰正在使用的插件文件
//! - check_upgrade_and_remove: 启动时、扫描之前执行全部计划

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::downloader::{file_name_from_url, Downloader};
use super::extractor::{copy_dir_recursive, find_plugin_root, ArchiveExtractor, PackageExtractor};
use super::plan::PlanStore;
use super::registry::PluginRegistry;
use super::types::{
    CheckReport, InstallError, InstallOutcome, InstallSource, InstallStage, InstallStatus,
    InstalledPlugin, PackageFormat, PlanRemoveRecord, PlanUpgradeRecord,
};
use super::validator::PackageValidator;
use crate::config::UpgradeStrategy;
use crate::plugin::checker::{DependencyChecker, SortableEntry};
use crate::plugin::pipeline::SessionContext;
use crate::plugin::progress::{ProgressCallback, ProgressStep, ProgressTracker, SubProgress};
use crate::plugin::types::{PluginDescriptor, PluginId, PluginLocation};
use crate::plugin::version::PluginVersion;
use crate::settings::SettingsStore;

/// 暂存升级包的目录名 (位于插件目录下)
pub const STAGING_DIR: &str = ".staging";

const ACQUIRE_START: f64 = 0.0;
const ACQUIRE_WIDTH: f64 = 0.4;
const RESOLVE_START: f64 = 0.4;
const RESOLVE_WIDTH: f64 = 0.5;
const EXTRACT_START: f64 = 0.9;
const EXTRACT_WIDTH: f64 = 0.1;

/// 已获取到本地的插件包
struct Acquired {
    source: InstallSource,
    package: PathBuf,
    /// 由安装器下载到临时目录，结束后删除
    owned: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    format: PackageFormat,
}

/// 插件安装器
///
/// 负责协调整个安装流程
pub struct PluginInstaller {
    plugins_dir: PathBuf,
    temp_dir: PathBuf,
    host_version: PluginVersion,
    strategy: UpgradeStrategy,
    registry: PluginRegistry,
    plans: PlanStore,
    downloader: Arc<dyn Downloader>,
    extractor: Arc<dyn PackageExtractor>,
    validator: PackageValidator,
}

impl PluginInstaller {
    pub fn new(
        plugins_dir: PathBuf,
        temp_dir: PathBuf,
        registry: PluginRegistry,
        settings: Arc<dyn SettingsStore>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            plugins_dir,
            temp_dir,
            host_version: PluginVersion::parse(env!("CARGO_PKG_VERSION")).unwrap_or_default(),
            strategy: UpgradeStrategy::default(),
            registry,
            plans: PlanStore::new(settings),
            downloader,
            extractor: Arc::new(ArchiveExtractor::new()),
            validator: PackageValidator::new(),
        }
    }

    pub fn with_host_version(mut self, host_version: PluginVersion) -> Self {
        self.host_version = host_version;
        self
    }

    pub fn with_upgrade_strategy(mut self, strategy: UpgradeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PackageExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// 安装一批插件
    ///
    /// 全部来源先获取并验证，整批通过依赖检查后才开始写插件目录；
    /// 已安装旧版本的插件只暂存为升级计划，返回顺序即依赖顺序
    pub async fn install(
        &self,
        sources: Vec<InstallSource>,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstallOutcome>, InstallError> {
        let tracker = ProgressTracker::new(progress);
        let mut acquired = Vec::with_capacity(sources.len());

        let result = self
            .run_install(sources, &tracker, cancel, &mut acquired)
            .await;

        for item in acquired.iter().filter(|a| a.owned) {
            let _ = fs::remove_file(&item.package);
        }

        match &result {
            Ok(outcomes) => tracker.report(
                ProgressStep::Success,
                1.0,
                format!("安装完成: {} 个插件", outcomes.len()),
            ),
            Err(e) => {
                error!("[安装器] 安装失败: {}", e);
                tracker.report(ProgressStep::Failed, tracker.current(), e.to_string());
            }
        }
        result
    }

    async fn run_install(
        &self,
        sources: Vec<InstallSource>,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
        acquired: &mut Vec<Acquired>,
    ) -> Result<Vec<InstallOutcome>, InstallError> {
        fs::create_dir_all(&self.temp_dir)?;

        // 阶段 1: 获取并验证
        let total = sources.len();
        let mut entries = Vec::with_capacity(total);
        for (index, source) in sources.into_iter().enumerate() {
            let sub = SubProgress::new(ACQUIRE_START, ACQUIRE_WIDTH, index, total);
            acquired.push(self.acquire(source, sub, tracker, cancel).await?);
            let item = &acquired[index];

            tracker.report_sub(
                ProgressStep::Preprocessing,
                sub.map(0.8),
                InstallStage::Validating.to_string(),
                0.0,
                format!("验证插件包: {}", item.source.describe()),
            );
            let format = self.validator.validate_format(&item.package)?;
            self.validator
                .validate_integrity(&item.package, item.source.sha256())?;
            let descriptor = self
                .validator
                .extract_and_validate_manifest(&item.package, format)?;
            self.ensure_host_supported(&descriptor)?;
            tracker.report_sub(
                ProgressStep::Preprocessing,
                sub.end(),
                InstallStage::Validating.to_string(),
                1.0,
                format!("{} v{} 验证通过", descriptor.id, descriptor.version),
            );

            let location = match &item.source {
                InstallSource::Url { url, .. } => PluginLocation::Remote(url.clone()),
                InstallSource::Local { .. } => PluginLocation::Local(item.package.clone()),
            };
            entries.push(SortableEntry::new(
                Arc::new(descriptor),
                location,
                Candidate { index, format },
            ));
        }

        // 任何写操作之前完成全部检查
        for entry in &entries {
            self.ensure_installable(&entry.descriptor)?;
        }

        // 阶段 2: 依赖解析
        tracker.report_sub(
            ProgressStep::MainProcessing,
            RESOLVE_START,
            InstallStage::Resolving.to_string(),
            0.0,
            "解析依赖...",
        );
        let checked = DependencyChecker::new(&self.registry).determine_load_order(entries)?;
        tracker.report_sub(
            ProgressStep::MainProcessing,
            RESOLVE_START + RESOLVE_WIDTH,
            InstallStage::Resolving.to_string(),
            1.0,
            format!("依赖解析完成: {} 个插件", checked.result.len()),
        );

        // 阶段 3: 按依赖顺序解压或暂存
        let total = checked.result.len();
        let mut outcomes = Vec::with_capacity(total);
        for (i, entry) in checked.result.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    "[安装器] 安装已取消，已完成 {}/{} 个插件",
                    outcomes.len(),
                    total
                );
                return Err(InstallError::Cancelled);
            }

            let sub = SubProgress::new(EXTRACT_START, EXTRACT_WIDTH, i, total);
            let item = &acquired[entry.payload.index];
            let outcome = if checked.needs_upgrade(entry.id()) {
                tracker.report_sub(
                    ProgressStep::Outbounding,
                    sub.offset,
                    InstallStage::Staging.to_string(),
                    0.0,
                    format!("暂存升级: {}", entry.id()),
                );
                self.stage_upgrade(&entry.descriptor, &item.package, entry.payload.format)?
            } else {
                tracker.report_sub(
                    ProgressStep::Outbounding,
                    sub.offset,
                    InstallStage::Extracting.to_string(),
                    0.0,
                    format!("解压插件: {}", entry.id()),
                );
                self.install_package(&entry.descriptor, &item.package, item.source.clone())
                    .await?
            };
            tracker.report_sub(
                ProgressStep::Outbounding,
                sub.end(),
                InstallStage::Complete.to_string(),
                1.0,
                format!("{} v{} 已处理", outcome.id, outcome.version),
            );
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn acquire(
        &self,
        source: InstallSource,
        sub: SubProgress,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<Acquired, InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        if let InstallSource::Local { path, .. } = &source {
            let package = PathBuf::from(path);
            return Ok(Acquired {
                source,
                package,
                owned: false,
            });
        }
        let url = source.describe().to_string();

        let file_name = file_name_from_url(&url)
            .filter(|name| PackageFormat::from_extension(Path::new(name)).is_some())
            .unwrap_or_else(|| "package.zip".to_string());
        let target = self
            .temp_dir
            .join("downloads")
            .join(format!("{}-{}", Uuid::new_v4(), file_name));

        let on_progress = |downloaded: u64, total_bytes: u64| {
            let ratio = if total_bytes > 0 {
                downloaded as f64 / total_bytes as f64
            } else {
                0.0
            };
            tracker.report_sub(
                ProgressStep::Preprocessing,
                sub.map(ratio * 0.8),
                InstallStage::Downloading.to_string(),
                ratio,
                format!("下载中 {}/{} bytes", downloaded, total_bytes),
            );
        };

        if let Err(e) = self
            .downloader
            .download(&url, &target, &on_progress, cancel)
            .await
        {
            let _ = fs::remove_file(&target);
            return Err(e);
        }

        Ok(Acquired {
            source,
            package: target,
            owned: true,
        })
    }

    fn ensure_host_supported(&self, descriptor: &PluginDescriptor) -> Result<(), InstallError> {
        if descriptor.supports_host(&self.host_version) {
            return Ok(());
        }
        Err(InstallError::HostVersionMismatch {
            plugin: descriptor.id.clone(),
            required: descriptor.min_host_version.clone().unwrap_or_default(),
            actual: self.host_version.clone(),
        })
    }

    fn ensure_installable(&self, descriptor: &PluginDescriptor) -> Result<(), InstallError> {
        if let Some(installed) = self.registry.get(&descriptor.id)? {
            if installed.version >= descriptor.version {
                return Err(InstallError::AlreadyExists(format!(
                    "{} (已安装 v{}，待安装 v{})",
                    descriptor.id, installed.version, descriptor.version
                )));
            }
        }
        if self.plans.pending_upgrade(&descriptor.id)?.is_some() {
            return Err(InstallError::AlreadyPlanned(descriptor.id.to_string()));
        }
        Ok(())
    }

    async fn install_package(
        &self,
        descriptor: &PluginDescriptor,
        package: &Path,
        source: InstallSource,
    ) -> Result<InstallOutcome, InstallError> {
        let install_path = self.plugins_dir.join(descriptor.id.key());
        self.ensure_plugin_path(&install_path)?;
        self.deploy_blocking(package, &install_path, true).await?;

        let installed = InstalledPlugin::from_descriptor(descriptor, install_path.clone(), source);
        if let Err(e) = self.registry.register(&installed) {
            let _ = fs::remove_dir_all(&install_path);
            return Err(e);
        }

        info!(
            "[安装器] 插件 {} v{} 安装成功: {}",
            descriptor.id,
            descriptor.version,
            install_path.display()
        );
        Ok(InstallOutcome {
            id: descriptor.id.clone(),
            version: descriptor.version.clone(),
            status: InstallStatus::Installed,
            install_path,
        })
    }

    fn stage_upgrade(
        &self,
        descriptor: &PluginDescriptor,
        package: &Path,
        format: PackageFormat,
    ) -> Result<InstallOutcome, InstallError> {
        let installed = self
            .registry
            .get(&descriptor.id)?
            .ok_or_else(|| InstallError::NotFound(descriptor.id.to_string()))?;

        let staged = self.stage_package(&descriptor.id, package, format)?;
        let record = PlanUpgradeRecord {
            id: descriptor.id.clone(),
            current_path: installed.install_path.clone(),
            source_path: staged.clone(),
            version: descriptor.version.clone(),
            planned_at: Utc::now(),
        };
        if let Err(e) = self.plans.add_upgrade(record) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        Ok(InstallOutcome {
            id: descriptor.id.clone(),
            version: descriptor.version.clone(),
            status: InstallStatus::UpgradeStaged,
            install_path: installed.install_path,
        })
    }

    /// 登记升级计划，下次启动时生效
    ///
    /// 新插件包被复制到暂存目录，调用方之后可以删除原文件
    pub fn plan_upgrade(
        &self,
        id: &PluginId,
        current_path: &Path,
        new_archive: &Path,
    ) -> Result<PlanUpgradeRecord, InstallError> {
        if self.plans.pending_upgrade(id)?.is_some() {
            return Err(InstallError::AlreadyPlanned(id.to_string()));
        }
        self.ensure_plugin_path(current_path)?;

        let format = self.validator.validate_format(new_archive)?;
        let descriptor = self
            .validator
            .extract_and_validate_manifest(new_archive, format)?;
        if descriptor.id != *id {
            return Err(InstallError::InvalidManifest(format!(
                "插件包 id {} 与计划升级的插件 {} 不一致",
                descriptor.id, id
            )));
        }
        self.ensure_host_supported(&descriptor)?;

        let staged = self.stage_package(id, new_archive, format)?;
        let record = PlanUpgradeRecord {
            id: descriptor.id.clone(),
            current_path: current_path.to_path_buf(),
            source_path: staged.clone(),
            version: descriptor.version.clone(),
            planned_at: Utc::now(),
        };
        if let Err(e) = self.plans.add_upgrade(record.clone()) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
        Ok(record)
    }

    /// 登记移除计划；重复登记返回 false
    pub fn plan_remove(&self, id: &PluginId, path: &Path) -> Result<bool, InstallError> {
        self.ensure_plugin_path(path)?;
        self.plans.add_remove(PlanRemoveRecord {
            id: id.clone(),
            target_path: path.to_path_buf(),
            planned_at: Utc::now(),
        })
    }

    /// 按注册表中的安装目录登记卸载
    pub fn plan_uninstall(&self, id: &PluginId) -> Result<bool, InstallError> {
        let installed = self
            .registry
            .get(id)?
            .ok_or_else(|| InstallError::NotFound(id.to_string()))?;
        self.plan_remove(id, &installed.install_path)
    }

    /// 执行全部升级/移除计划
    ///
    /// 每个会话只执行一次；记录只在对应操作成功后删除，失败的留待下次启动
    pub fn check_upgrade_and_remove(
        &self,
        session: &mut SessionContext,
        cancel: &CancellationToken,
    ) -> Result<CheckReport, InstallError> {
        if session.is_upgrade_checked() {
            debug!("[安装器] 本会话已执行过升级/移除检查");
            return Ok(CheckReport::default());
        }

        let mut report = CheckReport::default();

        for record in self.plans.removes()? {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            match self.apply_remove(&record) {
                Ok(()) => {
                    self.plans.complete_remove(&record.id)?;
                    info!("[安装器] 已移除插件: {}", record.id);
                    report.removed.push(record.id);
                }
                Err(e) => {
                    warn!("[安装器] 移除插件 {} 失败: {}", record.id, e);
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }

        for record in self.plans.upgrades()? {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            match self.apply_upgrade(&record) {
                Ok(()) => {
                    self.plans.complete_upgrade(&record.id)?;
                    info!("[安装器] 已升级插件: {} -> v{}", record.id, record.version);
                    report.upgraded.push(record.id);
                }
                Err(e) => {
                    warn!("[安装器] 升级插件 {} 失败: {}", record.id, e);
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }

        session.mark_upgrade_checked();
        Ok(report)
    }

    fn apply_remove(&self, record: &PlanRemoveRecord) -> Result<(), InstallError> {
        self.ensure_plugin_path(&record.target_path)?;
        match fs::symlink_metadata(&record.target_path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&record.target_path)?,
            Ok(_) => fs::remove_file(&record.target_path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.registry.unregister(&record.id)?;

        // 已被移除的插件不再升级
        if let Some(upgrade) = self.plans.pending_upgrade(&record.id)? {
            let _ = fs::remove_file(&upgrade.source_path);
            self.plans.complete_upgrade(&record.id)?;
            info!("[安装器] 插件 {} 已移除，丢弃其升级计划", record.id);
        }
        Ok(())
    }

    fn apply_upgrade(&self, record: &PlanUpgradeRecord) -> Result<(), InstallError> {
        self.ensure_plugin_path(&record.current_path)?;
        if !record.source_path.is_file() {
            return Err(InstallError::InstallFailed(format!(
                "插件 {} 的暂存包不存在: {}",
                record.id,
                record.source_path.display()
            )));
        }

        let format = self.validator.validate_format(&record.source_path)?;
        let descriptor = self
            .validator
            .extract_and_validate_manifest(&record.source_path, format)?;
        if descriptor.id != record.id {
            return Err(InstallError::InvalidManifest(format!(
                "暂存包 id {} 与升级计划 {} 不一致",
                descriptor.id, record.id
            )));
        }

        let clean = matches!(self.strategy, UpgradeStrategy::Remove);
        self.deploy(&record.source_path, &record.current_path, clean)?;

        let source = self
            .registry
            .get(&record.id)?
            .map(|p| p.source)
            .unwrap_or_else(|| InstallSource::local(&record.source_path));
        self.registry.register(&InstalledPlugin::from_descriptor(
            &descriptor,
            record.current_path.clone(),
            source,
        ))?;

        let _ = fs::remove_file(&record.source_path);
        Ok(())
    }

    /// 插件目录必须是插件根目录的直接子目录，且不能是隐藏目录
    fn ensure_plugin_path(&self, path: &Path) -> Result<(), InstallError> {
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(true, |name| name.starts_with('.'));
        if hidden || path.parent() != Some(self.plugins_dir.as_path()) {
            return Err(InstallError::InstallFailed(format!(
                "插件路径不在插件目录内: {}",
                path.display()
            )));
        }
        Ok(())
    }

    fn deploy(&self, package: &Path, target: &Path, clean: bool) -> Result<(), InstallError> {
        deploy_package(self.extractor.as_ref(), &self.temp_dir, package, target, clean)
    }

    /// 在阻塞线程池中解压部署，避免占用运行时工作线程
    async fn deploy_blocking(
        &self,
        package: &Path,
        target: &Path,
        clean: bool,
    ) -> Result<(), InstallError> {
        let extractor = self.extractor.clone();
        let temp_dir = self.temp_dir.clone();
        let package = package.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            deploy_package(extractor.as_ref(), &temp_dir, &package, &target, clean)
        })
        .await
        .map_err(|e| InstallError::InstallFailed(format!("解压任务异常退出: {}", e)))?
    }

    fn stage_package(
        &self,
        id: &PluginId,
        package: &Path,
        format: PackageFormat,
    ) -> Result<PathBuf, InstallError> {
        let staging_dir = self.plugins_dir.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir)?;
        let staged = staging_dir.join(format!(
            "{}-{}.{}",
            id.key(),
            Uuid::new_v4(),
            format.extension()
        ));
        fs::copy(package, &staged)?;
        Ok(staged)
    }

    /// 获取已安装插件列表
    pub fn list_installed(&self) -> Result<Vec<InstalledPlugin>, InstallError> {
        self.registry.list()
    }

    /// 获取插件信息
    pub fn get_installed(&self, id: &PluginId) -> Result<Option<InstalledPlugin>, InstallError> {
        self.registry.get(id)
    }

    /// 检查插件是否已安装
    pub fn is_installed(&self, id: &PluginId) -> Result<bool, InstallError> {
        self.registry.exists(id)
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

/// 解压到临时目录后复制到目标目录；`clean` 为 true 时先删除目标目录
fn deploy_package(
    extractor: &dyn PackageExtractor,
    temp_dir: &Path,
    package: &Path,
    target: &Path,
    clean: bool,
) -> Result<(), InstallError> {
    let extract_dir = temp_dir.join(format!("extract-{}", Uuid::new_v4()));
    let result = deploy_via(extractor, &extract_dir, package, target, clean);
    let _ = fs::remove_dir_all(&extract_dir);
    result
}

fn deploy_via(
    extractor: &dyn PackageExtractor,
    extract_dir: &Path,
    package: &Path,
    target: &Path,
    clean: bool,
) -> Result<(), InstallError> {
    extractor.extract(package, extract_dir)?;
    let root = find_plugin_root(extract_dir)?;
    if clean && target.exists() {
        fs::remove_dir_all(target)?;
    }
    copy_dir_recursive(&root, target)
}
