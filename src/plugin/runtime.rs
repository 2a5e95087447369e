//! 插件运行时
//!
//! 组装配置、数据库、安装器、管道与加载器。启动顺序固定为：
//! 执行升级/移除计划 → 扫描插件目录 → 管道处理 → 预加载 → (可选) 实例化

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::checker::LayeredLedger;
use super::installer::{
    CheckReport, Downloader, HttpDownloader, InstallError, InstallOutcome, InstallSource,
    InstallStatus, InstalledPlugin, PlanUpgradeRecord, PluginInstaller, PluginRegistry,
};
use super::loader::{PluginEvent, PluginLoader};
use super::module::ModuleCollaborators;
use super::pipeline::{
    MainProcessor, Material, PipelineError, PluginPipeline, ProcessorRegistry, SessionContext,
};
use super::progress::{NoopProgressCallback, ProgressCallback};
use super::scanner::PluginScanner;
use super::types::{Plugin, PluginError, PluginId, PluginInfo};
use crate::config::{ConfigError, RuntimeConfig};
use crate::database::{self, DatabaseError, DbConnection};
use crate::settings::{SettingsStore, SqliteSettingsStore};

/// 运行时错误
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("数据库错误: {0}")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Install(#[from] InstallError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Plugin(#[from] PluginError),
}

/// 一次启动的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub check: CheckReport,
    pub preloaded: usize,
    pub instantiated: usize,
}

pub struct PluginRuntime {
    config: RuntimeConfig,
    installer: PluginInstaller,
    pipeline: PluginPipeline,
    loader: Arc<PluginLoader>,
    scanner: PluginScanner,
    session: Mutex<SessionContext>,
}

impl PluginRuntime {
    /// 使用动态链接库模块和 HTTP 下载器打开运行时
    pub fn open(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let conn = database::open_database(&config.database_path)?;
        let downloader = Arc::new(HttpDownloader::new(Duration::from_secs(
            config.download_timeout_secs,
        ))?);
        Self::with_collaborators(config, conn, ModuleCollaborators::native(), downloader)
    }

    pub fn with_collaborators(
        config: RuntimeConfig,
        conn: DbConnection,
        modules: ModuleCollaborators,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self, RuntimeError> {
        let host_version = config.parsed_host_version()?;
        let settings: Arc<dyn SettingsStore> = Arc::new(SqliteSettingsStore::new(conn.clone()));
        let registry = PluginRegistry::new(conn);

        let installer = PluginInstaller::new(
            config.plugins_dir.clone(),
            config.temp_dir.clone(),
            registry.clone(),
            settings.clone(),
            downloader.clone(),
        )
        .with_host_version(host_version.clone())
        .with_upgrade_strategy(config.upgrade_strategy);

        let loader = Arc::new(PluginLoader::new(modules.factory, settings));

        // 本进程已加载的插件优先，其次是已安装台账
        let ledger = LayeredLedger::new()
            .with_layer(loader.clone())
            .with_layer(Arc::new(registry));
        let main = MainProcessor::new(
            modules.loader,
            modules.resolver,
            Arc::new(ledger),
            host_version,
        )
        .with_max_concurrency(config.max_concurrency);
        let processors = ProcessorRegistry::with_defaults(config.temp_dir.join("pipeline"), downloader);

        let scanner = PluginScanner::new(config.plugins_dir.clone())
            .with_remote_feeds(config.remote_feeds.clone());

        Ok(Self {
            config,
            installer,
            pipeline: PluginPipeline::new(processors, main),
            loader,
            scanner,
            session: Mutex::new(SessionContext::new()),
        })
    }

    /// 启动：先执行升级/移除计划，再扫描并加载插件
    pub async fn start(
        &self,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<StartReport, RuntimeError> {
        let mut session = self.session.lock().await;

        let check = self.installer.check_upgrade_and_remove(&mut session, cancel)?;
        if !check.is_empty() {
            info!(
                "[运行时] 计划执行完成: 移除 {}，升级 {}，失败 {}",
                check.removed.len(),
                check.upgraded.len(),
                check.failed.len()
            );
        }

        let materials = self.scanner.scan().await?;
        self.pipeline.feed_all(materials);
        let products = self.pipeline.process(&session, progress, cancel).await?;
        drop(session);

        let preloaded = self.loader.preload(products).await;
        let instantiated = if self.config.instantiate_on_start {
            self.loader.instantiate_plugins(None, cancel).await
        } else {
            0
        };

        info!(
            "[运行时] 启动完成: 预加载 {} 个，实例化 {} 个",
            preloaded, instantiated
        );
        Ok(StartReport {
            check,
            preloaded,
            instantiated,
        })
    }

    /// 安装插件
    ///
    /// 会话已启动时，新安装的插件立即进入管道并加载；暂存的升级在下次启动时生效
    pub async fn install(
        &self,
        sources: Vec<InstallSource>,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstallOutcome>, RuntimeError> {
        let outcomes = self.installer.install(sources, progress, cancel).await?;

        let session = self.session.lock().await;
        if !session.is_upgrade_checked() {
            return Ok(outcomes);
        }

        let installed: Vec<&InstallOutcome> = outcomes
            .iter()
            .filter(|o| o.status == InstallStatus::Installed)
            .collect();
        if installed.is_empty() {
            return Ok(outcomes);
        }
        self.pipeline.feed_all(
            installed
                .iter()
                .map(|o| Material::LocalFile(o.install_path.clone())),
        );

        match self
            .pipeline
            .process(&session, &NoopProgressCallback, cancel)
            .await
        {
            Ok(products) => {
                drop(session);
                let ids: Vec<PluginId> =
                    products.iter().map(|p| p.descriptor().id.clone()).collect();
                self.loader.preload(products).await;
                if self.config.instantiate_on_start {
                    self.loader.instantiate_plugins(Some(&ids), cancel).await;
                }
            }
            Err(e) => warn!("[运行时] 新安装的插件加载失败，将在下次启动时重试: {}", e),
        }
        Ok(outcomes)
    }

    /// 登记升级计划，下次启动时生效
    pub fn plan_upgrade(
        &self,
        id: &PluginId,
        new_archive: &Path,
    ) -> Result<PlanUpgradeRecord, RuntimeError> {
        let installed = self
            .installer
            .get_installed(id)?
            .ok_or_else(|| InstallError::NotFound(id.to_string()))?;
        Ok(self
            .installer
            .plan_upgrade(id, &installed.install_path, new_archive)?)
    }

    /// 登记移除计划，下次启动时生效
    pub fn plan_remove(&self, id: &PluginId) -> Result<bool, RuntimeError> {
        Ok(self.installer.plan_uninstall(id)?)
    }

    pub async fn instantiate(
        &self,
        ids: Option<&[PluginId]>,
        cancel: &CancellationToken,
    ) -> usize {
        self.loader.instantiate_plugins(ids, cancel).await
    }

    pub fn get_plugin(&self, id: &PluginId) -> Option<Arc<dyn Plugin>> {
        self.loader.get_plugin(id)
    }

    pub fn get_plugins(&self) -> Vec<(PluginId, Arc<dyn Plugin>)> {
        self.loader.get_plugins()
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        self.loader.infos()
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledPlugin>, RuntimeError> {
        Ok(self.installer.list_installed()?)
    }

    pub async fn set_enabled(&self, id: &PluginId, enabled: bool) -> Result<(), RuntimeError> {
        Ok(self.loader.set_enabled(id, enabled).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.loader.subscribe()
    }

    pub async fn shutdown(&self) {
        self.loader.shutdown_all().await;
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn installer(&self) -> &PluginInstaller {
        &self.installer
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::installer::DownloadProgressFn;
    use crate::plugin::testing::{write_plugin_dir, write_plugin_zip, FakeModuleHost};
    use crate::plugin::types::LifecycleState;
    use crate::plugin::version::PluginVersion;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct OfflineDownloader;

    #[async_trait]
    impl Downloader for OfflineDownloader {
        async fn download(
            &self,
            url: &str,
            _target: &Path,
            _on_progress: DownloadProgressFn<'_>,
            _cancel: &CancellationToken,
        ) -> Result<u64, InstallError> {
            Err(InstallError::NetworkError(format!("offline: {}", url)))
        }
    }

    struct Env {
        root: TempDir,
        packages: PathBuf,
    }

    impl Env {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let packages = root.path().join("packages");
            std::fs::create_dir_all(&packages).unwrap();
            Self { root, packages }
        }

        fn config(&self) -> RuntimeConfig {
            let base = self.root.path();
            RuntimeConfig {
                plugins_dir: base.join("plugins"),
                temp_dir: base.join("tmp"),
                database_path: base.join("runtime.db"),
                host_version: "1.0.0".to_string(),
                ..RuntimeConfig::default()
            }
        }

        /// 每次调用模拟一次进程启动：新的运行时共享同一数据库文件
        fn runtime(&self, host: &Arc<FakeModuleHost>) -> PluginRuntime {
            self.runtime_with(self.config(), host)
        }

        fn runtime_with(&self, config: RuntimeConfig, host: &Arc<FakeModuleHost>) -> PluginRuntime {
            let conn = database::open_database(&config.database_path).unwrap();
            PluginRuntime::with_collaborators(
                config,
                conn,
                host.collaborators(),
                Arc::new(OfflineDownloader),
            )
            .unwrap()
        }
    }

    async fn start(runtime: &PluginRuntime) -> StartReport {
        runtime
            .start(&NoopProgressCallback, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn install(runtime: &PluginRuntime, package: &Path) -> Vec<InstallOutcome> {
        runtime
            .install(
                vec![InstallSource::local(package)],
                &NoopProgressCallback,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    fn pid(id: &str) -> PluginId {
        PluginId::new(id)
    }

    #[tokio::test]
    async fn test_start_loads_plugins_in_dependency_order() {
        let env = Env::new();
        let config = env.config();
        write_plugin_dir(&config.plugins_dir, "ui", "1.0.0", 0, &["core>=1.0"]);
        write_plugin_dir(&config.plugins_dir, "core", "1.0.0", 10, &[]);
        let host = FakeModuleHost::new();
        let runtime = env.runtime(&host);

        let report = start(&runtime).await;
        assert!(report.check.is_empty());
        assert_eq!(report.preloaded, 2);
        assert_eq!(report.instantiated, 2);

        let order: Vec<String> = runtime
            .get_plugins()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(order, vec!["core", "ui"]);
        assert!(runtime.get_plugin(&pid("UI")).is_some());
    }

    #[tokio::test]
    async fn test_start_without_instantiation() {
        let env = Env::new();
        let mut config = env.config();
        config.instantiate_on_start = false;
        write_plugin_dir(&config.plugins_dir, "lazy", "1.0.0", 0, &[]);
        let host = FakeModuleHost::new();
        let runtime = env.runtime_with(config, &host);

        let report = start(&runtime).await;
        assert_eq!(report.preloaded, 1);
        assert_eq!(report.instantiated, 0);
        assert!(runtime.get_plugin(&pid("lazy")).is_none());
        assert_eq!(host.construct_count(), 0);

        assert_eq!(runtime.instantiate(None, &CancellationToken::new()).await, 1);
        assert!(runtime.get_plugin(&pid("lazy")).is_some());
    }

    #[tokio::test]
    async fn test_install_after_start_loads_immediately() {
        let env = Env::new();
        let host = FakeModuleHost::new();
        let runtime = env.runtime(&host);
        start(&runtime).await;

        let package = write_plugin_zip(&env.packages, "fresh", "1.0.0", &[]);
        let outcomes = install(&runtime, &package).await;
        assert_eq!(outcomes[0].status, InstallStatus::Installed);
        assert!(runtime.get_plugin(&pid("fresh")).is_some());
        assert_eq!(runtime.list_installed().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_install_before_start_waits_for_session() {
        let env = Env::new();
        let host = FakeModuleHost::new();
        let runtime = env.runtime(&host);

        let package = write_plugin_zip(&env.packages, "early", "1.0.0", &[]);
        install(&runtime, &package).await;
        assert!(runtime.get_plugin(&pid("early")).is_none());

        let report = start(&runtime).await;
        assert_eq!(report.instantiated, 1);
        assert!(runtime.get_plugin(&pid("early")).is_some());
    }

    #[tokio::test]
    async fn test_staged_upgrade_applies_on_next_start() {
        let env = Env::new();
        let host = FakeModuleHost::new();
        {
            let runtime = env.runtime(&host);
            start(&runtime).await;
            let v1 = write_plugin_zip(&env.packages, "tool", "1.0.0", &[]);
            install(&runtime, &v1).await;

            let v2 = write_plugin_zip(&env.packages, "tool", "2.0.0", &[]);
            let outcomes = install(&runtime, &v2).await;
            assert_eq!(outcomes[0].status, InstallStatus::UpgradeStaged);

            let live = runtime.infos();
            assert_eq!(live[0].version, PluginVersion::new(1, 0, 0), "运行中的插件不应被替换");
            runtime.shutdown().await;
        }

        let restarted = env.runtime(&host);
        let report = start(&restarted).await;
        assert_eq!(report.check.upgraded, vec![pid("tool")]);
        let infos = restarted.infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].version, PluginVersion::new(2, 0, 0));
        assert_eq!(infos[0].state, LifecycleState::Enabled);
    }

    #[tokio::test]
    async fn test_plan_remove_applies_on_next_start() {
        let env = Env::new();
        let host = FakeModuleHost::new();
        let install_path = {
            let runtime = env.runtime(&host);
            start(&runtime).await;
            let package = write_plugin_zip(&env.packages, "gone", "1.0.0", &[]);
            let outcomes = install(&runtime, &package).await;
            assert!(runtime.plan_remove(&pid("gone")).unwrap());
            assert!(!runtime.plan_remove(&pid("gone")).unwrap(), "重复登记移除应为空操作");
            assert!(outcomes[0].install_path.is_dir(), "移除计划不应立即删除文件");
            outcomes[0].install_path.clone()
        };

        let restarted = env.runtime(&host);
        let report = start(&restarted).await;
        assert_eq!(report.check.removed, vec![pid("gone")]);
        assert!(!install_path.exists());
        assert!(restarted.get_plugin(&pid("gone")).is_none());
        assert!(restarted.list_installed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_upgrade_twice_is_rejected() {
        let env = Env::new();
        let host = FakeModuleHost::new();
        let runtime = env.runtime(&host);
        start(&runtime).await;
        install(&runtime, &write_plugin_zip(&env.packages, "pkg", "1.0.0", &[])).await;

        let v2 = write_plugin_zip(&env.packages, "pkg", "2.0.0", &[]);
        runtime.plan_upgrade(&pid("pkg"), &v2).unwrap();
        let err = runtime.plan_upgrade(&pid("pkg"), &v2).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Install(InstallError::AlreadyPlanned(_))
        ));

        let err = runtime.plan_upgrade(&pid("missing"), &v2).unwrap_err();
        assert!(matches!(err, RuntimeError::Install(InstallError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let env = Env::new();
        let config = env.config();
        write_plugin_dir(&config.plugins_dir, "evented", "1.0.0", 0, &[]);
        let host = FakeModuleHost::new();
        let runtime = env.runtime(&host);
        let mut events = runtime.subscribe();

        start(&runtime).await;
        runtime.set_enabled(&pid("evented"), false).await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(matches!(received[0], PluginEvent::Preloaded { .. }));
        assert!(matches!(received[1], PluginEvent::Loaded { .. }));
        assert!(matches!(received[2], PluginEvent::Enabled { .. }));
        assert!(matches!(received[3], PluginEvent::Disabled { .. }));
    }
}
