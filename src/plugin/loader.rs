//! 插件加载器
//!
//! 两阶段生命周期：
//! - 预加载：登记主处理器产出的产品 (模块已加载、入口点已解析)，不运行任何构造函数
//! - 实例化：按需构造插件实例，调用 `on_loaded`，再应用持久化的启用状态
//!
//! 单个插件失败只记录日志并标记为 Failed，不影响同批其他插件

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checker::PluginLedger;
use super::module::{EntryPointHandle, ModuleHandle, PluginFactory};
use super::pipeline::Product;
use super::types::{
    LifecycleState, Plugin, PluginDescriptor, PluginError, PluginId, PluginInfo, PluginLocation,
};
use super::version::PluginVersion;
use crate::settings::SettingsStore;

/// 启用状态在设置存储中的容器名，键为小写插件 id
pub const ENABLED_CONTAINER: &str = "plugin.enabled";

const EVENT_CAPACITY: usize = 64;

/// 生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PluginEvent {
    Preloaded { id: PluginId },
    Loaded { id: PluginId, elapsed_ms: u64 },
    Enabled { id: PluginId },
    Disabled { id: PluginId },
    Failed { id: PluginId, message: String },
}

/// 单个插件的生命周期记录
///
/// 预加载时创建，进程存活期间不会重建
#[derive(Clone)]
pub struct PreloadedPluginState {
    pub metadata: Arc<PluginDescriptor>,
    pub location: PluginLocation,
    pub plugin_dir: PathBuf,
    pub module: ModuleHandle,
    pub entry_point: EntryPointHandle,
    pub is_instantiated: bool,
    pub instantiated_at: Option<DateTime<Utc>>,
    pub instance: Option<Arc<dyn Plugin>>,
    pub state: LifecycleState,
}

impl PreloadedPluginState {
    fn from_product(product: Product) -> Self {
        let (metadata, location, plugin_dir, module, entry_point) = product.into_parts();
        Self {
            metadata,
            location,
            plugin_dir,
            module,
            entry_point,
            is_instantiated: false,
            instantiated_at: None,
            instance: None,
            state: LifecycleState::Preloaded,
        }
    }

    fn info(&self) -> PluginInfo {
        let meta = &self.metadata;
        PluginInfo {
            id: meta.id.clone(),
            name: meta.name.clone(),
            version: meta.version.clone(),
            priority: meta.priority,
            description: meta.description.clone(),
            author: meta.author.clone(),
            state: self.state,
            location: self.location.clone(),
            instantiated_at: self.instantiated_at,
        }
    }
}

impl fmt::Debug for PreloadedPluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadedPluginState")
            .field("id", &self.metadata.id)
            .field("version", &self.metadata.version)
            .field("location", &self.location)
            .field("entry_point", &self.entry_point.name())
            .field("is_instantiated", &self.is_instantiated)
            .field("instantiated_at", &self.instantiated_at)
            .field("state", &self.state)
            .finish()
    }
}

pub struct PluginLoader {
    factory: Arc<dyn PluginFactory>,
    settings: Arc<dyn SettingsStore>,
    preloaded: RwLock<IndexMap<PluginId, PreloadedPluginState>>,
    live: RwLock<IndexMap<PluginId, Arc<dyn Plugin>>>,
    /// 预加载、实例化、关闭互斥执行
    pass_lock: Mutex<()>,
    events: broadcast::Sender<PluginEvent>,
}

impl PluginLoader {
    pub fn new(factory: Arc<dyn PluginFactory>, settings: Arc<dyn SettingsStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            factory,
            settings,
            preloaded: RwLock::new(IndexMap::new()),
            live: RwLock::new(IndexMap::new()),
            pass_lock: Mutex::new(()),
            events,
        }
    }

    /// 登记产品，返回新预加载的数量；已预加载的 id 被跳过
    pub async fn preload(&self, products: Vec<Product>) -> usize {
        let _pass = self.pass_lock.lock().await;
        let mut count = 0;

        for product in products {
            let id = product.descriptor().id.clone();
            if self.preloaded.read().contains_key(&id) {
                debug!("[加载器] 插件 {} 已预加载，跳过", id);
                continue;
            }
            let state = PreloadedPluginState::from_product(product);
            debug!(
                "[加载器] 预加载插件 {} v{} ({})",
                id, state.metadata.version, state.location
            );
            self.preloaded.write().insert(id.clone(), state);
            self.emit(PluginEvent::Preloaded { id });
            count += 1;
        }

        if count > 0 {
            info!("[加载器] 预加载 {} 个插件", count);
        }
        count
    }

    /// 实例化插件，返回本次新实例化的数量
    ///
    /// `ids` 为 None 时实例化全部未实例化的插件；未预加载的 id 被忽略。
    /// 已实例化的插件不会重复构造
    pub async fn instantiate_plugins(
        &self,
        ids: Option<&[PluginId]>,
        cancel: &CancellationToken,
    ) -> usize {
        let _pass = self.pass_lock.lock().await;

        let targets: Vec<PreloadedPluginState> = self
            .preloaded
            .read()
            .values()
            .filter(|s| !s.is_instantiated && s.state != LifecycleState::Failed)
            .filter(|s| ids.map_or(true, |ids| ids.contains(&s.metadata.id)))
            .cloned()
            .collect();

        let mut count = 0;
        for target in targets {
            if cancel.is_cancelled() {
                info!("[加载器] 实例化已取消，已完成 {} 个", count);
                break;
            }

            let id = target.metadata.id.clone();
            let started = Instant::now();
            let instance = match self.construct(&target).await {
                Ok(instance) => instance,
                Err(e) => {
                    error!(
                        "[加载器] 插件 {} 实例化失败 ({}ms): {}",
                        id,
                        started.elapsed().as_millis(),
                        e
                    );
                    self.mark_failed(&id, e.to_string());
                    continue;
                }
            };

            if let Some(state) = self.preloaded.write().get_mut(&id) {
                state.is_instantiated = true;
                state.instantiated_at = Some(Utc::now());
                state.instance = Some(instance.clone());
                state.state = LifecycleState::Instantiated;
            }
            self.live.write().insert(id.clone(), instance.clone());

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!("[加载器] 插件 {} 实例化完成 ({}ms)", id, elapsed_ms);
            self.emit(PluginEvent::Loaded {
                id: id.clone(),
                elapsed_ms,
            });
            count += 1;

            self.apply_enabled_flag(&id, instance.as_ref()).await;
        }

        count
    }

    async fn construct(&self, target: &PreloadedPluginState) -> Result<Arc<dyn Plugin>, PluginError> {
        let meta = &target.metadata;
        for dep in &meta.dependencies {
            if self.state(&dep.target_id) == Some(LifecycleState::Failed) {
                return Err(PluginError::DependencyUnavailable {
                    plugin: meta.id.clone(),
                    dependency: dep.target_id.clone(),
                });
            }
        }

        let instance = self.factory.construct(&target.entry_point, meta)?;
        instance.on_loaded(meta).await?;
        Ok(instance)
    }

    async fn apply_enabled_flag(&self, id: &PluginId, instance: &dyn Plugin) {
        if self.is_enabled(id) {
            match instance.on_enable().await {
                Ok(()) => self.set_state(id, LifecycleState::Enabled),
                Err(e) => {
                    warn!("[加载器] 插件 {} 启用失败，保持禁用: {}", id, e);
                    self.set_state(id, LifecycleState::Disabled);
                }
            }
        } else {
            if let Err(e) = instance.on_disable().await {
                warn!("[加载器] 插件 {} 禁用钩子失败: {}", id, e);
            }
            self.set_state(id, LifecycleState::Disabled);
        }
    }

    /// 持久化启用状态；已实例化的插件立即执行对应钩子
    pub async fn set_enabled(&self, id: &PluginId, enabled: bool) -> Result<(), PluginError> {
        if !self.preloaded.read().contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }
        self.settings
            .set_as(ENABLED_CONTAINER, &id.key(), &enabled)?;

        let Some(instance) = self.get_plugin(id) else {
            debug!("[加载器] 插件 {} 尚未实例化，仅保存启用状态", id);
            return Ok(());
        };

        if enabled {
            if let Err(e) = instance.on_enable().await {
                self.set_state(id, LifecycleState::Disabled);
                return Err(e);
            }
            self.set_state(id, LifecycleState::Enabled);
        } else {
            instance.on_disable().await?;
            self.set_state(id, LifecycleState::Disabled);
        }
        info!(
            "[加载器] 插件 {} 已{}",
            id,
            if enabled { "启用" } else { "禁用" }
        );
        Ok(())
    }

    /// 读取持久化的启用状态，缺省为启用
    pub fn is_enabled(&self, id: &PluginId) -> bool {
        match self.settings.get_as::<bool>(ENABLED_CONTAINER, &id.key()) {
            Ok(value) => value.unwrap_or(true),
            Err(e) => {
                warn!("[加载器] 读取插件 {} 启用状态失败: {}", id, e);
                true
            }
        }
    }

    /// 已实例化的插件
    pub fn get_plugin(&self, id: &PluginId) -> Option<Arc<dyn Plugin>> {
        self.live.read().get(id).cloned()
    }

    /// 按实例化顺序返回全部插件的快照
    pub fn get_plugins(&self) -> Vec<(PluginId, Arc<dyn Plugin>)> {
        self.live
            .read()
            .iter()
            .map(|(id, plugin)| (id.clone(), plugin.clone()))
            .collect()
    }

    pub fn preloaded_state(&self, id: &PluginId) -> Option<PreloadedPluginState> {
        self.preloaded.read().get(id).cloned()
    }

    pub fn state(&self, id: &PluginId) -> Option<LifecycleState> {
        self.preloaded.read().get(id).map(|s| s.state)
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        self.preloaded
            .read()
            .values()
            .map(PreloadedPluginState::info)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    /// 按实例化的逆序关闭全部插件
    pub async fn shutdown_all(&self) {
        let _pass = self.pass_lock.lock().await;
        let plugins: Vec<(PluginId, Arc<dyn Plugin>)> = self.live.write().drain(..).collect();
        for (id, plugin) in plugins.into_iter().rev() {
            if let Err(e) = plugin.shutdown().await {
                warn!("[加载器] 插件 {} 关闭失败: {}", id, e);
            }
        }
    }

    fn set_state(&self, id: &PluginId, state: LifecycleState) {
        if let Some(entry) = self.preloaded.write().get_mut(id) {
            entry.state = state;
        }
        match state {
            LifecycleState::Enabled => self.emit(PluginEvent::Enabled { id: id.clone() }),
            LifecycleState::Disabled => self.emit(PluginEvent::Disabled { id: id.clone() }),
            _ => {}
        }
    }

    fn mark_failed(&self, id: &PluginId, message: String) {
        if let Some(entry) = self.preloaded.write().get_mut(id) {
            entry.state = LifecycleState::Failed;
        }
        self.emit(PluginEvent::Failed {
            id: id.clone(),
            message,
        });
    }

    fn emit(&self, event: PluginEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }
}

impl PluginLedger for PluginLoader {
    fn installed_version(&self, id: &PluginId) -> Option<PluginVersion> {
        self.preloaded
            .read()
            .get(id)
            .filter(|s| s.state != LifecycleState::Failed)
            .map(|s| s.metadata.version.clone())
    }
}
