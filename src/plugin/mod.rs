//! 插件系统模块
//!
//! 提供宿主侧的插件运行时，支持：
//! - 依赖与版本解析，确定性的加载顺序
//! - 材料 → 工件 → 产品的处理管道
//! - 预加载 / 实例化两阶段生命周期
//! - 插件安装，以及跨重启生效的升级/移除计划
//! - 进度上报

pub mod checker;
pub mod dependency;
pub mod installer;
pub mod loader;
pub mod module;
pub mod native;
pub mod pipeline;
pub mod progress;
pub mod runtime;
pub mod scanner;
mod types;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use checker::{
    DependencyCheckResult, DependencyChecker, EmptyLedger, LayeredLedger, PluginLedger,
    ResolveError, SortableEntry,
};
pub use dependency::{Comparator, DependencyConstraint, DependencySpec};
pub use loader::{PluginEvent, PluginLoader, PreloadedPluginState, ENABLED_CONTAINER};
pub use module::{
    EntryPointHandle, EntryPointResolver, ModuleCollaborators, ModuleHandle, ModuleLoader,
    PluginFactory,
};
pub use native::{NativeModuleRuntime, PluginCreateFn};
pub use pipeline::{Material, PipelineError, PluginPipeline, Product, SessionContext, Workpiece};
pub use progress::{
    FnProgressCallback, NoopProgressCallback, ProgressCallback, ProgressReport, ProgressStep,
    ProgressTracker, SubProgress,
};
pub use runtime::{PluginRuntime, RuntimeError, StartReport};
pub use scanner::PluginScanner;
pub use types::{
    LifecycleState, Plugin, PluginDescriptor, PluginError, PluginId, PluginInfo, PluginLocation,
    PluginManifest, MANIFEST_FILE,
};
pub use version::PluginVersion;
