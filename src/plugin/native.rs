//! 基于动态链接库的模块运行时
//!
//! 插件编译为 cdylib/dylib，导出一个 `fn() -> Box<dyn Plugin>` 构造函数，
//! 符号名即清单中的 `entry_point`。插件需与宿主使用同一编译器版本构建

use async_trait::async_trait;
use libloading::Library;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::module::{EntryPointHandle, EntryPointResolver, ModuleHandle, ModuleLoader, PluginFactory};
use super::types::{Plugin, PluginDescriptor, PluginError};

/// 插件构造函数签名
pub type PluginCreateFn = unsafe fn() -> Box<dyn Plugin>;

/// 在插件 crate 中导出构造函数
///
/// ```ignore
/// declare_plugin!(create_plugin, HelloPlugin, HelloPlugin::default);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($symbol:ident, $plugin_type:ty, $constructor:path) => {
        #[no_mangle]
        pub fn $symbol() -> Box<dyn $crate::plugin::Plugin> {
            let plugin: $plugin_type = $constructor();
            Box::new(plugin)
        }
    };
}

/// 动态链接库模块运行时
#[derive(Debug, Default)]
pub struct NativeModuleRuntime;

impl NativeModuleRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleLoader for NativeModuleRuntime {
    async fn load_binary_module(&self, path: &Path) -> Result<ModuleHandle, PluginError> {
        let owned = path.to_path_buf();
        let library = tokio::task::spawn_blocking(move || {
            // SAFETY: 插件以完全信任方式运行，库初始化代码由插件作者负责
            unsafe { Library::new(&owned) }
        })
        .await
        .map_err(|e| PluginError::ModuleLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .map_err(|e| PluginError::ModuleLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        debug!("[模块] 已加载二进制模块: {}", path.display());
        Ok(ModuleHandle::new(path, library))
    }
}

impl EntryPointResolver for NativeModuleRuntime {
    fn resolve(&self, module: &ModuleHandle, entry_point: &str) -> Option<EntryPointHandle> {
        let library = module.downcast_ref::<Library>()?;
        // SAFETY: 符号类型由 declare_plugin! 约定；取出的函数指针
        // 只通过 EntryPointHandle 使用，而句柄持有库本身
        let constructor: PluginCreateFn = unsafe {
            library
                .get::<PluginCreateFn>(entry_point.as_bytes())
                .ok()
                .map(|symbol| *symbol)?
        };
        Some(EntryPointHandle::new(module.clone(), entry_point, constructor))
    }
}

impl PluginFactory for NativeModuleRuntime {
    fn construct(
        &self,
        entry_point: &EntryPointHandle,
        descriptor: &PluginDescriptor,
    ) -> Result<Arc<dyn Plugin>, PluginError> {
        let constructor = *entry_point
            .downcast_ref::<PluginCreateFn>()
            .ok_or_else(|| PluginError::Construct {
                plugin: descriptor.id.clone(),
                message: format!("入口点 {} 不是原生构造函数", entry_point.name()),
            })?;

        // SAFETY: 同上，构造函数来自仍被持有的库
        let plugin = panic::catch_unwind(AssertUnwindSafe(|| unsafe { constructor() }))
            .map_err(|payload| PluginError::Construct {
                plugin: descriptor.id.clone(),
                message: panic_message(payload.as_ref()),
            })?;

        Ok(Arc::from(plugin))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "构造函数发生 panic".to_string()
    }
}
