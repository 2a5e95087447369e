//! 二进制模块协作接口
//!
//! 流水线和加载器只通过这里的 trait 接触二进制模块：
//! 加载模块映像、按名称解析入口点、由入口点构造插件实例

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::native::NativeModuleRuntime;
use super::types::{Plugin, PluginDescriptor, PluginError};

/// 已加载的二进制模块映像
///
/// 克隆共享同一份映像；最后一个句柄释放时映像才会卸载
#[derive(Clone)]
pub struct ModuleHandle {
    path: PathBuf,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ModuleHandle {
    pub fn new<T: Any + Send + Sync>(path: impl Into<PathBuf>, inner: T) -> Self {
        Self {
            path: path.into(),
            inner: Arc::new(inner),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// 已解析的入口点
///
/// 持有所属模块的句柄，保证入口点可用期间模块不被卸载
#[derive(Clone)]
pub struct EntryPointHandle {
    module: ModuleHandle,
    name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl EntryPointHandle {
    pub fn new<T: Any + Send + Sync>(
        module: ModuleHandle,
        name: impl Into<String>,
        inner: T,
    ) -> Self {
        Self {
            module,
            name: name.into(),
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for EntryPointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPointHandle")
            .field("module", &self.module.path)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// 加载二进制模块映像
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load_binary_module(&self, path: &Path) -> Result<ModuleHandle, PluginError>;
}

/// 按名称解析入口点，找不到返回 None
pub trait EntryPointResolver: Send + Sync {
    fn resolve(&self, module: &ModuleHandle, entry_point: &str) -> Option<EntryPointHandle>;
}

/// 由入口点构造插件实例
pub trait PluginFactory: Send + Sync {
    fn construct(
        &self,
        entry_point: &EntryPointHandle,
        descriptor: &PluginDescriptor,
    ) -> Result<Arc<dyn Plugin>, PluginError>;
}

/// 一组模块协作者
#[derive(Clone)]
pub struct ModuleCollaborators {
    pub loader: Arc<dyn ModuleLoader>,
    pub resolver: Arc<dyn EntryPointResolver>,
    pub factory: Arc<dyn PluginFactory>,
}

impl ModuleCollaborators {
    /// 三个角色由同一个实现承担
    pub fn from_shared<T>(host: Arc<T>) -> Self
    where
        T: ModuleLoader + EntryPointResolver + PluginFactory + 'static,
    {
        Self {
            loader: host.clone(),
            resolver: host.clone(),
            factory: host,
        }
    }

    /// 基于动态链接库的默认实现
    pub fn native() -> Self {
        Self::from_shared(Arc::new(NativeModuleRuntime::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_handle_downcast() {
        let module = ModuleHandle::new("/plugins/a/liba.so", 42u32);
        assert_eq!(module.downcast_ref::<u32>(), Some(&42));
        assert!(module.downcast_ref::<String>().is_none());
        assert_eq!(module.path(), Path::new("/plugins/a/liba.so"));
    }

    #[test]
    fn test_entry_point_keeps_module() {
        let module = ModuleHandle::new("/plugins/a/liba.so", ());
        let entry = EntryPointHandle::new(module.clone(), "create_plugin", "ctor".to_string());
        drop(module);
        assert_eq!(entry.module().path(), Path::new("/plugins/a/liba.so"));
        assert_eq!(entry.name(), "create_plugin");
        assert_eq!(entry.downcast_ref::<String>().map(String::as_str), Some("ctor"));
        assert!(format!("{entry:?}").contains("create_plugin"));
    }
}
