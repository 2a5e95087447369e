//! 测试辅助：假的模块宿主与插件目录生成

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zip::write::FileOptions;

use super::module::{
    EntryPointHandle, EntryPointResolver, ModuleCollaborators, ModuleHandle, ModuleLoader,
    PluginFactory,
};
use super::types::{Plugin, PluginDescriptor, PluginError, PluginId, MANIFEST_FILE};

pub const TEST_MODULE: &str = "lib/plugin.bin";
pub const TEST_ENTRY_POINT: &str = "create_plugin";

pub fn manifest_json(id: &str, version: &str, priority: i32, deps: &[&str]) -> String {
    serde_json::json!({
        "id": id,
        "version": version,
        "priority": priority,
        "dependencies": deps,
        "binary_module": TEST_MODULE,
        "entry_point": TEST_ENTRY_POINT,
    })
    .to_string()
}

/// 在 `root/<id>` 下生成插件目录，模块导出 create_plugin
pub fn write_plugin_dir(
    root: &Path,
    id: &str,
    version: &str,
    priority: i32,
    deps: &[&str],
) -> PathBuf {
    write_plugin_dir_with_module(root, id, version, priority, deps, TEST_ENTRY_POINT)
}

/// 模块文件内容即导出的符号列表；以 corrupt 开头的模块无法加载
pub fn write_plugin_dir_with_module(
    root: &Path,
    id: &str,
    version: &str,
    priority: i32,
    deps: &[&str],
    module_content: &str,
) -> PathBuf {
    let dir = root.join(id);
    fs::create_dir_all(dir.join("lib")).unwrap();
    fs::write(dir.join(MANIFEST_FILE), manifest_json(id, version, priority, deps)).unwrap();
    fs::write(dir.join(TEST_MODULE), module_content).unwrap();
    dir
}

/// 生成 `root/<id>-<version>.zip`，包内为 `<id>/` 插件目录
pub fn write_plugin_zip(root: &Path, id: &str, version: &str, deps: &[&str]) -> PathBuf {
    let path = root.join(format!("{}-{}.zip", id, version));
    let file = fs::File::create(&path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

    let entries = [
        (format!("{}/{}", id, MANIFEST_FILE), manifest_json(id, version, 0, deps)),
        (format!("{}/{}", id, TEST_MODULE), TEST_ENTRY_POINT.to_string()),
    ];
    for (name, content) in entries {
        zip.start_file(name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path
}

/// 记录钩子调用的插件
#[derive(Default)]
pub struct TestPlugin {
    pub calls: Mutex<Vec<&'static str>>,
    pub fail_on_loaded: bool,
    pub fail_on_enable: bool,
}

impl TestPlugin {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    async fn on_loaded(&self, descriptor: &PluginDescriptor) -> Result<(), PluginError> {
        self.record("loaded");
        if self.fail_on_loaded {
            return Err(PluginError::Hook {
                plugin: descriptor.id.clone(),
                message: "on_loaded failed".to_string(),
            });
        }
        Ok(())
    }

    async fn on_enable(&self) -> Result<(), PluginError> {
        self.record("enable");
        if self.fail_on_enable {
            return Err(PluginError::Hook {
                plugin: PluginId::new("test"),
                message: "on_enable failed".to_string(),
            });
        }
        Ok(())
    }

    async fn on_disable(&self) -> Result<(), PluginError> {
        self.record("disable");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.record("shutdown");
        Ok(())
    }
}

/// 以文本文件模拟二进制模块的宿主
#[derive(Default)]
pub struct FakeModuleHost {
    pub loads: AtomicUsize,
    pub constructs: AtomicUsize,
    fail_construct: Mutex<HashSet<PluginId>>,
    fail_on_loaded: Mutex<HashSet<PluginId>>,
    fail_on_enable: Mutex<HashSet<PluginId>>,
    instances: Mutex<HashMap<PluginId, Arc<TestPlugin>>>,
}

impl FakeModuleHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collaborators(self: &Arc<Self>) -> ModuleCollaborators {
        ModuleCollaborators::from_shared(self.clone())
    }

    pub fn fail_construct(&self, id: &str) {
        self.fail_construct.lock().insert(PluginId::new(id));
    }

    pub fn fail_on_loaded(&self, id: &str) {
        self.fail_on_loaded.lock().insert(PluginId::new(id));
    }

    pub fn fail_on_enable(&self, id: &str) {
        self.fail_on_enable.lock().insert(PluginId::new(id));
    }

    pub fn instance(&self, id: &str) -> Option<Arc<TestPlugin>> {
        self.instances.lock().get(&PluginId::new(id)).cloned()
    }

    pub fn construct_count(&self) -> usize {
        self.constructs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleLoader for FakeModuleHost {
    async fn load_binary_module(&self, path: &Path) -> Result<ModuleHandle, PluginError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| PluginError::ModuleLoad {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
        if content.starts_with("corrupt") {
            return Err(PluginError::ModuleLoad {
                path: path.to_path_buf(),
                message: "bad image".to_string(),
            });
        }
        let symbols: Vec<String> = content.split_whitespace().map(str::to_string).collect();
        Ok(ModuleHandle::new(path, symbols))
    }
}

impl EntryPointResolver for FakeModuleHost {
    fn resolve(&self, module: &ModuleHandle, entry_point: &str) -> Option<EntryPointHandle> {
        let symbols = module.downcast_ref::<Vec<String>>()?;
        symbols
            .iter()
            .any(|s| s == entry_point)
            .then(|| EntryPointHandle::new(module.clone(), entry_point, entry_point.to_string()))
    }
}

impl PluginFactory for FakeModuleHost {
    fn construct(
        &self,
        _entry_point: &EntryPointHandle,
        descriptor: &PluginDescriptor,
    ) -> Result<Arc<dyn Plugin>, PluginError> {
        self.constructs.fetch_add(1, Ordering::SeqCst);
        if self.fail_construct.lock().contains(&descriptor.id) {
            return Err(PluginError::Construct {
                plugin: descriptor.id.clone(),
                message: "constructor panicked".to_string(),
            });
        }
        let plugin = Arc::new(TestPlugin {
            calls: Mutex::new(Vec::new()),
            fail_on_loaded: self.fail_on_loaded.lock().contains(&descriptor.id),
            fail_on_enable: self.fail_on_enable.lock().contains(&descriptor.id),
        });
        self.instances
            .lock()
            .insert(descriptor.id.clone(), plugin.clone());
        Ok(plugin)
    }
}
