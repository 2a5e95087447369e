//! 主处理器
//!
//! 工件 → 产品：
//! 1. 有界并发解析清单并确认二进制模块存在，失败的工件被丢弃
//! 2. 检查宿主版本，任何不满足的插件使整批失败
//! 3. 整批做一次依赖解析
//! 4. 按加载顺序有界并发加载模块、解析入口点；失败的插件及其依赖方被丢弃

use futures::future::join_all;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::material::{Product, Workpiece};
use super::PipelineError;
use crate::plugin::checker::{DependencyChecker, PluginLedger, SortableEntry};
use crate::plugin::module::{EntryPointResolver, ModuleLoader};
use crate::plugin::progress::{ProgressStep, ProgressTracker, SubProgress};
use crate::plugin::types::{
    PluginDescriptor, PluginError, PluginLocation, PluginManifest,
};
use crate::plugin::version::PluginVersion;

/// 默认并发上限
pub const DEFAULT_MAX_CONCURRENCY: usize = 6;

const PARSE_START: f64 = 0.3;
const PARSE_WIDTH: f64 = 0.2;
const RESOLVE_DONE: f64 = 0.6;
const ENTRY_START: f64 = 0.6;
const ENTRY_WIDTH: f64 = 0.35;

/// 解析完成、待排序的插件
struct Parsed {
    descriptor: Arc<PluginDescriptor>,
    location: PluginLocation,
    plugin_dir: PathBuf,
}

pub struct MainProcessor {
    loader: Arc<dyn ModuleLoader>,
    resolver: Arc<dyn EntryPointResolver>,
    ledger: Arc<dyn PluginLedger>,
    host_version: PluginVersion,
    max_concurrency: usize,
}

impl MainProcessor {
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        resolver: Arc<dyn EntryPointResolver>,
        ledger: Arc<dyn PluginLedger>,
        host_version: PluginVersion,
    ) -> Self {
        Self {
            loader,
            resolver,
            ledger,
            host_version,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn host_version(&self) -> &PluginVersion {
        &self.host_version
    }

    pub async fn process(
        &self,
        workpieces: Vec<Workpiece>,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, PipelineError> {
        let parsed = self.parse_all(workpieces, tracker, cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        for item in &parsed {
            let descriptor = &item.descriptor;
            if !descriptor.supports_host(&self.host_version) {
                return Err(PipelineError::HostVersionMismatch {
                    plugin: descriptor.id.clone(),
                    required: descriptor.min_host_version.clone().unwrap_or_default(),
                    actual: self.host_version.clone(),
                });
            }
        }

        let entries: Vec<SortableEntry<PathBuf>> = parsed
            .into_iter()
            .map(|p| SortableEntry::new(p.descriptor, p.location, p.plugin_dir))
            .collect();
        let checked = DependencyChecker::new(self.ledger.as_ref()).determine_load_order(entries)?;
        tracker.report_sub(
            ProgressStep::MainProcessing,
            RESOLVE_DONE,
            "resolving",
            1.0,
            format!("依赖解析完成，共 {} 个插件", checked.result.len()),
        );

        let ordered = checked.result;
        let resolved = self.resolve_all(&ordered, tracker, cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let products = prune_dependents(ordered, resolved);
        info!("[管道] 主处理完成，产出 {} 个插件", products.len());
        Ok(products)
    }

    async fn parse_all(
        &self,
        workpieces: Vec<Workpiece>,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Vec<Parsed> {
        let total = workpieces.len();
        let semaphore = Semaphore::new(self.max_concurrency);
        let done = AtomicUsize::new(0);

        let tasks = workpieces.into_iter().map(|workpiece| {
            let semaphore = &semaphore;
            let done = &done;
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let source = workpiece.material.to_string();
                let parsed = parse_workpiece(workpiece).await;

                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                let fraction = finished as f64 / total as f64;
                tracker.report_sub(
                    ProgressStep::MainProcessing,
                    PARSE_START + PARSE_WIDTH * fraction,
                    "parsing",
                    fraction,
                    format!("解析插件清单 {}/{}", finished, total),
                );

                match parsed {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!("[管道] 丢弃插件 {}: {}", source, e);
                        None
                    }
                }
            }
        });

        join_all(tasks).await.into_iter().flatten().collect()
    }

    /// 返回值与 `ordered` 一一对应
    async fn resolve_all(
        &self,
        ordered: &[SortableEntry<PathBuf>],
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Vec<Option<Product>> {
        let total = ordered.len();
        let semaphore = Semaphore::new(self.max_concurrency);

        let tasks = ordered.iter().enumerate().map(|(index, entry)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let product = self.resolve_entry(entry).await;
                let band = SubProgress::new(ENTRY_START, ENTRY_WIDTH, index, total);
                tracker.report_sub(
                    ProgressStep::MainProcessing,
                    band.end(),
                    entry.id().to_string(),
                    1.0,
                    format!("解析入口点 {}", entry.id()),
                );
                match product {
                    Ok(product) => Some(product),
                    Err(e) => {
                        warn!("[管道] 丢弃插件 {}: {}", entry.id(), e);
                        None
                    }
                }
            }
        });

        join_all(tasks).await
    }

    async fn resolve_entry(&self, entry: &SortableEntry<PathBuf>) -> Result<Product, PluginError> {
        let descriptor = &entry.descriptor;
        let plugin_dir = &entry.payload;
        let module = self
            .loader
            .load_binary_module(&descriptor.binary_module_path(plugin_dir))
            .await?;
        let entry_point = self
            .resolver
            .resolve(&module, &descriptor.entry_point)
            .ok_or_else(|| PluginError::EntryPointNotFound {
                plugin: descriptor.id.clone(),
                entry_point: descriptor.entry_point.clone(),
            })?;
        debug!(
            "[管道] 已解析入口点 {}::{}",
            descriptor.id,
            entry_point.name()
        );
        Ok(Product::new(
            descriptor.clone(),
            entry.location.clone(),
            plugin_dir.clone(),
            module,
            entry_point,
        ))
    }
}

async fn parse_workpiece(workpiece: Workpiece) -> Result<Parsed, PluginError> {
    let descriptor = PluginManifest::from_json(&workpiece.manifest_text)?.into_descriptor()?;
    let module_path = descriptor.binary_module_path(&workpiece.plugin_dir);
    let is_file = tokio::fs::metadata(&module_path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(PluginError::BinaryModuleNotFound {
            plugin: descriptor.id,
            path: module_path,
        });
    }
    Ok(Parsed {
        descriptor: Arc::new(descriptor),
        location: workpiece.location,
        plugin_dir: workpiece.plugin_dir,
    })
}

/// 丢弃未解析成功的插件，以及依赖它们的后续插件
fn prune_dependents(
    ordered: Vec<SortableEntry<PathBuf>>,
    resolved: Vec<Option<Product>>,
) -> Vec<Product> {
    let mut dropped = HashSet::new();
    let mut products = Vec::with_capacity(resolved.len());

    for (entry, product) in ordered.iter().zip(resolved) {
        let Some(product) = product else {
            dropped.insert(entry.id().clone());
            continue;
        };
        if let Some(dep) = entry
            .descriptor
            .dependencies
            .iter()
            .find(|d| dropped.contains(&d.target_id))
        {
            warn!(
                "[管道] 丢弃插件 {}: 依赖 {} 不可用",
                entry.id(),
                dep.target_id
            );
            dropped.insert(entry.id().clone());
            continue;
        }
        products.push(product);
    }
    products
}
