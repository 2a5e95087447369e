//! 插件处理管道
//!
//! `feed` 只把材料追加到缓冲区；`process` 取出全部材料，
//! 并发预处理为工件，再由主处理器产出按加载顺序排列的产品。
//!
//! `process` 不可重入：并发调用会排队等待上一次完成。

mod main_processor;
mod material;
mod preprocess;

pub use main_processor::{MainProcessor, DEFAULT_MAX_CONCURRENCY};
pub use material::{Material, MaterialKind, Product, Workpiece};
pub use preprocess::{
    ArchiveProcessor, HttpProcessor, LocalFileProcessor, PreprocessingProcessor,
    ProcessorRegistry,
};

use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::plugin::checker::ResolveError;
use crate::plugin::progress::{ProgressCallback, ProgressStep, ProgressTracker};
use crate::plugin::types::{PluginError, PluginId};
use crate::plugin::version::PluginVersion;

const PREPROCESS_WIDTH: f64 = 0.3;
const OUTBOUND_START: f64 = 0.95;

/// 管道错误 (整批失败)
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("本会话尚未执行升级/移除检查，拒绝处理插件")]
    UpgradeCheckPending,

    #[error("插件 {plugin} 要求宿主版本 >= {required}，当前宿主版本 {actual}")]
    HostVersionMismatch {
        plugin: PluginId,
        required: PluginVersion,
        actual: PluginVersion,
    },

    #[error("依赖解析失败: {0}")]
    Resolve(#[from] ResolveError),

    #[error("处理已取消")]
    Cancelled,
}

/// 会话上下文
///
/// 记录本次进程是否已执行过升级/移除计划
#[derive(Debug, Default)]
pub struct SessionContext {
    upgrade_checked: bool,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_upgrade_checked(&self) -> bool {
        self.upgrade_checked
    }

    pub(crate) fn mark_upgrade_checked(&mut self) {
        self.upgrade_checked = true;
    }
}

pub struct PluginPipeline {
    processors: ProcessorRegistry,
    main: MainProcessor,
    materials: parking_lot::Mutex<Vec<Material>>,
    finish_lock: tokio::sync::Mutex<()>,
}

impl PluginPipeline {
    pub fn new(processors: ProcessorRegistry, main: MainProcessor) -> Self {
        Self {
            processors,
            main,
            materials: parking_lot::Mutex::new(Vec::new()),
            finish_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn feed(&self, material: Material) -> &Self {
        self.materials.lock().push(material);
        self
    }

    pub fn feed_all(&self, materials: impl IntoIterator<Item = Material>) -> &Self {
        self.materials.lock().extend(materials);
        self
    }

    /// 缓冲区中待处理的材料数
    pub fn pending(&self) -> usize {
        self.materials.lock().len()
    }

    pub async fn process(
        &self,
        session: &SessionContext,
        progress: &dyn ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, PipelineError> {
        if !session.is_upgrade_checked() {
            return Err(PipelineError::UpgradeCheckPending);
        }

        let _guard = self.finish_lock.lock().await;
        let materials = std::mem::take(&mut *self.materials.lock());
        let tracker = ProgressTracker::new(progress);

        match self.run(materials, &tracker, cancel).await {
            Ok(products) => {
                tracker.report(ProgressStep::Success, 1.0, "插件处理完成");
                Ok(products)
            }
            Err(e) => {
                error!("[管道] 处理失败: {}", e);
                tracker.report(ProgressStep::Failed, tracker.current(), e.to_string());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        materials: Vec<Material>,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, PipelineError> {
        let total = materials.len();
        tracker.report(
            ProgressStep::Feeding,
            0.0,
            format!("收到 {} 个插件材料", total),
        );
        info!("[管道] 开始处理 {} 个插件材料", total);

        let workpieces = self.preprocess(materials, tracker, cancel).await?;

        let products = self.main.process(workpieces, tracker, cancel).await?;

        tracker.report(
            ProgressStep::Outbounding,
            OUTBOUND_START,
            format!("输出 {} 个插件", products.len()),
        );
        Ok(products)
    }

    async fn preprocess(
        &self,
        materials: Vec<Material>,
        tracker: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Workpiece>, PipelineError> {
        let total = materials.len();
        let done = AtomicUsize::new(0);

        let tasks = materials.into_iter().map(|material| {
            let done = &done;
            async move {
                let Some(processor) = self.processors.get(material.kind()) else {
                    warn!("[管道] 不支持的材料类型，已跳过: {}", material);
                    return None;
                };
                let result = processor.process(&material, cancel).await;

                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                let fraction = finished as f64 / total as f64;
                tracker.report_sub(
                    ProgressStep::Preprocessing,
                    PREPROCESS_WIDTH * fraction,
                    material.kind().to_string(),
                    fraction,
                    format!("预处理 {}/{}", finished, total),
                );

                match result {
                    Ok(workpiece) => Some(workpiece),
                    Err(PluginError::Cancelled) => None,
                    Err(e) => {
                        warn!("[管道] 预处理失败，已跳过 {}: {}", material, e);
                        None
                    }
                }
            }
        });

        let workpieces: Vec<Workpiece> = join_all(tasks).await.into_iter().flatten().collect();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(workpieces)
    }
}
