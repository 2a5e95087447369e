//! 进度上报
//!
//! 流水线和安装器共用的进度模型：总进度取值 [0, 1]，单调不减；
//! 子阶段通过 [`SubProgress`] 映射到总进度的一段区间

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 进度阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
    /// 投料
    Feeding,
    /// 预处理 (读取清单、下载、解压)
    Preprocessing,
    /// 主处理 (解析、依赖检查、入口点解析)
    MainProcessing,
    /// 产出
    Outbounding,
    Success,
    Failed,
}

impl fmt::Display for ProgressStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressStep::Feeding => "feeding",
            ProgressStep::Preprocessing => "preprocessing",
            ProgressStep::MainProcessing => "main_processing",
            ProgressStep::Outbounding => "outbounding",
            ProgressStep::Success => "success",
            ProgressStep::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 一次进度报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub step: ProgressStep,
    /// 总进度 (0.0 - 1.0)
    pub total_percentage: f64,
    #[serde(default)]
    pub sub_step: Option<String>,
    #[serde(default)]
    pub sub_percentage: Option<f64>,
    pub message: String,
}

impl ProgressReport {
    pub fn new(step: ProgressStep, total_percentage: f64, message: impl Into<String>) -> Self {
        Self {
            step,
            total_percentage: total_percentage.clamp(0.0, 1.0),
            sub_step: None,
            sub_percentage: None,
            message: message.into(),
        }
    }

    /// 附带子阶段信息
    pub fn with_sub(mut self, sub_step: impl Into<String>, sub_percentage: f64) -> Self {
        self.sub_step = Some(sub_step.into());
        self.sub_percentage = Some(sub_percentage.clamp(0.0, 1.0));
        self
    }
}

/// 进度回调 trait
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, progress: ProgressReport);
}

/// 空进度回调实现
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {
    fn on_progress(&self, _progress: ProgressReport) {}
}

/// 函数进度回调实现
///
/// 将闭包包装为 ProgressCallback
pub struct FnProgressCallback<F>
where
    F: Fn(ProgressReport) + Send + Sync,
{
    callback: F,
}

impl<F> FnProgressCallback<F>
where
    F: Fn(ProgressReport) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgressCallback<F>
where
    F: Fn(ProgressReport) + Send + Sync,
{
    fn on_progress(&self, progress: ProgressReport) {
        (self.callback)(progress);
    }
}

/// 子阶段进度映射
///
/// 第 `index` 步 (共 `total` 步) 占区间 `[start, start + width]` 中的 1/total
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubProgress {
    pub offset: f64,
    pub weight: f64,
}

impl SubProgress {
    pub fn new(range_start: f64, range_width: f64, index: usize, total: usize) -> Self {
        if total == 0 {
            return Self {
                offset: range_start,
                weight: range_width,
            };
        }
        let weight = range_width / total as f64;
        Self {
            offset: range_start + weight * index as f64,
            weight,
        }
    }

    /// 子进度 (0.0 - 1.0) 映射为总进度
    pub fn map(&self, sub_percentage: f64) -> f64 {
        self.offset + sub_percentage.clamp(0.0, 1.0) * self.weight
    }

    pub fn end(&self) -> f64 {
        self.offset + self.weight
    }
}

/// 进度跟踪器
///
/// 包装回调，保证上报的总进度单调不减
pub struct ProgressTracker<'a> {
    callback: &'a dyn ProgressCallback,
    last: Mutex<f64>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(callback: &'a dyn ProgressCallback) -> Self {
        Self {
            callback,
            last: Mutex::new(0.0),
        }
    }

    pub fn report(&self, step: ProgressStep, total: f64, message: impl Into<String>) {
        let total = self.advance(total);
        self.callback
            .on_progress(ProgressReport::new(step, total, message));
    }

    pub fn report_sub(
        &self,
        step: ProgressStep,
        total: f64,
        sub_step: impl Into<String>,
        sub_percentage: f64,
        message: impl Into<String>,
    ) {
        let total = self.advance(total);
        self.callback.on_progress(
            ProgressReport::new(step, total, message).with_sub(sub_step, sub_percentage),
        );
    }

    /// 当前已上报的总进度
    pub fn current(&self) -> f64 {
        *self.last.lock()
    }

    fn advance(&self, total: f64) -> f64 {
        let mut last = self.last.lock();
        let clamped = if total.is_nan() { *last } else { total.clamp(0.0, 1.0) };
        *last = last.max(clamped);
        *last
    }
}
