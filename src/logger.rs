//! 日志管理模块
//!
//! `init` 安装 tracing 订阅器：终端输出 + 写入 [`LogStore`]。
//! LogStore 在内存中保留最近的日志供宿主界面展示，并可写入按大小轮转的日志文件
use chrono::{Duration, Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_NAME: &str = "plugin-runtime.log";

#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub max_logs: usize,
    pub retention_days: u32,
    pub max_file_size: u64,
    pub enable_file_logging: bool,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_logs: 1000,
            retention_days: 7,
            max_file_size: 10 * 1024 * 1024,
            enable_file_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// 日志存储，默认只保存在内存中
#[derive(Default)]
pub struct LogStore {
    logs: VecDeque<LogEntry>,
    config: LogStoreConfig,
    log_file_path: Option<PathBuf>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(logging: &LoggingConfig) -> Self {
        let config = LogStoreConfig {
            max_logs: logging.max_logs.max(1),
            retention_days: logging.retention_days,
            max_file_size: logging.max_file_size,
            enable_file_logging: logging.enabled,
        };
        let log_file_path = logging.enabled.then(|| {
            let dir = logging.resolved_log_dir();
            let _ = fs::create_dir_all(&dir);
            dir.join(LOG_FILE_NAME)
        });
        Self {
            logs: VecDeque::new(),
            config,
            log_file_path,
        }
    }

    /// 指定日志文件，主要用于测试
    pub fn with_log_file(mut self, path: PathBuf, max_file_size: u64) -> Self {
        if let Some(dir) = path.parent() {
            let _ = fs::create_dir_all(dir);
        }
        self.config.enable_file_logging = true;
        self.config.max_file_size = max_file_size;
        self.log_file_path = Some(path);
        self
    }

    pub fn add(&mut self, level: &str, message: &str) {
        let sanitized = sanitize_log_message(message);
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: sanitized,
        };

        if self.config.enable_file_logging {
            if let Some(path) = self.log_file_path.clone() {
                self.rotate_log_file_if_needed(&path);
                let local_time = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                let log_line = format!(
                    "{} [{}] {}\n",
                    local_time,
                    level.to_uppercase(),
                    entry.message
                );
                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
                    let _ = file.write_all(log_line.as_bytes());
                }
            }
        }

        self.logs.push_back(entry);
        while self.logs.len() > self.config.max_logs.max(1) {
            self.logs.pop_front();
        }
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.logs.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }

    pub fn get_log_file_path(&self) -> Option<&Path> {
        self.log_file_path.as_deref()
    }

    fn rotate_log_file_if_needed(&self, path: &Path) {
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };
        if metadata.len() <= self.config.max_file_size {
            return;
        }

        let suffix = Local::now().format("%Y%m%d-%H%M%S%.3f");
        let rotated = path.with_file_name(format!(
            "{}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            suffix
        ));
        let _ = fs::rename(path, &rotated);
        self.prune_old_logs(path);
    }

    /// 压缩一天前轮转出的文件，删除超过保留期的文件
    fn prune_old_logs(&self, path: &Path) {
        let Some(dir) = path.parent() else {
            return;
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let archive_cutoff = Utc::now() - Duration::days(1);
        let delete_cutoff = Utc::now() - Duration::days(i64::from(self.config.retention_days));
        let prefix = format!(
            "{}.",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let modified = chrono::DateTime::<Utc>::from(modified);
            let rotated = entry.path();

            if modified < delete_cutoff {
                let _ = fs::remove_file(&rotated);
            } else if !file_name.ends_with(".gz") && modified < archive_cutoff {
                archive(&rotated);
            }
        }
    }
}

fn archive(path: &Path) {
    let Ok(mut file) = fs::File::open(path) else {
        return;
    };
    let mut input = Vec::new();
    if file.read_to_end(&mut input).is_err() {
        return;
    }

    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    if let Ok(gz_file) = fs::File::create(&gz_path) {
        let mut encoder = GzEncoder::new(gz_file, Compression::default());
        if encoder.write_all(&input).is_ok() && encoder.finish().is_ok() {
            let _ = fs::remove_file(path);
        }
    }
}

pub type SharedLogStore = Arc<RwLock<LogStore>>;

/// 把 tracing 事件写入 LogStore 的层
pub struct LogStoreLayer {
    store: SharedLogStore,
}

impl LogStoreLayer {
    pub fn new(store: SharedLogStore) -> Self {
        Self { store }
    }
}

impl<S: Subscriber> Layer<S> for LogStoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = event.metadata().level().to_string().to_lowercase();
        self.store.write().add(&level, &visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// 初始化全局日志订阅器
///
/// `RUST_LOG` 优先于配置中的级别；重复调用时保留已安装的订阅器
pub fn init(config: &LoggingConfig) -> SharedLogStore {
    let store: SharedLogStore = Arc::new(RwLock::new(LogStore::with_config(config)));
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(LogStoreLayer::new(store.clone()))
        .try_init();
    store
}

static SENSITIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"Bearer\s+[A-Za-z0-9._-]+", "Bearer ***"),
        (
            r#"api[_-]?key["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "api_key: ***",
        ),
        (
            r#"access[_-]?token["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "access_token: ***",
        ),
        (r#"\btoken["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#, "token: ***"),
        (
            r#"[Aa]uthorization["']?\s*[:=]\s*["']?[A-Za-z0-9._\s-]+"#,
            "authorization: ***",
        ),
        (r#"password["']?\s*[:=]\s*["']?[^\s"',}]+"#, "password: ***"),
        (
            r#"secret["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "secret: ***",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

static URL_USERINFO: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^([a-z][a-z0-9+.-]*://)[^/@\s]+@").ok());

static URL_SECRET_PARAM: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)([?&](?:access_token|token|api[_-]?key|key|secret|signature|sig|password|auth|x-amz-signature|x-amz-credential)=)[^&#]*",
    )
    .ok()
});

/// 日志脱敏
pub fn sanitize_log_message(message: &str) -> String {
    let mut sanitized = message.to_string();
    for (re, replacement) in SENSITIVE_PATTERNS.iter() {
        sanitized = re.replace_all(&sanitized, *replacement).into_owned();
    }
    sanitized
}

/// 屏蔽下载地址中的凭据和签名参数
pub fn sanitize_url(url: &str) -> String {
    let mut sanitized = url.to_string();
    if let Some(re) = URL_USERINFO.as_ref() {
        sanitized = re.replace(&sanitized, "${1}***@").into_owned();
    }
    if let Some(re) = URL_SECRET_PARAM.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}***").into_owned();
    }
    sanitized
}
