//! 插件包下载器
//!
//! 流式下载远程插件包到本地文件，按块回报进度并响应取消

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::types::InstallError;
use crate::logger::sanitize_url;

/// 下载进度回调：(已下载字节, 总字节；未知时为 0)
pub type DownloadProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// 下载远程资源
#[async_trait]
pub trait Downloader: Send + Sync {
    /// 下载到 `target`，返回写入的字节数
    async fn download(
        &self,
        url: &str,
        target: &Path,
        on_progress: DownloadProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, InstallError>;
}

/// 基于 reqwest 的 HTTP 下载器
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, InstallError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plugin-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallError::NetworkError(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        target: &Path,
        on_progress: DownloadProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, InstallError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| InstallError::UrlParseError(format!("{}: {}", sanitize_url(url), e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(InstallError::UrlParseError(format!(
                "不支持的协议: {}",
                parsed.scheme()
            )));
        }
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        info!(
            "[下载] 开始下载: {} -> {}",
            sanitize_url(url),
            target.display()
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            result = self.client.get(parsed).send() => result
                .map_err(|e| InstallError::NetworkError(format!("下载请求失败: {}", e)))?,
        };

        if !response.status().is_success() {
            return Err(InstallError::DownloadFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let total_size = response.content_length().unwrap_or(0);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(target).await?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                chunk = stream.next() => Some(chunk),
            };
            let Some(chunk) = next else {
                drop(file);
                let _ = fs::remove_file(target).await;
                warn!("[下载] 下载已取消: {}", sanitize_url(url));
                return Err(InstallError::Cancelled);
            };
            let Some(chunk) = chunk else { break };

            let chunk =
                chunk.map_err(|e| InstallError::NetworkError(format!("读取数据失败: {}", e)))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total_size);
        }

        file.flush().await?;

        info!("[下载] 下载完成: {} ({} bytes)", target.display(), downloaded);
        Ok(downloaded)
    }
}

/// 从 URL 推断文件名，无法推断时返回 None
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}
