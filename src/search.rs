//! # Mesh Search
//!
//! Answers `MeshSearchRequest`s from other peers by delegating to the host's
//! [`LocalSearch`] capability. The handler never touches the filesystem itself.
//!
//! Bounds applied to every request:
//!
//! - queries longer than `max_query_len` characters are refused before the local
//!   search runs
//! - the whole operation is capped at `time_cap`; when the cap expires the
//!   matches collected so far are returned and the local search task is aborted
//! - at most `min(request.max_results, config.max_results)` files are returned

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SearchConfig;
use crate::messages::{MeshSearchFile, MeshSearchRequest, MeshSearchResponse};
use crate::protocols::LocalSearch;

const RESULT_CHANNEL_CAPACITY: usize = 64;

pub const QUERY_TOO_LONG: &str = "query too long";
pub const QUERY_EMPTY: &str = "query is empty";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    Image,
    Other,
}

impl MediaKind {
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some(
                "mp3" | "flac" | "ogg" | "opus" | "wav" | "aac" | "m4a" | "wma" | "aiff" | "alac" | "ape",
            ) => MediaKind::Audio,
            Some("mp4" | "mkv" | "avi" | "mov" | "webm" | "wmv" | "m4v" | "mpg" | "mpeg" | "flv") => {
                MediaKind::Video
            }
            Some("jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tiff" | "tif" | "heic" | "svg") => {
                MediaKind::Image
            }
            _ => MediaKind::Other,
        }
    }
}

/// One match reported by the host's local search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    pub path: String,
    pub size: u64,
}

impl From<LocalFile> for MeshSearchFile {
    fn from(file: LocalFile) -> Self {
        let media_kind = MediaKind::from_path(&file.path);
        MeshSearchFile {
            filename: file.path,
            size: file.size,
            media_kind,
        }
    }
}

pub struct MeshSearchHandler {
    local: Arc<dyn LocalSearch>,
    config: SearchConfig,
}

impl MeshSearchHandler {
    pub fn new(local: Arc<dyn LocalSearch>, config: SearchConfig) -> Self {
        Self { local, config }
    }

    pub async fn handle(&self, request: MeshSearchRequest, cancel: &CancellationToken) -> MeshSearchResponse {
        let query = request.search_text.trim();
        if request.search_text.chars().count() > self.config.max_query_len {
            return MeshSearchResponse::rejected(&request.request_id, QUERY_TOO_LONG);
        }
        if query.is_empty() {
            return MeshSearchResponse::rejected(&request.request_id, QUERY_EMPTY);
        }

        let limit = match request.max_results as usize {
            0 => self.config.max_results,
            n => n.min(self.config.max_results),
        };

        let (tx, mut rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let local = self.local.clone();
        let owned_query = query.to_string();
        let task = tokio::spawn(async move { local.search_local(&owned_query, tx).await });

        let deadline = tokio::time::Instant::now() + self.config.time_cap();
        let mut files = Vec::new();
        let mut capped = false;
        let mut exhausted = false;
        while files.len() < limit {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(request_id = %request.request_id, "search cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    capped = true;
                    break;
                }
                next = rx.recv() => match next {
                    Some(file) => files.push(MeshSearchFile::from(file)),
                    None => {
                        exhausted = true;
                        break;
                    }
                },
            }
        }
        drop(rx);

        let mut error = None;
        // The sender is gone once the local search returns, so its outcome is ready.
        if exhausted {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(request_id = %request.request_id, error = %e, "local search failed");
                    if files.is_empty() {
                        error = Some("local search failed".to_string());
                    }
                }
                Err(e) => debug!(request_id = %request.request_id, error = %e, "local search task failed"),
            }
        } else {
            task.abort();
        }

        debug!(
            request_id = %request.request_id,
            results = files.len(),
            capped,
            "mesh search answered"
        );
        MeshSearchResponse {
            request_id: request.request_id,
            files,
            error,
        }
    }
}
