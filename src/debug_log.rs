//! Verbatim per-request debug capture.
//!
//! When `MORPHGATE_DEBUG_DIR` is set every chat request gets its own folder:
//!
//! ```text
//! <dir>/<epoch_ms>_<request_id>/
//!   1_client_request.json     request as received
//!   2_upstream_request.json   converted backend request
//!   3_upstream_request.txt    method, URL, headers (cookie redacted), body
//!   4_upstream_response.txt   raw backend bytes
//!   5_client_response.txt     bytes sent to the client
//! ```
//!
//! Response bodies are appended chunk by chunk as they pass through, so a
//! capture is readable while the stream is still running.
//!
//! Nothing here can fail a request: I/O errors are logged at debug level and dropped.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const CLIENT_REQUEST_FILE: &str = "1_client_request.json";
pub const UPSTREAM_REQUEST_FILE: &str = "2_upstream_request.json";
pub const UPSTREAM_RAW_REQUEST_FILE: &str = "3_upstream_request.txt";
pub const UPSTREAM_RESPONSE_FILE: &str = "4_upstream_response.txt";
pub const CLIENT_RESPONSE_FILE: &str = "5_client_response.txt";

#[derive(Debug, Clone)]
pub struct DebugRecorder {
    dir: PathBuf,
    max_folders: usize,
}

impl DebugRecorder {
    pub fn new(dir: PathBuf, max_folders: usize) -> Self {
        Self {
            dir,
            max_folders: max_folders.max(1),
        }
    }

    /// Open a folder for one request, pruning the oldest ones first.
    pub async fn begin(&self, request_id: &str) -> Option<DebugSession> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            debug!("Debug capture disabled for {}: {}", request_id, e);
            return None;
        }
        self.prune().await;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let folder = self.dir.join(format!("{}_{}", millis, request_id));
        match tokio::fs::create_dir_all(&folder).await {
            Ok(()) => Some(DebugSession { dir: folder }),
            Err(e) => {
                debug!("Failed to create debug folder {:?}: {}", folder, e);
                None
            }
        }
    }

    async fn prune(&self) {
        let mut folders = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Failed to list debug dir {:?}: {}", self.dir, e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                folders.push(entry.path());
            }
        }
        if folders.len() < self.max_folders {
            return;
        }
        // Names start with the epoch millis, so lexical order is age order.
        folders.sort();
        let excess = folders.len() + 1 - self.max_folders;
        for old in folders.into_iter().take(excess) {
            if let Err(e) = tokio::fs::remove_dir_all(&old).await {
                debug!("Failed to remove debug folder {:?}: {}", old, e);
            }
        }
    }
}

/// Capture for a single request.
#[derive(Debug)]
pub struct DebugSession {
    dir: PathBuf,
}

impl DebugSession {
    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub async fn write_json<T: Serialize>(&self, file: &str, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => self.write(file, &bytes).await,
            Err(e) => debug!("Failed to serialize {}: {}", file, e),
        }
    }

    pub async fn write_upstream_request(&self, url: &str, headers: &http::HeaderMap, body: &[u8]) {
        let mut text = format!("POST {}\n", url);
        for (name, value) in headers {
            let value = value.to_str().unwrap_or("<binary>");
            if name == http::header::COOKIE {
                text.push_str(&format!("{}: {}\n", name, redact(value)));
            } else {
                text.push_str(&format!("{}: {}\n", name, value));
            }
        }
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(body));
        self.write(UPSTREAM_RAW_REQUEST_FILE, text.as_bytes()).await;
    }

    pub async fn record_upstream(&self, chunk: &[u8]) {
        self.append(UPSTREAM_RESPONSE_FILE, chunk).await;
    }

    pub async fn record_client(&self, chunk: &[u8]) {
        self.append(CLIENT_RESPONSE_FILE, chunk).await;
    }

    async fn append(&self, file: &str, chunk: &[u8]) {
        let path = self.dir.join(file);
        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let result = match opened {
            Ok(mut f) => f.write_all(chunk).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!("Failed to append to {:?}: {}", path, e);
        }
    }

    async fn write(&self, file: &str, bytes: &[u8]) {
        let path = self.dir.join(file);
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            debug!("Failed to write {:?}: {}", path, e);
        }
    }
}

fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(12).collect();
    format!("{}...[redacted]", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_all_files_and_redacts_cookie() {
        let tmp = TempDir::new().unwrap();
        let recorder = DebugRecorder::new(tmp.path().to_path_buf(), 5);
        let session = recorder.begin("req1").await.unwrap();

        session
            .write_json(CLIENT_REQUEST_FILE, &serde_json::json!({"a": 1}))
            .await;
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            http::HeaderValue::from_static("session=supersecretvalue123"),
        );
        session
            .write_upstream_request("https://backend.test/chat", &headers, b"{}")
            .await;
        session.record_upstream(b"data: x\n\n").await;
        session.record_client(b"event: ping\n\n").await;
        let dir = session.dir().to_path_buf();

        let raw = tokio::fs::read_to_string(dir.join(UPSTREAM_RAW_REQUEST_FILE))
            .await
            .unwrap();
        assert!(raw.starts_with("POST https://backend.test/chat"));
        assert!(raw.contains("session=supe...[redacted]"));
        assert!(!raw.contains("supersecretvalue123"));
        assert_eq!(
            tokio::fs::read(dir.join(UPSTREAM_RESPONSE_FILE))
                .await
                .unwrap(),
            b"data: x\n\n"
        );
        assert!(dir.join(CLIENT_REQUEST_FILE).exists());
        assert!(dir.join(CLIENT_RESPONSE_FILE).exists());
    }

    #[tokio::test]
    async fn keeps_at_most_max_folders() {
        let tmp = TempDir::new().unwrap();
        let recorder = DebugRecorder::new(tmp.path().to_path_buf(), 3);
        for i in 0..6 {
            recorder.begin(&format!("r{}", i)).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let mut count = 0;
        let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            count += 1;
            assert!(!entry.file_name().to_string_lossy().ends_with("_r0"));
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn response_chunks_land_on_disk_as_they_arrive() {
        let tmp = TempDir::new().unwrap();
        let recorder = DebugRecorder::new(tmp.path().to_path_buf(), 5);
        let session = recorder.begin("live").await.unwrap();
        let path = session.dir().join(CLIENT_RESPONSE_FILE);

        session.record_client(b"event: message_start\n\n").await;
        assert_eq!(
            tokio::fs::read(&path).await.unwrap(),
            b"event: message_start\n\n"
        );

        session.record_client(b"event: ping\n\n").await;
        assert_eq!(
            tokio::fs::read(&path).await.unwrap(),
            b"event: message_start\n\nevent: ping\n\n"
        );
        assert!(!session.dir().join(UPSTREAM_RESPONSE_FILE).exists());
    }
}
