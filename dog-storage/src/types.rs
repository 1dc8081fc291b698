use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Cancelled;

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Per-call context: request correlation, cancellation, and an optional deadline.
///
/// Cloning shares the cancellation token, so cancelling any clone cancels the call.
#[derive(Debug, Clone)]
pub struct StorageCtx {
    pub request_id: String,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl StorageCtx {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A context whose cancellation follows this one but can also be cancelled alone
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the call is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Drive `fut` unless the call is cancelled first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = self.done() => Err(Cancelled),
            output = fut => Ok(output),
        }
    }
}

impl Default for StorageCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a single save call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Explicit media type; always wins over detection
    pub content_type: Option<String>,
    /// Sniff the media type from the first bytes when no explicit type is set
    pub auto_content_type: bool,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        let content_type = content_type.into();
        self.content_type = (!content_type.is_empty()).then_some(content_type);
        self
    }

    pub fn with_auto_content_type(mut self) -> Self {
        self.auto_content_type = true;
        self
    }

    /// Whether the stream has to be sniffed before upload
    pub(crate) fn needs_sniffing(&self) -> bool {
        self.content_type.is_none() && self.auto_content_type
    }
}

/// Metadata about a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            content_type: None,
            etag: None,
            last_modified: None,
        }
    }
}

/// Receipt returned after an object is fully persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub key: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// Number of parts; 1 for single-shot uploads
    pub parts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_content_type_disables_sniffing() {
        let opts = SaveOptions::new()
            .with_auto_content_type()
            .with_content_type("image/png");
        assert!(!opts.needs_sniffing());

        let opts = SaveOptions::new().with_auto_content_type();
        assert!(opts.needs_sniffing());

        // An empty explicit type counts as unset
        let opts = SaveOptions::new().with_content_type("").with_auto_content_type();
        assert!(opts.needs_sniffing());

        assert!(!SaveOptions::new().needs_sniffing());
    }

    #[tokio::test]
    async fn child_context_follows_parent_cancellation() {
        let parent = StorageCtx::new().with_request_id("req-1");
        let child = parent.child();
        assert_eq!(child.request_id, "req-1");

        child.cancel.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());

        let other = parent.child();
        parent.cancel.cancel();
        other.done().await;
        assert!(other.is_done());
    }

    #[tokio::test]
    async fn run_stops_at_cancellation() {
        let ctx = StorageCtx::new();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));

        ctx.cancel.cancel();
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_resolves_done() {
        let ctx = StorageCtx::new().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_done());
        ctx.done().await;
        assert!(ctx.is_done());
    }
}
