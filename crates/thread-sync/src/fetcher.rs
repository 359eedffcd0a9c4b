use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ThreadId, ThreadSnapshot};

/// Source of authoritative thread state.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Full message list plus thread metadata. Fails with `NotFound` when the thread is gone.
    async fn fetch_snapshot(&self, thread_id: &ThreadId) -> Result<ThreadSnapshot>;
}
