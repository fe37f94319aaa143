//! The boundary to an external memory/context collaborator.
//!
//! The kernel does not know how memories are stored or searched. It only
//! forwards `remember`, `recall` and `index` calls to whatever implements
//! [`MemoryBridge`], and answers with an empty result when nothing is
//! configured (see [`Kernel::remember`][crate::daemon::Kernel::remember]).

use async_trait::async_trait;
use corelink_types::{CoreError, Metadata};
use serde_json::Value;

/// Every memory collaborator must implement this trait.
///
/// # Contract
///
/// * `remember` – store `content` under `key` and return the collaborator's
///   identifier for the stored entry.
/// * `recall` – return at most `limit` entries relevant to `query`, most
///   relevant first.
/// * `index` – ingest a batch of documents and return how many were indexed.
#[async_trait]
pub trait MemoryBridge: Send + Sync {
    async fn remember(&self, key: &str, content: Value, metadata: Metadata) -> Result<String, CoreError>;

    async fn recall(&self, query: &str, limit: usize) -> Result<Vec<Value>, CoreError>;

    async fn index(&self, documents: Vec<Value>) -> Result<usize, CoreError>;
}
