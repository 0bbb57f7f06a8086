//! Reconciles out-of-order WebSocket acknowledgements with Kafka's
//! per-partition, non-decreasing commit API.
//!
//! One stack per consumer socket, owned by that socket's task; there is no
//! shared state and no locking. Entries are kept in delivery order and
//! leave the stack when their offset is covered by a commit, whether that
//! commit came from a client ack, the age sweep, an overflow eviction or
//! the final flush on close.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::frames::WsMessageId;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("offset commit failed: {0}")]
    Commit(String),
}

/// Where committed offsets go. The production implementation commits via
/// the socket's consumer group; tests record the calls.
#[async_trait]
pub trait CommitOffsets: Send + Sync {
    /// Commit `next_offset` (the next offset the group should read) for
    /// `partition`, waiting for the broker ack.
    async fn commit(&self, partition: i32, next_offset: i64) -> Result<(), CommitError>;
}

#[derive(Debug, Clone)]
pub struct CommitStackOptions {
    pub max_stack_size: usize,
    pub auto_commit_max_age: Duration,
}

#[derive(Debug)]
struct CommitEntry {
    id: WsMessageId,
    enqueued_at: Instant,
}

pub struct CommitStack<C> {
    committer: C,
    entries: VecDeque<CommitEntry>,
    /// Highest next-offset committed per partition; commits never regress.
    committed: HashMap<i32, i64>,
    max_size: usize,
    max_age: Duration,
}

impl<C: CommitOffsets> CommitStack<C> {
    pub fn new(committer: C, options: CommitStackOptions) -> Self {
        Self {
            committer,
            entries: VecDeque::new(),
            committed: HashMap::new(),
            max_size: options.max_stack_size.max(1),
            max_age: options.auto_commit_max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a delivered record. A full stack force-commits and evicts its
    /// oldest entry first, bounding the redelivery window on silent
    /// clients.
    pub async fn enqueue(&mut self, id: WsMessageId) -> Result<(), CommitError> {
        if self.entries.len() >= self.max_size {
            if let Some(oldest) = self.entries.pop_front() {
                self.commit_up_to(oldest.id.partition, oldest.id.offset, "overflow")
                    .await?;
            }
        }
        self.entries.push_back(CommitEntry {
            id,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Client acknowledged one record. Commits its offset and tombstones
    /// every older entry on the same partition, which a Kafka commit of
    /// this offset already covers. Returns false for an id the stack does
    /// not hold (already covered, or never delivered).
    pub async fn acknowledge(&mut self, id: &WsMessageId) -> Result<bool, CommitError> {
        if !self.entries.iter().any(|entry| &entry.id == id) {
            debug!(partition = id.partition, offset = id.offset, "stale ack ignored");
            return Ok(false);
        }
        self.commit_up_to(id.partition, id.offset, "ack").await?;
        Ok(true)
    }

    /// Age-based fallback: commit everything older than the configured
    /// max age, highest eligible offset per partition.
    pub async fn sweep(&mut self) -> Result<usize, CommitError> {
        let now = Instant::now();
        let mut expired: HashMap<i32, i64> = HashMap::new();
        for entry in &self.entries {
            if now.duration_since(entry.enqueued_at) < self.max_age {
                continue;
            }
            let offset = expired.entry(entry.id.partition).or_insert(entry.id.offset);
            *offset = (*offset).max(entry.id.offset);
        }

        let before = self.entries.len();
        for (partition, offset) in expired {
            self.commit_up_to(partition, offset, "age").await?;
        }
        Ok(before - self.entries.len())
    }

    /// Commit everything still held and drop the stack. Called on every
    /// socket exit path.
    pub async fn close(mut self) -> Result<(), CommitError> {
        let mut highest: HashMap<i32, i64> = HashMap::new();
        for entry in &self.entries {
            let offset = highest.entry(entry.id.partition).or_insert(entry.id.offset);
            *offset = (*offset).max(entry.id.offset);
        }
        for (partition, offset) in highest {
            self.commit_up_to(partition, offset, "close").await?;
        }
        Ok(())
    }

    /// Commit `offset + 1` on `partition` unless a higher commit already
    /// covers it, then evict every entry the commit covers. This is the
    /// single funnel for commits, so per-partition offsets sent to Kafka
    /// are monotonically non-decreasing by construction.
    async fn commit_up_to(
        &mut self,
        partition: i32,
        offset: i64,
        trigger: &'static str,
    ) -> Result<(), CommitError> {
        let next_offset = offset + 1;
        let already = self.committed.get(&partition).copied().unwrap_or(0);
        if next_offset > already {
            self.committer.commit(partition, next_offset).await?;
            self.committed.insert(partition, next_offset);
            counter!("wsproxy_offsets_committed_total", "trigger" => trigger).increment(1);
        }
        self.entries
            .retain(|entry| entry.id.partition != partition || entry.id.offset > offset);
        Ok(())
    }
}
