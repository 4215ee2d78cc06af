//! Serialized per-device queue of outbound operations.
//!
//! FIFO with exactly one item in flight. When an item reaches the head it
//! is batched against its successors until batching stops, then executed;
//! transient failures re-run the same merged item without surrendering the
//! head. Duplicate reads are dropped at enqueue time.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use fabric_data::{AttributePath, CommandPath, DataValue};

use crate::contract::ReadParams;
use crate::error::DeviceError;

/// Delivered exactly once when a queued invoke finishes: the command
/// response payload, or the final error after retries.
pub type InvokeCompletion = oneshot::Receiver<Result<Option<DataValue>, DeviceError>>;

/// A batched attribute read.
#[derive(Debug)]
pub struct ReadWork {
    pub paths: Vec<AttributePath>,
    pub params: ReadParams,
}

/// A single attribute write.
#[derive(Debug)]
pub struct WriteWork {
    pub path: AttributePath,
    pub value: DataValue,
    pub timed_timeout: Option<Duration>,
    /// Generation of the expected values installed for this write, for
    /// rollback on failure.
    pub expected_generation: Option<u64>,
}

/// A command invocation.
#[derive(Debug)]
pub struct InvokeWork {
    pub path: CommandPath,
    pub payload: DataValue,
    pub timed_timeout: Option<Duration>,
    pub expected_generation: Option<u64>,
    /// Client-committed deadline recorded at enqueue; the invoke fails
    /// with Timeout if it reaches the head too late.
    pub cutoff: Option<Instant>,
    pub completion: Option<oneshot::Sender<Result<Option<DataValue>, DeviceError>>>,
}

#[derive(Debug)]
pub enum WorkPayload {
    Read(ReadWork),
    Write(WriteWork),
    Invoke(InvokeWork),
}

impl WorkPayload {
    fn kind_name(&self) -> &'static str {
        match self {
            WorkPayload::Read(_) => "read",
            WorkPayload::Write(_) => "write",
            WorkPayload::Invoke(_) => "invoke",
        }
    }
}

/// One queued operation.
#[derive(Debug)]
pub struct WorkItem {
    pub id: u64,
    pub payload: WorkPayload,
}

/// How a head item absorbed its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    NotBatched,
    /// Some payload moved; the successor keeps the rest.
    PartiallyBatched,
    /// The successor was consumed entirely.
    FullyBatched,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(u64),
    /// The new read matched a queued read; the caller answers from cache.
    DroppedDuplicate,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
    next_id: u64,
    draining: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation, dropping duplicate reads.
    ///
    /// Only reads declare duplicates: a read is a duplicate when a queued
    /// read with structurally equal params already covers all its paths.
    /// Writes and invokes never match, which also keeps later reads on
    /// their path from being dropped against them.
    pub fn enqueue(&mut self, payload: WorkPayload) -> EnqueueOutcome {
        if let WorkPayload::Read(new) = &payload {
            let duplicate = self.items.iter().any(|queued| match &queued.payload {
                WorkPayload::Read(existing) => {
                    existing.params == new.params
                        && new.paths.iter().all(|path| existing.paths.contains(path))
                }
                _ => false,
            });
            if duplicate {
                tracing::debug!(kind = payload.kind_name(), "dropping duplicate work item");
                return EnqueueOutcome::DroppedDuplicate;
            }
        }
        self.next_id += 1;
        let id = self.next_id;
        self.items.push_back(WorkItem { id, payload });
        EnqueueOutcome::Enqueued(id)
    }

    /// Claim the drain role. Returns true when the caller should start a
    /// drain task: there is work and nobody is draining yet.
    pub fn begin_drain(&mut self) -> bool {
        if self.draining || self.items.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }

    pub fn end_drain(&mut self) {
        self.draining = false;
    }

    /// Pop the head item, batching successors into it until batching
    /// stops or the queue is exhausted.
    pub fn next_item(&mut self, read_batch_limit: usize) -> Option<WorkItem> {
        let mut head = self.items.pop_front()?;
        while let Some(next) = self.items.front_mut() {
            match batch(&mut head, next, read_batch_limit) {
                BatchOutcome::FullyBatched => {
                    self.items.pop_front();
                }
                BatchOutcome::PartiallyBatched => {}
                BatchOutcome::NotBatched => break,
            }
        }
        Some(head)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop all pending work (device invalidation).
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Batch `next` into `head` where the rules allow it.
///
/// Reads accumulate paths up to the batch limit, but only across items
/// whose params are structurally equal. Writes merge only on an equal
/// path, the newer write replacing the older. Invokes never batch.
fn batch(head: &mut WorkItem, next: &mut WorkItem, read_batch_limit: usize) -> BatchOutcome {
    match (&mut head.payload, &mut next.payload) {
        (WorkPayload::Read(head_read), WorkPayload::Read(next_read)) => {
            if head_read.params != next_read.params {
                return BatchOutcome::NotBatched;
            }
            let capacity = read_batch_limit.saturating_sub(head_read.paths.len());
            if capacity == 0 || next_read.paths.is_empty() {
                return BatchOutcome::NotBatched;
            }
            let moved = capacity.min(next_read.paths.len());
            head_read.paths.extend(next_read.paths.drain(..moved));
            if next_read.paths.is_empty() {
                BatchOutcome::FullyBatched
            } else {
                BatchOutcome::PartiallyBatched
            }
        }
        (WorkPayload::Write(head_write), WorkPayload::Write(next_write)) => {
            if head_write.path != next_write.path {
                return BatchOutcome::NotBatched;
            }
            // Last writer wins inside the queue window; the superseded
            // write's expected value was already replaced in the cache.
            std::mem::swap(head_write, next_write);
            BatchOutcome::FullyBatched
        }
        _ => BatchOutcome::NotBatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(paths: &[AttributePath]) -> WorkPayload {
        WorkPayload::Read(ReadWork {
            paths: paths.to_vec(),
            params: ReadParams::default(),
        })
    }

    fn filtered_read(paths: &[AttributePath]) -> WorkPayload {
        WorkPayload::Read(ReadWork {
            paths: paths.to_vec(),
            params: ReadParams {
                fabric_filtered: true,
            },
        })
    }

    fn write(path: AttributePath, value: bool, generation: u64) -> WorkPayload {
        WorkPayload::Write(WriteWork {
            path,
            value: DataValue::Boolean(value),
            timed_timeout: None,
            expected_generation: Some(generation),
        })
    }

    fn path(attribute: u32) -> AttributePath {
        AttributePath::new(1, 6, attribute)
    }

    #[test]
    fn reads_batch_up_to_the_limit() {
        let mut queue = WorkQueue::new();
        for attribute in 0..12 {
            queue.enqueue(read(&[path(attribute)]));
        }

        let first = queue.next_item(9).unwrap();
        match first.payload {
            WorkPayload::Read(work) => assert_eq!(work.paths.len(), 9),
            other => panic!("expected read, got {:?}", other),
        }

        let second = queue.next_item(9).unwrap();
        match second.payload {
            WorkPayload::Read(work) => assert_eq!(work.paths.len(), 3),
            other => panic!("expected read, got {:?}", other),
        }
        assert!(queue.next_item(9).is_none());
    }

    #[test]
    fn reads_with_differing_params_never_share_a_request() {
        let mut queue = WorkQueue::new();
        queue.enqueue(read(&[path(0)]));
        queue.enqueue(filtered_read(&[path(1)]));

        let first = queue.next_item(9).unwrap();
        match first.payload {
            WorkPayload::Read(work) => assert_eq!(work.paths, vec![path(0)]),
            other => panic!("expected read, got {:?}", other),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn duplicate_read_is_dropped() {
        let mut queue = WorkQueue::new();
        assert!(matches!(
            queue.enqueue(read(&[path(0)])),
            EnqueueOutcome::Enqueued(_)
        ));
        assert_eq!(
            queue.enqueue(read(&[path(0)])),
            EnqueueOutcome::DroppedDuplicate
        );
        // Same path, different params: not a duplicate.
        assert!(matches!(
            queue.enqueue(filtered_read(&[path(0)])),
            EnqueueOutcome::Enqueued(_)
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn read_behind_write_on_same_path_is_kept_and_not_merged() {
        let mut queue = WorkQueue::new();
        queue.enqueue(write(path(0), true, 1));
        assert!(matches!(
            queue.enqueue(read(&[path(0)])),
            EnqueueOutcome::Enqueued(_)
        ));

        let head = queue.next_item(9).unwrap();
        assert!(matches!(head.payload, WorkPayload::Write(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn newer_write_replaces_older_on_same_path() {
        let mut queue = WorkQueue::new();
        queue.enqueue(write(path(0), false, 1));
        queue.enqueue(write(path(0), true, 2));

        let head = queue.next_item(9).unwrap();
        match head.payload {
            WorkPayload::Write(work) => {
                assert_eq!(work.value, DataValue::Boolean(true));
                assert_eq!(work.expected_generation, Some(2));
            }
            other => panic!("expected write, got {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn writes_to_different_paths_stay_separate() {
        let mut queue = WorkQueue::new();
        queue.enqueue(write(path(0), true, 1));
        queue.enqueue(write(path(1), true, 2));

        let head = queue.next_item(9).unwrap();
        match head.payload {
            WorkPayload::Write(work) => assert_eq!(work.path, path(0)),
            other => panic!("expected write, got {:?}", other),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn batching_stops_at_the_first_incompatible_item() {
        let mut queue = WorkQueue::new();
        queue.enqueue(read(&[path(0)]));
        queue.enqueue(write(path(0), true, 1));
        queue.enqueue(read(&[path(1)]));

        // The trailing read must not leapfrog the write.
        let head = queue.next_item(9).unwrap();
        match head.payload {
            WorkPayload::Read(work) => assert_eq!(work.paths, vec![path(0)]),
            other => panic!("expected read, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_role_is_exclusive() {
        let mut queue = WorkQueue::new();
        assert!(!queue.begin_drain());

        queue.enqueue(read(&[path(0)]));
        assert!(queue.begin_drain());
        assert!(!queue.begin_drain());

        queue.end_drain();
        assert!(queue.begin_drain());
    }
}
