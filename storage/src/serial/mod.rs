//! Push/pull archivers for content-addressed blocks.
//!
//! # Tiers
//!
//! Each tier extends the previous one:
//! - [Archiver]: `pull` a block by address into a typed value, or `push` a value and learn its
//!   address.
//! - [IterableArchiver]: batch variants that may reuse one underlying connection for many tasks.
//! - [LiveArchiver]: reports progress to an optional [Progress] sink and exposes a
//!   [LiveArchiver::wait_for_async_inserts] barrier for pushes that complete in the background.
//! - [ScheduledArchiver]: hands tasks to an [crate::scheduler::ObjectProcessor] for parallel
//!   execution.
//!
//! An address that cannot be read is an [crate::Error::Abort], never an empty result.
//!
//! # Implementations
//!
//! [MemoryArchiver] keeps blocks in memory. [FileArchiver] keeps one file per block in a
//! directory, optionally compressed with `zstd` and optionally written in the background on a
//! thread pool. Both frame [freelib_codec::Record]s with an injected object stream.

use crate::{
    address::Address,
    scheduler::{Metrics, ObjectProcessor, ThreadPool},
    Error,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

mod file;
mod memory;

pub use file::{Config as FileConfig, FileArchiver};
pub use memory::{Config as MemoryConfig, MemoryArchiver};

/// A request to fetch the block named by `meta`.
#[derive(Debug)]
pub struct PullTask<T> {
    /// Address to fetch.
    pub meta: Address,

    /// Populated by a successful pull.
    pub data: Option<T>,
}

impl<T> PullTask<T> {
    pub fn new(meta: Address) -> Self {
        Self { meta, data: None }
    }
}

/// A request to store `data`.
#[derive(Debug)]
pub struct PushTask<T> {
    /// Value to store.
    pub data: T,

    /// Optional insertion hint before the push; the resulting address after it.
    pub meta: Option<Address>,
}

impl<T> PushTask<T> {
    pub fn new(data: T) -> Self {
        Self { data, meta: None }
    }

    /// Creates a task that asks the archiver to store `data` under `meta`.
    pub fn with_meta(data: T, meta: Address) -> Self {
        Self {
            data,
            meta: Some(meta),
        }
    }
}

/// Single-task pull/push.
pub trait Archiver<T>: Send + Sync {
    /// Fetches `task.meta` into `task.data`.
    fn pull(&self, task: &mut PullTask<T>) -> Result<(), Error>;

    /// Stores `task.data` and records its address in `task.meta`.
    fn push(&self, task: &mut PushTask<T>) -> Result<(), Error>;
}

/// Batch pull/push.
pub trait IterableArchiver<T>: Archiver<T> {
    /// Pulls every task, stopping at the first failure.
    fn pull_all(&self, tasks: &mut [PullTask<T>]) -> Result<(), Error> {
        for task in tasks.iter_mut() {
            self.pull(task)?;
        }
        Ok(())
    }

    /// Pushes every task, stopping at the first failure.
    fn push_all(&self, tasks: &mut [PushTask<T>]) -> Result<(), Error> {
        for task in tasks.iter_mut() {
            self.push(task)?;
        }
        Ok(())
    }
}

/// Receives granular completion reports from long-running operations.
pub trait Progress: Send + Sync {
    /// Announces `parts` more parts; `finalized` when no further parts will be announced.
    fn add_part_known(&self, parts: u64, finalized: bool);

    /// Marks one announced part as done.
    fn add_part_done(&self);
}

/// Progress-reporting pull/push with an asynchronous insert barrier.
pub trait LiveArchiver<T>: IterableArchiver<T> {
    fn pull_live(&self, task: &mut PullTask<T>, progress: Option<&dyn Progress>)
        -> Result<(), Error>;

    fn push_live(&self, task: &mut PushTask<T>, progress: Option<&dyn Progress>)
        -> Result<(), Error>;

    /// Blocks until every push issued before this call has durably completed.
    ///
    /// Returns the first failure among those pushes.
    fn wait_for_async_inserts(&self) -> Result<(), Error>;
}

/// Queue-based asynchronous pull/push.
///
/// The returned processors accept tasks together with a caller-supplied deposit and publish each
/// finished task with its deposit and outcome.
pub trait ScheduledArchiver<T>: LiveArchiver<T> {
    fn pull_schedule<E: Send + 'static>(
        &self,
        pool: ThreadPool,
        metrics: Metrics,
    ) -> ObjectProcessor<PullTask<T>, E>;

    fn push_schedule<E: Send + 'static>(
        &self,
        pool: ThreadPool,
        metrics: Metrics,
    ) -> ObjectProcessor<PushTask<T>, E>;
}

/// A thread-safe [Progress] that counts parts.
#[derive(Debug, Default)]
pub struct SimpleProgress {
    known: AtomicU64,
    done: AtomicU64,
    finalized: AtomicBool,
}

impl SimpleProgress {
    pub fn known(&self) -> u64 {
        self.known.load(Ordering::Acquire)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Acquire)
    }

    /// Whether the total is final and every part is done.
    pub fn is_complete(&self) -> bool {
        self.finalized.load(Ordering::Acquire) && self.done() >= self.known()
    }
}

impl Progress for SimpleProgress {
    fn add_part_known(&self, parts: u64, finalized: bool) {
        self.known.fetch_add(parts, Ordering::AcqRel);
        if finalized {
            self.finalized.store(true, Ordering::Release);
        }
    }

    fn add_part_done(&self) {
        self.done.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freelib_codec::{BinaryStream, Record};

    #[test]
    fn test_simple_progress() {
        let progress = SimpleProgress::default();
        progress.add_part_known(2, false);
        progress.add_part_done();
        assert!(!progress.is_complete());
        progress.add_part_known(1, true);
        progress.add_part_done();
        assert!(!progress.is_complete());
        progress.add_part_done();
        assert!(progress.is_complete());
        assert_eq!(progress.known(), 3);
        assert_eq!(progress.done(), 3);
    }

    #[test]
    fn test_iterable_defaults() {
        let archiver = MemoryArchiver::new(MemoryConfig {
            stream: BinaryStream::default(),
            registry: None,
        });
        let mut pushes: Vec<_> = (0..3i64)
            .map(|i| PushTask::new(Record::Int(i)))
            .collect();
        archiver.push_all(&mut pushes).unwrap();

        let mut pulls: Vec<_> = pushes
            .iter()
            .map(|task| PullTask::new(task.meta.clone().unwrap()))
            .collect();
        archiver.pull_all(&mut pulls).unwrap();
        for (i, task) in pulls.iter().enumerate() {
            assert_eq!(task.data, Some(Record::Int(i as i64)));
        }
    }
}
