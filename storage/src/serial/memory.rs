//! In-memory content-addressed block store.

use super::{Archiver, IterableArchiver, LiveArchiver, Progress, PullTask, PushTask};
use crate::{
    address::{Address, AddressKind},
    Error,
};
use bytes::Bytes;
use freelib_codec::{ObjectStreamReader, ObjectStreamWriter, Record};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::trace;

/// Configuration for [MemoryArchiver].
#[derive(Clone)]
pub struct Config<S> {
    /// Framing used to turn records into blocks.
    pub stream: S,

    /// Registry for metrics, if any.
    pub registry: Option<Arc<Mutex<Registry>>>,
}

/// Keeps every pushed block in memory.
///
/// Blocks are addressed by their content hash unless the push names a non-content-hash address
/// to insert under.
pub struct MemoryArchiver<S> {
    stream: S,
    blocks: Mutex<HashMap<Address, Bytes>>,

    pulls: Counter,
    pushes: Counter,
}

impl<S> MemoryArchiver<S> {
    pub fn new(cfg: Config<S>) -> Self {
        let pulls = Counter::default();
        let pushes = Counter::default();
        if let Some(registry) = &cfg.registry {
            let mut registry = registry.lock().unwrap();
            registry.register("pulls", "Number of blocks pulled", pulls.clone());
            registry.register("pushes", "Number of blocks pushed", pushes.clone());
        }
        Self {
            stream: cfg.stream,
            blocks: Mutex::new(HashMap::new()),
            pulls,
            pushes,
        }
    }

    /// Number of pulls served so far.
    pub fn pulls(&self) -> u64 {
        self.pulls.get()
    }

    /// Number of pushes accepted so far.
    pub fn pushes(&self) -> u64 {
        self.pushes.get()
    }

    /// Number of distinct blocks stored.
    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a block is stored under `address`.
    pub fn contains(&self, address: &Address) -> bool {
        self.blocks.lock().unwrap().contains_key(address)
    }

    /// Replaces the block stored under `address` (used to simulate corruption).
    pub fn overwrite(&self, address: &Address, block: Bytes) {
        self.blocks.lock().unwrap().insert(address.clone(), block);
    }
}

impl<S: ObjectStreamReader + ObjectStreamWriter> Archiver<Record> for MemoryArchiver<S> {
    fn pull(&self, task: &mut PullTask<Record>) -> Result<(), Error> {
        self.pull_live(task, None)
    }

    fn push(&self, task: &mut PushTask<Record>) -> Result<(), Error> {
        self.push_live(task, None)
    }
}

impl<S: ObjectStreamReader + ObjectStreamWriter> IterableArchiver<Record> for MemoryArchiver<S> {}

impl<S: ObjectStreamReader + ObjectStreamWriter> LiveArchiver<Record> for MemoryArchiver<S> {
    fn pull_live(
        &self,
        task: &mut PullTask<Record>,
        progress: Option<&dyn Progress>,
    ) -> Result<(), Error> {
        if let Some(progress) = progress {
            progress.add_part_known(1, true);
        }
        let block = self.blocks.lock().unwrap().get(&task.meta).cloned();
        let Some(block) = block else {
            return Err(Error::abort(format!("block not found: {}", task.meta), false));
        };
        task.data = Some(self.stream.read_object(&block)?);
        self.pulls.inc();
        trace!(address = %task.meta, len = block.len(), "pulled block");
        if let Some(progress) = progress {
            progress.add_part_done();
        }
        Ok(())
    }

    fn push_live(
        &self,
        task: &mut PushTask<Record>,
        progress: Option<&dyn Progress>,
    ) -> Result<(), Error> {
        if let Some(progress) = progress {
            progress.add_part_known(1, true);
        }
        let block = self.stream.write_object(&task.data)?;
        let address = match task.meta.take() {
            Some(hint) if hint.kind() != AddressKind::Chk => hint,
            _ => Address::content_hash(&block),
        };
        trace!(%address, len = block.len(), "pushed block");
        self.blocks.lock().unwrap().insert(address.clone(), block);
        self.pushes.inc();
        task.meta = Some(address);
        if let Some(progress) = progress {
            progress.add_part_done();
        }
        Ok(())
    }

    fn wait_for_async_inserts(&self) -> Result<(), Error> {
        Ok(())
    }
}
