//! Nodes of a skeleton tree and the archiver that moves them in and out of storage.

use crate::{
    address::Address,
    scheduler::{Metrics, ObjectProcessor, ThreadPool},
    serial::{
        Archiver, IterableArchiver, LiveArchiver, Progress, PullTask, PushTask, ScheduledArchiver,
    },
    Error,
};
use freelib_codec::{record::invalid, Primitive, Record, Translator};
use std::sync::Arc;

/// Index of a resident node in the tree's arena.
pub(crate) type NodeId = usize;

/// A persisted subtree known only by its address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ghost {
    /// Address of the subtree's root node.
    pub address: Address,

    /// Number of entries in the subtree.
    pub size: usize,
}

/// A child slot: persisted (ghost) or resident (bare).
#[derive(Debug)]
pub(crate) enum Child {
    Ghost(Ghost),
    Bare(NodeId),
}

/// A resident node.
///
/// `address` is the address the node was last pulled from or pushed to. It is cleared whenever
/// the node changes, so a node with an address can become a ghost again without I/O.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub entries: Vec<(K, V)>,
    pub children: Vec<Child>,
    pub address: Option<Address>,
}

impl<K, V> Default for Node<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            children: Vec::new(),
            address: None,
        }
    }
}

impl<K, V> Node<K, V> {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn all_ghosts(&self) -> bool {
        self.children.iter().all(|c| matches!(c, Child::Ghost(_)))
    }
}

/// A node detached from its tree, as transferred by a [NodeArchiver].
///
/// Children are always ghosts: a node can only be pushed once every child has been persisted.
#[derive(Debug)]
pub struct SkeletonNode<K, V> {
    pub entries: Vec<(K, V)>,
    pub children: Vec<Ghost>,
}

impl<K, V> SkeletonNode<K, V> {
    /// Number of entries in the subtree rooted at this node.
    ///
    /// Decoded nodes are checked not to overflow.
    pub fn size(&self) -> usize {
        self.entries.len() + self.children.iter().map(|g| g.size).sum::<usize>()
    }
}

/// Entry count of a subtree with `entries` entries at its root and `children` below.
pub(crate) fn subtree_size(
    entries: usize,
    children: &[Ghost],
) -> Result<usize, freelib_codec::Error> {
    children
        .iter()
        .try_fold(entries, |total, ghost| total.checked_add(ghost.size))
        .ok_or_else(|| {
            freelib_codec::Error::InvalidData(
                "SkeletonNode".into(),
                format!("sizes of {} subnodes overflow", children.len()),
            )
        })
}

/// Encodes a ghost list as `[{meta, size}, ...]`.
pub(crate) fn ghosts_to_record(ghosts: &[Ghost]) -> Record {
    Record::List(
        ghosts
            .iter()
            .map(|ghost| {
                let mut subnode = Record::map();
                subnode.insert("meta", ghost.address.as_str());
                subnode.insert("size", ghost.size as i64);
                subnode
            })
            .collect(),
    )
}

/// Decodes the optional `subnodes` field of a node or tree record.
pub(crate) fn ghosts_from_record(record: &Record) -> Result<Vec<Ghost>, freelib_codec::Error> {
    let subnodes = match record.get("subnodes") {
        None | Some(Record::Null) => return Ok(Vec::new()),
        Some(Record::List(subnodes)) => subnodes,
        Some(other) => return Err(invalid("subnodes", "list", other)),
    };
    subnodes
        .iter()
        .map(|subnode| {
            let address = Address::from_record(subnode.field("meta")?)?;
            let size = subnode.int_field("size")?;
            let size = usize::try_from(size)
                .ok()
                .filter(|&size| size >= 1)
                .ok_or_else(|| freelib_codec::Error::InvalidField {
                    field: "size".into(),
                    expected: "positive subtree size",
                    found: size.to_string(),
                })?;
            Ok(Ghost { address, size })
        })
        .collect()
}

/// Checks that a node with `entries` entries may have `children` children.
pub(crate) fn check_shape(entries: usize, children: usize) -> Result<(), freelib_codec::Error> {
    if children != 0 && children != entries + 1 {
        return Err(freelib_codec::Error::InvalidData(
            "SkeletonNode".into(),
            format!("{entries} entries with {children} children"),
        ));
    }
    Ok(())
}

/// Translates a [SkeletonNode] to `{entries, subnodes}`.
pub struct NodeTranslator<K, V> {
    entries: Arc<dyn Translator<Vec<(K, V)>>>,
}

impl<K, V> NodeTranslator<K, V> {
    pub fn new(entries: Arc<dyn Translator<Vec<(K, V)>>>) -> Self {
        Self { entries }
    }
}

impl<K, V> Translator<SkeletonNode<K, V>> for NodeTranslator<K, V> {
    fn to_record(&self, node: &SkeletonNode<K, V>) -> Result<Record, freelib_codec::Error> {
        let mut record = Record::map();
        record.insert("entries", self.entries.to_record(&node.entries)?);
        if !node.children.is_empty() {
            record.insert("subnodes", ghosts_to_record(&node.children));
        }
        Ok(record)
    }

    fn from_record(&self, record: &Record) -> Result<SkeletonNode<K, V>, freelib_codec::Error> {
        let entries = self.entries.from_record(record.field("entries")?)?;
        let children = ghosts_from_record(record)?;
        check_shape(entries.len(), children.len())?;
        subtree_size(entries.len(), &children)?;
        Ok(SkeletonNode { entries, children })
    }
}

/// Pulls and pushes [SkeletonNode]s through a leaf [Record] archiver.
///
/// When a pool is configured, trees schedule whole levels of node I/O on it.
pub struct NodeArchiver<K, V> {
    store: Arc<dyn LiveArchiver<Record>>,
    translator: Arc<NodeTranslator<K, V>>,
    pool: Option<ThreadPool>,
    metrics: Metrics,
}

impl<K, V> Clone for NodeArchiver<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            translator: self.translator.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<K, V> NodeArchiver<K, V> {
    pub fn new(
        store: Arc<dyn LiveArchiver<Record>>,
        entries: Arc<dyn Translator<Vec<(K, V)>>>,
    ) -> Self {
        Self {
            store,
            translator: Arc::new(NodeTranslator::new(entries)),
            pool: None,
            metrics: Metrics::default(),
        }
    }

    /// Schedules node I/O on `pool`, recording into `metrics`.
    pub fn with_pool(mut self, pool: ThreadPool, metrics: Metrics) -> Self {
        self.pool = Some(pool);
        self.metrics = metrics;
        self
    }

    pub fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The leaf archiver shared by every node.
    pub fn store(&self) -> &Arc<dyn LiveArchiver<Record>> {
        &self.store
    }
}

impl<K, V> Archiver<SkeletonNode<K, V>> for NodeArchiver<K, V> {
    fn pull(&self, task: &mut PullTask<SkeletonNode<K, V>>) -> Result<(), Error> {
        self.pull_live(task, None)
    }

    fn push(&self, task: &mut PushTask<SkeletonNode<K, V>>) -> Result<(), Error> {
        self.push_live(task, None)
    }
}

impl<K, V> IterableArchiver<SkeletonNode<K, V>> for NodeArchiver<K, V> {}

impl<K, V> LiveArchiver<SkeletonNode<K, V>> for NodeArchiver<K, V> {
    fn pull_live(
        &self,
        task: &mut PullTask<SkeletonNode<K, V>>,
        progress: Option<&dyn Progress>,
    ) -> Result<(), Error> {
        let mut raw = PullTask::new(task.meta.clone());
        self.store.pull_live(&mut raw, progress)?;
        let Some(record) = raw.data else {
            return Err(Error::abort(format!("no data for {}", task.meta), false));
        };
        task.data = Some(self.translator.from_record(&record)?);
        Ok(())
    }

    fn push_live(
        &self,
        task: &mut PushTask<SkeletonNode<K, V>>,
        progress: Option<&dyn Progress>,
    ) -> Result<(), Error> {
        let mut raw = PushTask {
            data: self.translator.to_record(&task.data)?,
            meta: task.meta.take(),
        };
        self.store.push_live(&mut raw, progress)?;
        if raw.meta.is_none() {
            return Err(Error::abort("archiver returned no address", false));
        }
        task.meta = raw.meta;
        Ok(())
    }

    fn wait_for_async_inserts(&self) -> Result<(), Error> {
        self.store.wait_for_async_inserts()
    }
}

impl<K: Send + 'static, V: Send + 'static> ScheduledArchiver<SkeletonNode<K, V>>
    for NodeArchiver<K, V>
{
    fn pull_schedule<E: Send + 'static>(
        &self,
        pool: ThreadPool,
        metrics: Metrics,
    ) -> ObjectProcessor<PullTask<SkeletonNode<K, V>>, E> {
        let archiver = self.clone();
        ObjectProcessor::new(
            pool,
            metrics,
            Arc::new(move |task: &mut PullTask<SkeletonNode<K, V>>| archiver.pull(task)),
        )
    }

    fn push_schedule<E: Send + 'static>(
        &self,
        pool: ThreadPool,
        metrics: Metrics,
    ) -> ObjectProcessor<PushTask<SkeletonNode<K, V>>, E> {
        let archiver = self.clone();
        ObjectProcessor::new(
            pool,
            metrics,
            Arc::new(move |task: &mut PushTask<SkeletonNode<K, V>>| archiver.push(task)),
        )
    }
}
