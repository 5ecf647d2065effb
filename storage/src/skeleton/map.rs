//! A B-tree map whose nodes can be swapped out to an archiver.

use super::node::{Child, Ghost, Node, NodeArchiver, NodeId, SkeletonNode};
use crate::{
    address::Address,
    serial::{Archiver, IterableArchiver, PullTask, PushTask, ScheduledArchiver},
    Error,
};
use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    mem,
};
use tracing::{debug, trace, warn};

fn corrupt(message: impl Into<String>) -> Error {
    Error::Format(freelib_codec::Error::InvalidData(
        "SkeletonBTreeMap".into(),
        message.into(),
    ))
}

/// The value slot handed to an [SkeletonBTreeMap::update_with] handler.
///
/// A binding for a key already in the map always holds a value. A _fresh_ binding (for a key not
/// yet in the map) holds whatever the handler [Binding::set]s; if it sets nothing, the key is not
/// inserted.
pub struct Binding<'a, K, V> {
    key: &'a K,
    slot: Slot<'a, V>,
}

enum Slot<'a, V> {
    Existing(&'a mut V),
    Fresh(&'a mut Option<V>),
}

impl<K, V> Binding<'_, K, V> {
    pub fn key(&self) -> &K {
        self.key
    }

    /// Whether the key was absent before this update.
    pub fn is_fresh(&self) -> bool {
        matches!(self.slot, Slot::Fresh(_))
    }

    pub fn value(&self) -> Option<&V> {
        match &self.slot {
            Slot::Existing(value) => Some(value),
            Slot::Fresh(value) => value.as_ref(),
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut V> {
        match &mut self.slot {
            Slot::Existing(value) => Some(value),
            Slot::Fresh(value) => value.as_mut(),
        }
    }

    /// Replaces the bound value.
    pub fn set(&mut self, value: V) {
        match &mut self.slot {
            Slot::Existing(slot) => **slot = value,
            Slot::Fresh(slot) => **slot = Some(value),
        }
    }

    /// Returns the bound value, first setting it to `f()` if the binding is empty.
    pub fn get_or_insert_with(&mut self, f: impl FnOnce() -> V) -> &mut V {
        match &mut self.slot {
            Slot::Existing(value) => value,
            Slot::Fresh(value) => value.get_or_insert_with(f),
        }
    }
}

/// Position of an existing key: the resident path from the root and the entry index in its node.
struct Location {
    path: Vec<NodeId>,
    index: usize,
}

impl Location {
    fn node(&self) -> NodeId {
        self.path[self.path.len() - 1]
    }
}

/// An ordered map stored as a B-tree of fixed minimum degree `node_min`.
///
/// Every non-root node holds between `node_min - 1` and `2 * node_min - 1` entries. Any subtree may
/// be a [Ghost]: persisted, with only its address and entry count resident. Queries panic when
/// they reach a ghost; mutations pull the ghosts on their path through the attached
/// [NodeArchiver]. [SkeletonBTreeMap::deflate] pushes every modified node and leaves the map
/// _bare_, with only the root resident.
pub struct SkeletonBTreeMap<K, V> {
    node_min: usize,
    size: usize,
    nodes: Vec<Node<K, V>>,
    free: Vec<NodeId>,
    root: NodeId,
    archiver: Option<NodeArchiver<K, V>>,
}

impl<K, V> SkeletonBTreeMap<K, V> {
    /// Creates an empty, fully resident map.
    ///
    /// # Panics
    ///
    /// Panics if `node_min < 2`.
    pub fn new(node_min: usize) -> Self {
        assert!(node_min >= 2, "node_min must be at least 2");
        Self {
            node_min,
            size: 0,
            nodes: vec![Node::default()],
            free: Vec::new(),
            root: 0,
            archiver: None,
        }
    }

    /// Rebuilds a bare map from a persisted root.
    pub(crate) fn from_root(
        node_min: usize,
        root: SkeletonNode<K, V>,
        archiver: Option<NodeArchiver<K, V>>,
    ) -> Self {
        let size = root.size();
        let node = Node {
            entries: root.entries,
            children: root.children.into_iter().map(Child::Ghost).collect(),
            address: None,
        };
        Self {
            node_min,
            size,
            nodes: vec![node],
            free: Vec::new(),
            root: 0,
            archiver,
        }
    }

    pub fn node_min(&self) -> usize {
        self.node_min
    }

    /// Number of entries, including those in ghost subtrees.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn archiver(&self) -> Option<&NodeArchiver<K, V>> {
        self.archiver.as_ref()
    }

    /// Attaches the archiver used to pull and push nodes.
    pub fn set_archiver(&mut self, archiver: NodeArchiver<K, V>) {
        self.archiver = Some(archiver);
    }

    /// Whether every child of the root is a ghost (trivially true for a single-node map).
    pub fn is_bare(&self) -> bool {
        self.nodes[self.root].all_ghosts()
    }

    /// Whether no ghost remains anywhere in the map.
    pub fn is_resident(&self) -> bool {
        self.resident_ids()
            .iter()
            .all(|id| self.nodes[*id].children.iter().all(|c| matches!(c, Child::Bare(_))))
    }

    /// Number of nodes currently held in memory.
    pub fn resident_nodes(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Entries and ghost children of a bare root.
    pub(crate) fn root_parts(&self) -> Option<(&Vec<(K, V)>, Vec<Ghost>)> {
        let root = &self.nodes[self.root];
        let ghosts = root
            .children
            .iter()
            .map(|child| match child {
                Child::Ghost(ghost) => Some(ghost.clone()),
                Child::Bare(_) => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some((&root.entries, ghosts))
    }

    fn resident_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            ids.push(id);
            for child in &self.nodes[id].children {
                if let Child::Bare(child) = child {
                    stack.push(*child);
                }
            }
        }
        ids
    }

    fn alloc(&mut self, node: Node<K, V>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Node<K, V> {
        self.free.push(id);
        mem::take(&mut self.nodes[id])
    }

    fn release_subtree(&mut self, id: NodeId) {
        let node = self.release(id);
        for child in node.children {
            if let Child::Bare(child) = child {
                self.release_subtree(child);
            }
        }
    }

    fn mark_dirty(&mut self, path: &[NodeId]) {
        for id in path {
            self.nodes[*id].address = None;
        }
    }

    /// Removes a node whose children are all ghosts from the arena.
    fn detach(&mut self, id: NodeId) -> (SkeletonNode<K, V>, Option<Address>) {
        let node = self.release(id);
        let children = node
            .children
            .into_iter()
            .filter_map(|child| match child {
                Child::Ghost(ghost) => Some(ghost),
                Child::Bare(_) => None,
            })
            .collect();
        let skeleton = SkeletonNode {
            entries: node.entries,
            children,
        };
        (skeleton, node.address)
    }

    fn bare_child(&self, parent: NodeId, slot: usize) -> Result<NodeId, Error> {
        match &self.nodes[parent].children[slot] {
            Child::Bare(id) => Ok(*id),
            Child::Ghost(ghost) => Err(corrupt(format!("unexpected ghost {}", ghost.address))),
        }
    }

    /// Walks the resident path to `key`.
    ///
    /// # Panics
    ///
    /// Panics if the path reaches a ghost.
    fn search<Q>(&self, key: &Q) -> Option<(Vec<NodeId>, usize)>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut path = vec![self.root];
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            match node.entries.binary_search_by(|(k, _)| k.borrow().cmp(key)) {
                Ok(index) => return Some((path, index)),
                Err(_) if node.is_leaf() => return None,
                Err(slot) => match &node.children[slot] {
                    Child::Bare(child) => {
                        id = *child;
                        path.push(id);
                    }
                    Child::Ghost(ghost) => panic!(
                        "key lies in ghost subtree {}; inflate it first",
                        ghost.address
                    ),
                },
            }
        }
    }

    /// Whether `key` is present.
    ///
    /// # Panics
    ///
    /// Panics if the path to `key` is not resident.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.search(key).is_some()
    }

    /// # Panics
    ///
    /// Panics if the path to `key` is not resident.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (path, index) = self.search(key)?;
        Some(&self.nodes[path[path.len() - 1]].entries[index].1)
    }

    /// Returns the value for `key`, marking its path modified.
    ///
    /// # Panics
    ///
    /// Panics if the path to `key` is not resident.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (path, index) = self.search(key)?;
        self.mark_dirty(&path);
        let id = path[path.len() - 1];
        Some(&mut self.nodes[id].entries[index].1)
    }

    /// Iterates over entries in key order.
    ///
    /// # Panics
    ///
    /// The iterator panics when it reaches a ghost.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            stack: vec![(self.root, 0)],
        }
    }

    /// # Panics
    ///
    /// The iterator panics when it reaches a ghost.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Applies `f` to every entry held in a resident node, skipping ghost subtrees.
    ///
    /// `f` returns whether it changed the value; nodes holding a changed value are marked
    /// modified.
    pub fn for_each_resident_mut<F>(&mut self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&K, &mut V) -> Result<bool, Error>,
    {
        for id in self.resident_ids() {
            let node = &mut self.nodes[id];
            let mut changed = false;
            for (key, value) in node.entries.iter_mut() {
                changed |= f(key, value)?;
            }
            if changed {
                node.address = None;
            }
        }
        Ok(())
    }
}

impl<K: Ord + Send + 'static, V: Send + 'static> SkeletonBTreeMap<K, V> {
    fn require_archiver(&self) -> Result<NodeArchiver<K, V>, Error> {
        self.archiver
            .clone()
            .ok_or_else(|| Error::abort("no node archiver attached", false))
    }

    /// Installs a pulled node in place of the ghost at `parent.children[slot]`.
    fn attach(
        &mut self,
        parent: NodeId,
        slot: usize,
        pulled: SkeletonNode<K, V>,
    ) -> Result<NodeId, Error> {
        let Child::Ghost(ghost) = &self.nodes[parent].children[slot] else {
            return self.bare_child(parent, slot);
        };
        if pulled.size() != ghost.size {
            return Err(corrupt(format!(
                "node {} holds {} entries, expected {}",
                ghost.address,
                pulled.size(),
                ghost.size
            )));
        }
        let address = ghost.address.clone();
        let id = self.alloc(Node {
            entries: pulled.entries,
            children: pulled.children.into_iter().map(Child::Ghost).collect(),
            address: Some(address),
        });
        self.nodes[parent].children[slot] = Child::Bare(id);
        Ok(id)
    }

    /// Makes `parent.children[slot]` resident, pulling it if it is a ghost.
    fn ensure_bare(&mut self, parent: NodeId, slot: usize) -> Result<NodeId, Error> {
        let address = match &self.nodes[parent].children[slot] {
            Child::Bare(id) => return Ok(*id),
            Child::Ghost(ghost) => ghost.address.clone(),
        };
        let archiver = self.require_archiver()?;
        let mut task = PullTask::new(address);
        archiver.pull(&mut task)?;
        let Some(pulled) = task.data else {
            return Err(Error::abort(format!("no data for {}", task.meta), false));
        };
        trace!(address = %task.meta, "pulled node");
        self.attach(parent, slot, pulled)
    }

    /// Makes the path to `key` resident and finds `key` on it.
    fn locate(&mut self, key: &K) -> Result<Option<Location>, Error> {
        let mut path = vec![self.root];
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            match node.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                Ok(index) => return Ok(Some(Location { path, index })),
                Err(_) if node.is_leaf() => return Ok(None),
                Err(slot) => {
                    id = self.ensure_bare(id, slot)?;
                    path.push(id);
                }
            }
        }
    }

    /// Makes every node on the path to `key` resident.
    pub fn inflate_key(&mut self, key: &K) -> Result<(), Error> {
        self.locate(key).map(|_| ())
    }

    /// Makes the whole map resident, one level at a time.
    ///
    /// With a pool on the archiver, each level is pulled in parallel.
    pub fn inflate(&mut self) -> Result<(), Error> {
        loop {
            let ghosts: Vec<(NodeId, usize, PullTask<SkeletonNode<K, V>>)> = self
                .resident_ids()
                .into_iter()
                .flat_map(|id| {
                    self.nodes[id]
                        .children
                        .iter()
                        .enumerate()
                        .filter_map(move |(slot, child)| match child {
                            Child::Ghost(ghost) => {
                                Some((id, slot, PullTask::new(ghost.address.clone())))
                            }
                            Child::Bare(_) => None,
                        })
                })
                .collect();
            if ghosts.is_empty() {
                return Ok(());
            }
            debug!(nodes = ghosts.len(), "inflating level");

            let archiver = self.require_archiver()?;
            let pulled = match archiver.pool().cloned() {
                Some(pool) => {
                    let mut processor =
                        archiver.pull_schedule::<(NodeId, usize)>(pool, archiver.metrics().clone());
                    for (parent, slot, task) in ghosts {
                        processor.submit(task, (parent, slot))?;
                    }
                    processor
                        .drain()
                        .into_iter()
                        .map(|done| (done.deposit.0, done.deposit.1, done.item, done.result))
                        .collect::<Vec<_>>()
                }
                None => {
                    let (deposits, mut tasks): (Vec<_>, Vec<_>) = ghosts
                        .into_iter()
                        .map(|(parent, slot, task)| ((parent, slot), task))
                        .unzip();
                    archiver.pull_all(&mut tasks)?;
                    deposits
                        .into_iter()
                        .zip(tasks)
                        .map(|((parent, slot), task)| (parent, slot, task, Ok(())))
                        .collect()
                }
            };

            let mut failure = None;
            for (parent, slot, task, result) in pulled {
                let outcome = result.and_then(|()| {
                    let Some(node) = task.data else {
                        return Err(Error::abort(format!("no data for {}", task.meta), false));
                    };
                    self.attach(parent, slot, node)
                });
                if let Err(err) = outcome {
                    failure.get_or_insert(err);
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
    }

    /// Pushes every modified node and replaces every non-root node with a ghost.
    ///
    /// Nodes that were pulled and never modified become ghosts of their original address without
    /// I/O, so deflating a bare map does nothing. Children are always pushed before their parent.
    /// On failure, nodes whose push failed stay resident and the map remains usable.
    pub fn deflate(&mut self) -> Result<(), Error> {
        let mut pushed = 0usize;
        loop {
            let mut candidates = Vec::new();
            let mut stack = vec![self.root];
            while let Some(id) = stack.pop() {
                for (slot, child) in self.nodes[id].children.iter().enumerate() {
                    if let Child::Bare(child) = child {
                        if self.nodes[*child].all_ghosts() {
                            candidates.push((id, slot, *child));
                        } else {
                            stack.push(*child);
                        }
                    }
                }
            }
            if candidates.is_empty() {
                break;
            }

            let (clean, dirty): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|(_, _, id)| self.nodes[*id].address.is_some());
            for (parent, slot, id) in clean {
                let (skeleton, address) = self.detach(id);
                if let Some(address) = address {
                    let size = skeleton.size();
                    self.nodes[parent].children[slot] = Child::Ghost(Ghost { address, size });
                }
            }
            if dirty.is_empty() {
                continue;
            }
            let archiver = self.require_archiver()?;
            let dirty: Vec<_> = dirty
                .into_iter()
                .map(|(parent, slot, id)| (parent, slot, self.detach(id).0))
                .collect();

            debug!(nodes = dirty.len(), "pushing level");
            let results: Vec<(NodeId, usize, PushTask<SkeletonNode<K, V>>, Result<(), Error>)> =
                match archiver.pool().cloned() {
                    Some(pool) => {
                        let mut processor = archiver
                            .push_schedule::<(NodeId, usize)>(pool, archiver.metrics().clone());
                        for (parent, slot, skeleton) in dirty {
                            processor.submit(PushTask::new(skeleton), (parent, slot))?;
                        }
                        processor
                            .drain()
                            .into_iter()
                            .map(|done| (done.deposit.0, done.deposit.1, done.item, done.result))
                            .collect()
                    }
                    None => dirty
                        .into_iter()
                        .map(|(parent, slot, skeleton)| {
                            let mut task = PushTask::new(skeleton);
                            let result = archiver.push(&mut task);
                            (parent, slot, task, result)
                        })
                        .collect(),
                };

            let mut failure = None;
            for (parent, slot, task, result) in results {
                match (result, task.meta) {
                    (Ok(()), Some(address)) => {
                        let size = task.data.size();
                        self.nodes[parent].children[slot] = Child::Ghost(Ghost { address, size });
                        self.nodes[parent].address = None;
                        pushed += 1;
                    }
                    (result, _) => {
                        let id = self.alloc(Node {
                            entries: task.data.entries,
                            children: task.data.children.into_iter().map(Child::Ghost).collect(),
                            address: None,
                        });
                        self.nodes[parent].children[slot] = Child::Bare(id);
                        warn!(parent, slot, "node push failed; keeping it resident");
                        let err = result
                            .err()
                            .unwrap_or_else(|| Error::abort("archiver returned no address", false));
                        failure.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        if pushed > 0 {
            debug!(pushed, size = self.size, "deflated");
        }
        Ok(())
    }

    /// Applies a batch: removes every key in `removes`, then inserts or replaces every entry of
    /// `puts`.
    ///
    /// Replacing an existing entry replaces both its key and its value. Keys that are absent from
    /// the map are ignored by `removes`. The map is not deflated afterwards.
    ///
    /// # Panics
    ///
    /// Panics if a key appears in both `puts` and `removes`.
    pub fn update(&mut self, puts: BTreeMap<K, V>, removes: BTreeSet<K>) -> Result<(), Error> {
        assert!(
            puts.keys().all(|key| !removes.contains(key)),
            "a key may not be both put and removed"
        );
        for key in &removes {
            self.remove_entry(key)?;
        }
        for (key, value) in puts {
            self.put_entry(key, value)?;
        }
        Ok(())
    }

    /// Applies a batch whose new values are computed by `handler`.
    ///
    /// Every key in `removes` is removed first. Then, for every key in `puts`, `handler` receives a
    /// [Binding] to the key's value: the current one if present, otherwise a fresh empty slot.
    /// A fresh slot left empty inserts nothing. The first handler failure aborts the batch;
    /// modifications made before it remain in the resident map.
    ///
    /// # Panics
    ///
    /// Panics if a key appears in both `puts` and `removes`.
    pub fn update_with<E, F>(
        &mut self,
        puts: BTreeSet<K>,
        removes: BTreeSet<K>,
        mut handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(Binding<'_, K, V>) -> Result<(), E>,
        Error: From<E>,
    {
        assert!(
            puts.is_disjoint(&removes),
            "a key may not be both put and removed"
        );
        for key in &removes {
            self.remove_entry(key)?;
        }
        for key in puts {
            match self.locate(&key)? {
                Some(location) => {
                    self.mark_dirty(&location.path);
                    let id = location.node();
                    let (key, value) = &mut self.nodes[id].entries[location.index];
                    handler(Binding {
                        key,
                        slot: Slot::Existing(value),
                    })?;
                }
                None => {
                    let mut value = None;
                    handler(Binding {
                        key: &key,
                        slot: Slot::Fresh(&mut value),
                    })?;
                    if let Some(value) = value {
                        self.insert_absent(key, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Inserts or replaces a single entry.
    pub fn put(&mut self, key: K, value: V) -> Result<(), Error> {
        self.put_entry(key, value)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>, Error> {
        self.remove_entry(key)
    }

    /// Visits every entry in key order, pulling ghost subtrees as needed and swapping each one
    /// back out once it has been visited.
    ///
    /// At most one root-to-leaf path of ghosts is resident at a time. `visit` returns `false` to
    /// stop early. It must not change the persisted form of values, since visited nodes are not
    /// pushed again.
    pub fn for_each_auto_deflate<F>(&mut self, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&K, &mut V) -> Result<bool, Error>,
    {
        self.visit_node(self.root, &mut visit).map(|_| ())
    }

    fn visit_node<F>(&mut self, id: NodeId, visit: &mut F) -> Result<bool, Error>
    where
        F: FnMut(&K, &mut V) -> Result<bool, Error>,
    {
        let count = self.nodes[id].entries.len();
        let internal = !self.nodes[id].is_leaf();
        for index in 0..=count {
            if internal {
                let ghost = match &self.nodes[id].children[index] {
                    Child::Ghost(ghost) => Some(ghost.clone()),
                    Child::Bare(_) => None,
                };
                let child = self.ensure_bare(id, index)?;
                let more = self.visit_node(child, visit)?;
                if let Some(ghost) = ghost {
                    self.release_subtree(child);
                    self.nodes[id].children[index] = Child::Ghost(ghost);
                }
                if !more {
                    return Ok(false);
                }
            }
            if index < count {
                let (key, value) = &mut self.nodes[id].entries[index];
                if !visit(key, value)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn put_entry(&mut self, key: K, value: V) -> Result<(), Error> {
        match self.locate(&key)? {
            Some(location) => {
                self.mark_dirty(&location.path);
                self.nodes[location.node()].entries[location.index] = (key, value);
                Ok(())
            }
            None => self.insert_absent(key, value),
        }
    }

    /// Top-down insertion that splits every full node on the way down.
    fn insert_absent(&mut self, key: K, value: V) -> Result<(), Error> {
        let max = 2 * self.node_min - 1;
        if self.nodes[self.root].entries.len() == max {
            let old = self.root;
            self.root = self.alloc(Node {
                entries: Vec::new(),
                children: vec![Child::Bare(old)],
                address: None,
            });
            self.split_child(self.root, 0)?;
        }

        let mut id = self.root;
        loop {
            self.nodes[id].address = None;
            let mut slot = match self.nodes[id]
                .entries
                .binary_search_by(|(k, _)| k.cmp(&key))
            {
                Ok(index) => {
                    self.nodes[id].entries[index] = (key, value);
                    return Ok(());
                }
                Err(slot) => slot,
            };
            if self.nodes[id].is_leaf() {
                self.nodes[id].entries.insert(slot, (key, value));
                self.size += 1;
                return Ok(());
            }
            let child = self.ensure_bare(id, slot)?;
            if self.nodes[child].entries.len() == max {
                self.split_child(id, slot)?;
                match key.cmp(&self.nodes[id].entries[slot].0) {
                    Ordering::Greater => slot += 1,
                    Ordering::Equal => {
                        self.nodes[id].entries[slot] = (key, value);
                        return Ok(());
                    }
                    Ordering::Less => {}
                }
            }
            id = self.bare_child(id, slot)?;
        }
    }

    /// Splits the full child at `parent.children[slot]` around its median.
    fn split_child(&mut self, parent: NodeId, slot: usize) -> Result<(), Error> {
        let t = self.node_min;
        let child = self.bare_child(parent, slot)?;
        let node = &mut self.nodes[child];
        node.address = None;
        let right_entries = node.entries.split_off(t);
        let Some(median) = node.entries.pop() else {
            return Err(corrupt("split of an empty node"));
        };
        let right_children = if node.is_leaf() {
            Vec::new()
        } else {
            node.children.split_off(t)
        };
        let right = self.alloc(Node {
            entries: right_entries,
            children: right_children,
            address: None,
        });
        let parent = &mut self.nodes[parent];
        parent.entries.insert(slot, median);
        parent.children.insert(slot + 1, Child::Bare(right));
        parent.address = None;
        Ok(())
    }

    fn remove_entry(&mut self, key: &K) -> Result<Option<V>, Error> {
        if self.locate(key)?.is_none() {
            return Ok(None);
        }
        let removed = self.remove_from_root(key)?;
        let root = self.root;
        if self.nodes[root].entries.is_empty() && !self.nodes[root].is_leaf() {
            let child = self.ensure_bare(root, 0)?;
            self.release(root);
            self.root = child;
            self.nodes[child].address = None;
        }
        if removed.is_some() {
            self.size -= 1;
        }
        Ok(removed)
    }

    /// Top-down deletion that tops up every node below the minimum before descending into it.
    fn remove_from_root(&mut self, key: &K) -> Result<Option<V>, Error> {
        let t = self.node_min;
        let mut id = self.root;
        loop {
            self.nodes[id].address = None;
            let found = self.nodes[id].entries.binary_search_by(|(k, _)| k.cmp(key));
            if self.nodes[id].is_leaf() {
                return Ok(found.ok().map(|index| self.nodes[id].entries.remove(index).1));
            }
            match found {
                Ok(index) => {
                    let left = self.ensure_bare(id, index)?;
                    if self.nodes[left].entries.len() >= t {
                        let predecessor = self.pop_max(left)?;
                        let (_, value) = mem::replace(&mut self.nodes[id].entries[index], predecessor);
                        return Ok(Some(value));
                    }
                    let right = self.ensure_bare(id, index + 1)?;
                    if self.nodes[right].entries.len() >= t {
                        let successor = self.pop_min(right)?;
                        let (_, value) = mem::replace(&mut self.nodes[id].entries[index], successor);
                        return Ok(Some(value));
                    }
                    self.merge(id, index, left, right);
                    id = left;
                }
                Err(slot) => {
                    let child = self.ensure_bare(id, slot)?;
                    id = if self.nodes[child].entries.len() < t {
                        self.fill(id, slot)?
                    } else {
                        child
                    };
                }
            }
        }
    }

    fn pop_max(&mut self, mut id: NodeId) -> Result<(K, V), Error> {
        let t = self.node_min;
        loop {
            self.nodes[id].address = None;
            if self.nodes[id].is_leaf() {
                return self.nodes[id]
                    .entries
                    .pop()
                    .ok_or_else(|| corrupt("empty leaf"));
            }
            let last = self.nodes[id].children.len() - 1;
            let child = self.ensure_bare(id, last)?;
            id = if self.nodes[child].entries.len() < t {
                self.fill(id, last)?
            } else {
                child
            };
        }
    }

    fn pop_min(&mut self, mut id: NodeId) -> Result<(K, V), Error> {
        let t = self.node_min;
        loop {
            self.nodes[id].address = None;
            if self.nodes[id].is_leaf() {
                if self.nodes[id].entries.is_empty() {
                    return Err(corrupt("empty leaf"));
                }
                return Ok(self.nodes[id].entries.remove(0));
            }
            let child = self.ensure_bare(id, 0)?;
            id = if self.nodes[child].entries.len() < t {
                self.fill(id, 0)?
            } else {
                child
            };
        }
    }

    /// Brings the minimal child at `parent.children[slot]` up to `node_min` entries by borrowing
    /// from the larger sibling, or merging with a sibling when neither can spare an entry.
    ///
    /// Returns the node that now covers the child's key range.
    fn fill(&mut self, parent: NodeId, slot: usize) -> Result<NodeId, Error> {
        let t = self.node_min;
        let child = self.bare_child(parent, slot)?;
        let left = match slot {
            0 => None,
            _ => Some(self.ensure_bare(parent, slot - 1)?),
        };
        let right = if slot + 1 < self.nodes[parent].children.len() {
            Some(self.ensure_bare(parent, slot + 1)?)
        } else {
            None
        };
        let left_len = left.map_or(0, |id| self.nodes[id].entries.len());
        let right_len = right.map_or(0, |id| self.nodes[id].entries.len());

        match (left, right) {
            (Some(left), _) if left_len >= t && left_len >= right_len => {
                self.borrow_from_left(parent, slot, left, child)?;
                Ok(child)
            }
            (_, Some(right)) if right_len >= t => {
                self.borrow_from_right(parent, slot, child, right);
                Ok(child)
            }
            (_, Some(right)) => {
                self.merge(parent, slot, child, right);
                Ok(child)
            }
            (Some(left), None) => {
                self.merge(parent, slot - 1, left, child);
                Ok(left)
            }
            (None, None) => Err(corrupt("internal node with a single child")),
        }
    }

    fn borrow_from_left(
        &mut self,
        parent: NodeId,
        slot: usize,
        left: NodeId,
        child: NodeId,
    ) -> Result<(), Error> {
        let donor = &mut self.nodes[left];
        donor.address = None;
        let Some(entry) = donor.entries.pop() else {
            return Err(corrupt("empty sibling"));
        };
        let moved = if donor.is_leaf() {
            None
        } else {
            donor.children.pop()
        };
        let separator = mem::replace(&mut self.nodes[parent].entries[slot - 1], entry);
        self.nodes[parent].address = None;
        let node = &mut self.nodes[child];
        node.address = None;
        node.entries.insert(0, separator);
        if let Some(moved) = moved {
            node.children.insert(0, moved);
        }
        Ok(())
    }

    fn borrow_from_right(&mut self, parent: NodeId, slot: usize, child: NodeId, right: NodeId) {
        let donor = &mut self.nodes[right];
        donor.address = None;
        let entry = donor.entries.remove(0);
        let moved = if donor.is_leaf() {
            None
        } else {
            Some(donor.children.remove(0))
        };
        let separator = mem::replace(&mut self.nodes[parent].entries[slot], entry);
        self.nodes[parent].address = None;
        let node = &mut self.nodes[child];
        node.address = None;
        node.entries.push(separator);
        if let Some(moved) = moved {
            node.children.push(moved);
        }
    }

    /// Merges `right` and the separator at `parent.entries[index]` into `left`.
    fn merge(&mut self, parent: NodeId, index: usize, left: NodeId, right: NodeId) {
        let separator = self.nodes[parent].entries.remove(index);
        self.nodes[parent].children.remove(index + 1);
        self.nodes[parent].address = None;
        let absorbed = self.release(right);
        let node = &mut self.nodes[left];
        node.address = None;
        node.entries.push(separator);
        node.entries.extend(absorbed.entries);
        node.children.extend(absorbed.children);
    }
}

/// In-order iterator over a resident [SkeletonBTreeMap].
pub struct Iter<'a, K, V> {
    map: &'a SkeletonBTreeMap<K, V>,
    // (node, next position): position 2i descends into child i, 2i+1 yields entry i.
    stack: Vec<(NodeId, usize)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (id, position) = self.stack.pop()?;
            let node = &self.map.nodes[id];
            let index = position / 2;
            if position % 2 == 0 {
                if index > node.entries.len() {
                    continue;
                }
                self.stack.push((id, position + 1));
                if let Some(child) = node.children.get(index) {
                    match child {
                        Child::Bare(child) => self.stack.push((*child, 0)),
                        Child::Ghost(ghost) => {
                            panic!("iteration reached ghost {}; inflate first", ghost.address)
                        }
                    }
                }
            } else {
                let Some((key, value)) = node.entries.get(index) else {
                    continue;
                };
                self.stack.push((id, position + 1));
                return Some((key, value));
            }
        }
    }
}
