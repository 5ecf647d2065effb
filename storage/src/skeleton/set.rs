use super::{NodeArchiver, SkeletonBTreeMap};
use crate::Error;
use std::{borrow::Borrow, collections::BTreeSet};

/// An ordered set backed by a [SkeletonBTreeMap] with unit values.
pub struct SkeletonBTreeSet<E> {
    map: SkeletonBTreeMap<E, ()>,
}

impl<E> SkeletonBTreeSet<E> {
    /// Creates an empty, fully resident set.
    ///
    /// # Panics
    ///
    /// Panics if `node_min < 2`.
    pub fn new(node_min: usize) -> Self {
        Self {
            map: SkeletonBTreeMap::new(node_min),
        }
    }

    pub(crate) fn from_map(map: SkeletonBTreeMap<E, ()>) -> Self {
        Self { map }
    }

    pub(crate) fn as_map(&self) -> &SkeletonBTreeMap<E, ()> {
        &self.map
    }

    pub fn node_min(&self) -> usize {
        self.map.node_min()
    }

    /// Number of elements, including those in ghost subtrees.
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Same as [Self::size].
    pub fn len(&self) -> usize {
        self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_bare(&self) -> bool {
        self.map.is_bare()
    }

    pub fn is_resident(&self) -> bool {
        self.map.is_resident()
    }

    pub fn set_archiver(&mut self, archiver: NodeArchiver<E, ()>) {
        self.map.set_archiver(archiver);
    }

    /// # Panics
    ///
    /// Panics if the path to `element` is not resident.
    pub fn contains<Q>(&self, element: &Q) -> bool
    where
        E: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.map.contains_key(element)
    }

    /// Iterates over elements in order.
    ///
    /// # Panics
    ///
    /// The iterator panics when it reaches a ghost.
    pub fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        self.map.keys()
    }
}

impl<E: Ord + Send + 'static> SkeletonBTreeSet<E> {
    /// Adds `element`, returning whether it was absent.
    pub fn add(&mut self, element: E) -> Result<bool, Error> {
        let mut added = false;
        self.map
            .update_with(BTreeSet::from([element]), BTreeSet::new(), |mut binding| {
                added = binding.is_fresh();
                binding.set(());
                Ok::<_, Error>(())
            })?;
        Ok(added)
    }

    /// Removes `element`, returning whether it was present.
    pub fn remove(&mut self, element: &E) -> Result<bool, Error> {
        Ok(self.map.remove(element)?.is_some())
    }

    /// Removes every element of `removes`, then adds every element of `adds`.
    ///
    /// # Panics
    ///
    /// Panics if an element appears in both.
    pub fn update(&mut self, adds: BTreeSet<E>, removes: BTreeSet<E>) -> Result<(), Error> {
        self.map
            .update(adds.into_iter().map(|e| (e, ())).collect(), removes)
    }

    pub fn inflate(&mut self) -> Result<(), Error> {
        self.map.inflate()
    }

    pub fn inflate_key(&mut self, element: &E) -> Result<(), Error> {
        self.map.inflate_key(element)
    }

    pub fn deflate(&mut self) -> Result<(), Error> {
        self.map.deflate()
    }

    /// Visits every element in order, pulling and releasing ghost subtrees as it goes.
    pub fn for_each_auto_deflate<F>(&mut self, mut visit: F) -> Result<(), Error>
    where
        F: FnMut(&E) -> Result<bool, Error>,
    {
        self.map.for_each_auto_deflate(|element, _| visit(element))
    }
}
