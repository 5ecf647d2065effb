//! Translators for skeleton nodes and whole skeleton trees.

use super::{
    node::{
        check_shape, ghosts_from_record, ghosts_to_record, subtree_size, NodeArchiver,
        SkeletonNode,
    },
    SkeletonBTreeMap, SkeletonBTreeSet,
};
use freelib_codec::{record::invalid, Error, KeyTranslator, Record, Translator};
use std::{collections::BTreeMap, sync::Arc};

/// Rejects entry lists that are not strictly increasing after sorting.
fn sort_unique<K: Ord, V>(entries: &mut [(K, V)]) -> Result<(), Error> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    if entries.windows(2).any(|pair| pair[0].0 == pair[1].0) {
        return Err(Error::InvalidData("entries".into(), "duplicate key".into()));
    }
    Ok(())
}

/// Encodes map entries as a record map from key string to value record.
pub struct MapEntries<K, V> {
    keys: Arc<dyn KeyTranslator<K>>,
    values: Arc<dyn Translator<V>>,
}

impl<K, V> MapEntries<K, V> {
    pub fn new(keys: Arc<dyn KeyTranslator<K>>, values: Arc<dyn Translator<V>>) -> Self {
        Self { keys, values }
    }
}

impl<K: Ord, V> Translator<Vec<(K, V)>> for MapEntries<K, V> {
    fn to_record(&self, entries: &Vec<(K, V)>) -> Result<Record, Error> {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            let raw = self.keys.key_to_string(key);
            if map.insert(raw.clone(), self.values.to_record(value)?).is_some() {
                return Err(Error::Unencodable(format!("key string {raw} is not unique")));
            }
        }
        Ok(Record::Map(map))
    }

    fn from_record(&self, record: &Record) -> Result<Vec<(K, V)>, Error> {
        let map = record
            .as_map()
            .ok_or_else(|| invalid("entries", "map", record))?;
        let mut entries = map
            .iter()
            .map(|(raw, value)| {
                Ok((
                    self.keys.key_from_string(raw)?,
                    self.values.from_record(value)?,
                ))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        sort_unique(&mut entries)?;
        Ok(entries)
    }
}

/// Encodes set elements as a record list.
pub struct SetEntries<E> {
    elements: Arc<dyn Translator<E>>,
}

impl<E> SetEntries<E> {
    pub fn new(elements: Arc<dyn Translator<E>>) -> Self {
        Self { elements }
    }
}

impl<E: Ord> Translator<Vec<(E, ())>> for SetEntries<E> {
    fn to_record(&self, entries: &Vec<(E, ())>) -> Result<Record, Error> {
        entries
            .iter()
            .map(|(element, ())| self.elements.to_record(element))
            .collect::<Result<Vec<_>, _>>()
            .map(Record::List)
    }

    fn from_record(&self, record: &Record) -> Result<Vec<(E, ())>, Error> {
        let list = record
            .as_list()
            .ok_or_else(|| invalid("entries", "list", record))?;
        let mut entries = list
            .iter()
            .map(|element| Ok((self.elements.from_record(element)?, ())))
            .collect::<Result<Vec<_>, Error>>()?;
        sort_unique(&mut entries)?;
        Ok(entries)
    }
}

/// Encodes a bare [SkeletonBTreeMap] as `{node_min, size, entries, subnodes}`.
///
/// Decoded maps are bare and use the configured archiver to pull the rest of their nodes.
pub struct TreeTranslator<K, V> {
    entries: Arc<dyn Translator<Vec<(K, V)>>>,
    archiver: Option<NodeArchiver<K, V>>,
}

impl<K, V> TreeTranslator<K, V> {
    pub fn new(
        entries: Arc<dyn Translator<Vec<(K, V)>>>,
        archiver: Option<NodeArchiver<K, V>>,
    ) -> Self {
        Self { entries, archiver }
    }
}

impl<K, V> Translator<SkeletonBTreeMap<K, V>> for TreeTranslator<K, V> {
    fn to_record(&self, tree: &SkeletonBTreeMap<K, V>) -> Result<Record, Error> {
        let Some((entries, ghosts)) = tree.root_parts() else {
            return Err(Error::Unencodable("tree is not bare".into()));
        };
        let entries = self.entries.to_record(entries)?;
        let mut record = Record::map();
        record.insert("node_min", tree.node_min() as i64);
        record.insert("size", tree.size() as i64);
        record.insert("entries", entries);
        if !ghosts.is_empty() {
            record.insert("subnodes", ghosts_to_record(&ghosts));
        }
        Ok(record)
    }

    fn from_record(&self, record: &Record) -> Result<SkeletonBTreeMap<K, V>, Error> {
        let node_min = record.int_field("node_min")?;
        if node_min < 2 {
            return Err(Error::InvalidField {
                field: "node_min".into(),
                expected: "node_min of at least 2",
                found: node_min.to_string(),
            });
        }
        let size = record.int_field("size")?;
        let entries = self.entries.from_record(record.field("entries")?)?;
        let children = ghosts_from_record(record)?;
        check_shape(entries.len(), children.len())?;
        let stored = subtree_size(entries.len(), &children)?;
        if i64::try_from(stored).ok() != Some(size) {
            return Err(Error::InvalidData(
                "SkeletonBTreeMap".into(),
                format!("size {size} does not match {stored} stored entries"),
            ));
        }
        let root = SkeletonNode { entries, children };
        Ok(SkeletonBTreeMap::from_root(
            node_min as usize,
            root,
            self.archiver.clone(),
        ))
    }
}

/// Encodes a bare [SkeletonBTreeSet] the same way as its underlying map.
pub struct SetTranslator<E> {
    tree: TreeTranslator<E, ()>,
}

impl<E> SetTranslator<E> {
    pub fn new(
        entries: Arc<dyn Translator<Vec<(E, ())>>>,
        archiver: Option<NodeArchiver<E, ()>>,
    ) -> Self {
        Self {
            tree: TreeTranslator::new(entries, archiver),
        }
    }
}

impl<E> Translator<SkeletonBTreeSet<E>> for SetTranslator<E> {
    fn to_record(&self, set: &SkeletonBTreeSet<E>) -> Result<Record, Error> {
        self.tree.to_record(set.as_map())
    }

    fn from_record(&self, record: &Record) -> Result<SkeletonBTreeSet<E>, Error> {
        self.tree.from_record(record).map(SkeletonBTreeSet::from_map)
    }
}
