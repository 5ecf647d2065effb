//! The top-level search index: a term table and a URI table stored as skeleton trees.
//!
//! # Overview
//!
//! A [ProtoIndex] maps each term to a [SkeletonBTreeSet] of [TermEntry] postings (the _ttab_),
//! and each [UriKey] to a [SkeletonBTreeMap] of [UriEntry] page records (the _utab_). Both tables
//! and every nested tree share one leaf [crate::serial::LiveArchiver], wired in by a
//! [ComponentSerialiser] chosen by serial format id.
//!
//! [ProtoIndexSerialiser] pushes and pulls the index itself. Pushing requires both tables to be
//! bare; call [ProtoIndex::deflate] first.

use crate::{
    address::Address,
    scheduler::{Metrics, ThreadPool},
    serial::LiveArchiver,
    skeleton::{SkeletonBTreeMap, SkeletonBTreeSet},
    Error,
};
use freelib_codec::Record;
use std::{
    collections::{BTreeMap, BTreeSet},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;

mod entry;
pub mod scan;
mod serialiser;
mod uri;

pub use entry::{EntryTranslator, EntryType, TermEntry, TermPageEntry};
pub use serialiser::{ComponentSerialiser, IndexTranslator, ProtoIndexSerialiser};
pub use uri::{UriEntry, UriEntryTranslator, UriKey, UriKeyTranslator};

/// Version tag of the index record layout.
pub const SERIAL_VERSION_UID: i64 = 0xf82a9084681e5ba6_u64 as i64;

/// Serial format for indexes stored on the network.
pub const FMT_FREENET_SIMPLE: i64 = 0x2db3c940;

/// Serial format for indexes stored in local files.
pub const FMT_FILE_LOCAL: i64 = 0xc036147a_u32 as i32 as i64;

/// Term table: term to posting set.
pub type TermTable = SkeletonBTreeMap<String, SkeletonBTreeSet<TermEntry>>;

/// URI table: root digest to the pages under that root.
pub type UriTable = SkeletonBTreeMap<UriKey, SkeletonBTreeMap<Address, UriEntry>>;

/// Configuration for a [ComponentSerialiser].
#[derive(Clone)]
pub struct Config {
    /// Serial format id recorded in pushed indexes.
    pub format: i64,

    /// Minimum degree of new term and URI tables.
    pub table_node_min: usize,

    /// Minimum degree of new posting sets and page maps.
    pub entry_node_min: usize,

    /// Pool for scheduled node I/O, if any.
    pub pool: Option<ThreadPool>,

    /// Metrics for scheduled node I/O.
    pub metrics: Metrics,
}

impl Config {
    /// Default configuration for a known serial format.
    pub fn for_format(format: i64) -> Result<Self, Error> {
        let entry_node_min = match format {
            FMT_FREENET_SIMPLE => 512,
            FMT_FILE_LOCAL => 100,
            _ => return Err(Error::UnsupportedFormat(format)),
        };
        Ok(Self {
            format,
            table_node_min: 1024,
            entry_node_min,
            pool: None,
            metrics: Metrics::default(),
        })
    }

    /// Schedules node I/O of every tree on `pool`.
    pub fn with_pool(mut self, pool: ThreadPool, metrics: Metrics) -> Self {
        self.pool = Some(pool);
        self.metrics = metrics;
        self
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// A search index under construction or loaded from storage.
pub struct ProtoIndex {
    /// Address this index was pulled from, or last pushed to.
    pub req_id: Option<Address>,

    /// Address to insert this index under, if not content-addressed.
    pub ins_id: Option<Address>,

    pub name: String,
    pub owner: String,
    pub owner_email: String,
    pub total_pages: i64,

    /// Unix milliseconds of the last modification.
    pub modified: i64,

    /// Free-form properties carried through serialization.
    pub extra: BTreeMap<String, Record>,

    pub ttab: TermTable,
    pub utab: UriTable,

    components: ComponentSerialiser,
}

impl ProtoIndex {
    /// Creates an empty index whose trees use `components`.
    pub fn new(
        components: &ComponentSerialiser,
        name: impl Into<String>,
        owner: impl Into<String>,
        owner_email: impl Into<String>,
        total_pages: i64,
    ) -> Self {
        let node_min = components.config().table_node_min;
        let mut index = Self {
            req_id: None,
            ins_id: None,
            name: name.into(),
            owner: owner.into(),
            owner_email: owner_email.into(),
            total_pages,
            modified: now_millis(),
            extra: BTreeMap::new(),
            ttab: SkeletonBTreeMap::new(node_min),
            utab: SkeletonBTreeMap::new(node_min),
            components: components.clone(),
        };
        components.set_serialiser_for_index(&mut index);
        index
    }

    pub(crate) fn from_parts(
        components: ComponentSerialiser,
        ttab: TermTable,
        utab: UriTable,
    ) -> Self {
        Self {
            req_id: None,
            ins_id: None,
            name: String::new(),
            owner: String::new(),
            owner_email: String::new(),
            total_pages: 0,
            modified: 0,
            extra: BTreeMap::new(),
            ttab,
            utab,
            components,
        }
    }

    /// The serialiser wiring this index's trees.
    pub fn components(&self) -> &ComponentSerialiser {
        &self.components
    }

    pub(crate) fn set_components(&mut self, components: ComponentSerialiser) {
        self.components = components;
    }

    /// Whether both tables are bare, as required to push the index.
    pub fn is_bare(&self) -> bool {
        self.ttab.is_bare() && self.utab.is_bare()
    }

    /// Persists every modified node, nested trees first, and waits for background inserts.
    pub fn deflate(&mut self) -> Result<(), Error> {
        self.ttab.for_each_resident_mut(|_, set| {
            let changed = !set.is_bare();
            set.deflate()?;
            Ok(changed)
        })?;
        self.ttab.deflate()?;
        self.utab.for_each_resident_mut(|_, pages| {
            let changed = !pages.is_bare();
            pages.deflate()?;
            Ok(changed)
        })?;
        self.utab.deflate()?;
        self.components.leaf().wait_for_async_inserts()?;
        debug!(
            terms = self.ttab.size(),
            roots = self.utab.size(),
            "deflated index"
        );
        Ok(())
    }

    /// Adds postings, creating posting sets for new terms.
    ///
    /// Page postings are also recorded in the URI table. A posting equal to one already present
    /// replaces it.
    pub fn insert_postings(
        &mut self,
        postings: impl IntoIterator<Item = TermEntry>,
    ) -> Result<(), Error> {
        let mut by_term: BTreeMap<String, BTreeSet<TermEntry>> = BTreeMap::new();
        for posting in postings {
            by_term
                .entry(posting.subject().to_string())
                .or_default()
                .replace(posting);
        }
        let mut by_root: BTreeMap<UriKey, BTreeMap<Address, BTreeSet<String>>> = BTreeMap::new();
        for posting in by_term.values().flatten() {
            if let TermEntry::Page(page) = posting {
                by_root
                    .entry(UriKey::of(&page.page))
                    .or_default()
                    .entry(page.page.clone())
                    .or_default()
                    .insert(page.subject.clone());
            }
        }

        let count = by_term.values().map(BTreeSet::len).sum::<usize>();
        let components = self.components.clone();
        let terms = by_term.keys().cloned().collect();
        self.ttab
            .update_with(terms, BTreeSet::new(), |mut binding| {
                let postings = by_term.remove(binding.key()).unwrap_or_default();
                let set = binding.get_or_insert_with(|| components.new_term_set());
                set.update(postings, BTreeSet::new())?;
                set.deflate()
            })?;

        let roots = by_root.keys().copied().collect();
        self.utab
            .update_with(roots, BTreeSet::new(), |mut binding| {
                let mut pages = by_root.remove(binding.key()).unwrap_or_default();
                let map = binding.get_or_insert_with(|| components.new_uri_map());
                map.update_with(
                    pages.keys().cloned().collect(),
                    BTreeSet::new(),
                    |mut binding| {
                        let subject = binding.key().clone();
                        let terms = pages.remove(&subject).unwrap_or_default();
                        binding
                            .get_or_insert_with(|| UriEntry::new(subject))
                            .terms
                            .extend(terms);
                        Ok::<_, Error>(())
                    },
                )?;
                map.deflate()
            })?;

        self.modified = now_millis();
        debug!(postings = count, "inserted postings");
        Ok(())
    }

    /// Removes postings. [TermEntry::DeletePage] tombstones remove the page posting they name.
    ///
    /// Terms that are not in the index are skipped. A posting set emptied by removal stays in
    /// the term table.
    pub fn remove_postings(
        &mut self,
        postings: impl IntoIterator<Item = TermEntry>,
    ) -> Result<(), Error> {
        let mut by_term: BTreeMap<String, BTreeSet<TermEntry>> = BTreeMap::new();
        for posting in postings {
            let posting = posting.into_page();
            by_term
                .entry(posting.subject().to_string())
                .or_default()
                .insert(posting);
        }
        let mut by_root: BTreeMap<UriKey, BTreeMap<Address, BTreeSet<String>>> = BTreeMap::new();
        for posting in by_term.values().flatten() {
            if let TermEntry::Page(page) = posting {
                by_root
                    .entry(UriKey::of(&page.page))
                    .or_default()
                    .entry(page.page.clone())
                    .or_default()
                    .insert(page.subject.clone());
            }
        }

        let terms = by_term.keys().cloned().collect();
        self.ttab
            .update_with(terms, BTreeSet::new(), |mut binding| {
                let postings = by_term.remove(binding.key()).unwrap_or_default();
                match binding.value_mut() {
                    Some(set) => {
                        set.update(BTreeSet::new(), postings)?;
                        set.deflate()
                    }
                    None => Ok(()),
                }
            })?;

        let roots = by_root.keys().copied().collect();
        self.utab
            .update_with(roots, BTreeSet::new(), |mut binding| {
                let mut pages = by_root.remove(binding.key()).unwrap_or_default();
                let Some(map) = binding.value_mut() else {
                    return Ok(());
                };
                map.update_with(
                    pages.keys().cloned().collect(),
                    BTreeSet::new(),
                    |mut binding| {
                        let terms = pages.remove(binding.key()).unwrap_or_default();
                        if let Some(entry) = binding.value_mut() {
                            entry.terms.retain(|term| !terms.contains(term));
                        }
                        Ok::<_, Error>(())
                    },
                )?;
                map.deflate()
            })?;

        self.modified = now_millis();
        Ok(())
    }

    /// Records or replaces what the index knows about one page.
    pub fn put_uri(&mut self, entry: UriEntry) -> Result<(), Error> {
        let components = self.components.clone();
        let key = UriKey::of(&entry.subject);
        let mut entry = Some(entry);
        self.utab
            .update_with(BTreeSet::from([key]), BTreeSet::new(), |mut binding| {
                let map = binding.get_or_insert_with(|| components.new_uri_map());
                if let Some(entry) = entry.take() {
                    map.put(entry.subject.clone(), entry)?;
                }
                map.deflate()
            })?;
        self.modified = now_millis();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scheduler::create_pool,
        serial::{Archiver, MemoryArchiver, MemoryConfig, PullTask, PushTask},
    };
    use freelib_codec::BinaryStream;
    use std::sync::Arc;

    fn leaf() -> Arc<MemoryArchiver<BinaryStream>> {
        Arc::new(MemoryArchiver::new(MemoryConfig {
            stream: BinaryStream::default(),
            registry: None,
        }))
    }

    fn small(format: i64) -> Config {
        let mut cfg = Config::for_format(format).unwrap();
        cfg.table_node_min = 4;
        cfg.entry_node_min = 3;
        cfg
    }

    fn components(leaf: Arc<MemoryArchiver<BinaryStream>>) -> ComponentSerialiser {
        ComponentSerialiser::new(small(FMT_FILE_LOCAL), leaf).unwrap()
    }

    fn page(subject: &str, page: &str) -> TermEntry {
        TermPageEntry::new(subject, Address::parse(page).unwrap())
            .with_relevance(1.0)
            .with_title("title")
            .into()
    }

    #[test]
    fn test_config_for_format() {
        assert_eq!(Config::for_format(FMT_FREENET_SIMPLE).unwrap().table_node_min, 1024);
        assert_eq!(Config::for_format(FMT_FILE_LOCAL).unwrap().entry_node_min, 100);
        assert!(matches!(
            Config::for_format(7),
            Err(Error::UnsupportedFormat(7))
        ));
        assert!(FMT_FILE_LOCAL < 0);
    }

    #[test]
    fn test_push_contents() {
        let leaf = leaf();
        let components = components(leaf.clone());
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);

        // Step 1: one single-posting set per term
        for i in 0..10000 {
            let mut set = components.new_term_set();
            set.add(page("a", "CHK@1,2,A3")).unwrap();
            set.deflate().unwrap();
            index.ttab.put(format!("a{i}"), set).unwrap();
        }
        index.deflate().unwrap();
        assert!(index.is_bare());

        // Step 2: push the index and check the stored record
        let serialiser = ProtoIndexSerialiser::new(leaf.clone());
        let mut task = PushTask::new(index);
        serialiser.push(&mut task).unwrap();
        let address = task.meta.clone().unwrap();
        assert_eq!(task.data.req_id.as_ref(), Some(&address));

        let mut raw = PullTask::new(address.clone());
        leaf.pull(&mut raw).unwrap();
        let record = raw.data.unwrap();
        assert_eq!(record.int_field("serialVersionUID").unwrap(), SERIAL_VERSION_UID);
        let ttab = record.field("ttab").unwrap();
        assert_eq!(ttab.int_field("node_min").unwrap(), 4);
        assert_eq!(ttab.int_field("size").unwrap(), 10000);
        let utab = record.field("utab").unwrap();
        assert_eq!(utab.int_field("size").unwrap(), 0);
        assert!(record.get("insID").is_none());

        // Step 3: keys are reachable one path at a time
        let mut index = task.data;
        for i in (0..10000).step_by(267) {
            let key = format!("a{i}");
            index.ttab.inflate_key(&key).unwrap();
            assert!(index.ttab.contains_key(&key));
            index.deflate().unwrap();
        }
    }

    #[test]
    fn test_push_one_large_set() {
        let leaf = leaf();
        let components = components(leaf.clone());
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);

        let mut set = components.new_term_set();
        for i in 0..3000 {
            set.add(page("adam", &format!("CHK@{i},2,A3"))).unwrap();
        }
        set.deflate().unwrap();
        index.ttab.put("adam".into(), set).unwrap();
        index.deflate().unwrap();

        index.ttab.inflate().unwrap();
        assert!(index.ttab.contains_key("adam"));
        assert!(!index.ttab.contains_key("eve"));
        let set = index.ttab.get_mut("adam").unwrap();
        set.inflate().unwrap();
        for i in (0..3000).step_by(329) {
            assert!(set.contains(&page("adam", &format!("CHK@{i},2,A3"))));
        }
        assert_eq!(set.size(), 3000);
        index.deflate().unwrap();
    }

    #[test]
    fn test_value_handler() {
        let leaf = leaf();
        let components = components(leaf.clone());
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);

        // Step 1: grow one posting set through repeated handler updates
        let mut next = 0;
        for _ in 0..10 {
            index
                .ttab
                .update_with(
                    BTreeSet::from(["adam".to_string()]),
                    BTreeSet::new(),
                    |mut binding| {
                        if binding.is_fresh() {
                            let mut set = components.new_term_set();
                            set.add(page("adam", &format!("CHK@{next},2,A3")))?;
                            next += 1;
                            set.deflate()?;
                            binding.set(set);
                            return Ok::<_, Error>(());
                        }
                        let set = binding.value_mut().unwrap();
                        for _ in 0..800 {
                            set.add(page("adam", &format!("CHK@{next},2,A3")))?;
                            next += 1;
                        }
                        set.deflate()
                    },
                )
                .unwrap();
        }
        index.deflate().unwrap();

        // Step 2: the key is present and the set holds every posting
        index.ttab.inflate().unwrap();
        assert!(index.ttab.contains_key("adam"));
        assert!(!index.ttab.contains_key("eve"));
        let set = index.ttab.get_mut("adam").unwrap();
        assert_eq!(set.size(), 1 + 9 * 800);
        set.inflate_key(&page("adam", "CHK@2500,2,A3")).unwrap();
        assert!(set.contains(&page("adam", "CHK@2500,2,A3")));
        index.deflate().unwrap();
    }

    #[test]
    fn test_remove_key() {
        let leaf = leaf();
        let components = components(leaf);
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);
        for i in 0..500 {
            let mut set = components.new_term_set();
            set.add(page("a", "CHK@1,2,A3")).unwrap();
            index.ttab.put(format!("a{i}"), set).unwrap();
        }
        index.deflate().unwrap();

        let removes = BTreeSet::from(["a1".to_string(), "a250".to_string()]);
        index.ttab.update(BTreeMap::new(), removes).unwrap();
        index.deflate().unwrap();
        index.ttab.inflate().unwrap();
        assert!(!index.ttab.contains_key("a1"));
        assert!(!index.ttab.contains_key("a250"));
        assert!(index.ttab.contains_key("a0"));
        assert!(index.ttab.contains_key("a251"));
        assert_eq!(index.ttab.size(), 498);
    }

    #[test]
    fn test_insert_and_remove_postings() {
        let leaf = leaf();
        let components = components(leaf);
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);

        // Step 1: postings are grouped by term and indexed by page
        let postings: Vec<TermEntry> = (0..40)
            .flat_map(|i| {
                let uri = format!("CHK@{i},2,A3");
                [page("adam", &uri), page("eve", &uri)]
            })
            .collect();
        index.insert_postings(postings).unwrap();
        index.insert_postings([page("eve", "CHK@99,2,A3")]).unwrap();
        index.deflate().unwrap();

        index.ttab.inflate().unwrap();
        assert_eq!(index.ttab.size(), 2);
        assert_eq!(index.ttab.get_mut("adam").unwrap().size(), 40);
        assert_eq!(index.ttab.get_mut("eve").unwrap().size(), 41);

        let subject = Address::parse("CHK@5,2,A3").unwrap();
        let key = UriKey::of(&subject);
        index.utab.inflate_key(&key).unwrap();
        let pages = index.utab.get_mut(&key).unwrap();
        pages.inflate().unwrap();
        let terms: Vec<&str> = pages.get(&subject).unwrap().terms.iter().map(String::as_str).collect();
        assert_eq!(terms, ["adam", "eve"]);
        index.deflate().unwrap();

        // Step 2: tombstones remove the page postings; unknown terms are skipped
        let removals = (0..40)
            .map(|i| page("adam", &format!("CHK@{i},2,A3")).into_delete())
            .chain([page("eve", "CHK@99,2,A3"), page("zed", "CHK@1,2,A3")]);
        index.remove_postings(removals).unwrap();
        index.deflate().unwrap();

        index.ttab.inflate().unwrap();
        assert!(!index.ttab.contains_key("zed"));
        let adam = index.ttab.get_mut("adam").unwrap();
        assert!(adam.is_empty());
        let eve = index.ttab.get_mut("eve").unwrap();
        eve.inflate().unwrap();
        assert_eq!(eve.size(), 40);
        assert!(!eve.contains(&page("eve", "CHK@99,2,A3")));
        index.deflate().unwrap();

        index.utab.inflate_key(&key).unwrap();
        let pages = index.utab.get_mut(&key).unwrap();
        pages.inflate().unwrap();
        let terms: Vec<&str> = pages.get(&subject).unwrap().terms.iter().map(String::as_str).collect();
        assert_eq!(terms, ["eve"]);
    }

    #[test]
    fn test_last_member_removal_keeps_set() {
        let leaf = leaf();
        let components = components(leaf);
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);
        index.insert_postings([page("adam", "CHK@1,2,A3")]).unwrap();
        index.deflate().unwrap();

        index
            .remove_postings([page("adam", "CHK@1,2,A3").into_delete()])
            .unwrap();
        index.deflate().unwrap();
        index.ttab.inflate().unwrap();
        assert!(index.ttab.contains_key("adam"));
        assert!(index.ttab.get_mut("adam").unwrap().is_empty());
    }

    #[test]
    fn test_put_uri() {
        let leaf = leaf();
        let components = components(leaf);
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);
        let subject = Address::parse("USK@k,c,AQACAAE/site/4").unwrap();
        let mut entry = UriEntry::new(subject.clone());
        entry.quality = 0.75;
        index.put_uri(entry.clone()).unwrap();
        index.deflate().unwrap();

        let key = UriKey::of(&subject);
        index.utab.inflate_key(&key).unwrap();
        let pages = index.utab.get_mut(&key).unwrap();
        pages.inflate().unwrap();
        assert_eq!(pages.get(&subject), Some(&entry));
    }

    #[test]
    fn test_scheduled_index() {
        let leaf = leaf();
        let metrics = Metrics::default();
        let cfg = small(FMT_FREENET_SIMPLE).with_pool(create_pool(4).unwrap(), metrics.clone());
        let components = ComponentSerialiser::new(cfg, leaf.clone()).unwrap();
        let mut index = ProtoIndex::new(&components, "name", "owner", "email", 0);

        let postings: Vec<TermEntry> = (0..300)
            .map(|i| page(&format!("t{}", i % 30), &format!("CHK@{i},2,A3")))
            .collect();
        index.insert_postings(postings).unwrap();
        index.deflate().unwrap();
        assert!(metrics.completed.get() > 0);
        assert_eq!(metrics.failed.get(), 0);

        let serialiser = ProtoIndexSerialiser::new(leaf.clone()).with_pool(
            components.config().pool.clone().unwrap(),
            metrics.clone(),
        );
        let mut task = PushTask::new(index);
        serialiser.push(&mut task).unwrap();
        let mut pull = PullTask::new(task.meta.unwrap());
        serialiser.pull(&mut pull).unwrap();
        let mut index = pull.data.unwrap();
        assert_eq!(index.components().format(), FMT_FREENET_SIMPLE);
        index.ttab.inflate().unwrap();
        assert_eq!(index.ttab.size(), 30);
        let set = index.ttab.get_mut("t7").unwrap();
        set.inflate().unwrap();
        assert_eq!(set.size(), 10);
        let _ = leaf.wait_for_async_inserts();
    }
}
