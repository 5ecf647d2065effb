//! Wiring of every tree in a [ProtoIndex] to one leaf archiver, and the index record itself.

use super::{
    Config, EntryTranslator, ProtoIndex, TermEntry, UriEntry, UriEntryTranslator, UriKey,
    UriKeyTranslator, SERIAL_VERSION_UID,
};
use crate::{
    address::{Address, AddressKey},
    scheduler::{Metrics, ThreadPool},
    serial::{Archiver, IterableArchiver, LiveArchiver, PullTask, PushTask},
    skeleton::{
        MapEntries, NodeArchiver, SetEntries, SetTranslator, SkeletonBTreeMap, SkeletonBTreeSet,
        TreeTranslator,
    },
    Error,
};
use freelib_codec::{record::invalid, Primitive, Record, StringKey, Translator};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Node archivers and translators for every tree of an index in one serial format.
///
/// Cheap to clone; clones share the same leaf.
#[derive(Clone)]
pub struct ComponentSerialiser {
    config: Config,
    leaf: Arc<dyn LiveArchiver<Record>>,

    term_sets: NodeArchiver<TermEntry, ()>,
    uri_maps: NodeArchiver<Address, UriEntry>,
    ttab: NodeArchiver<String, SkeletonBTreeSet<TermEntry>>,
    utab: NodeArchiver<UriKey, SkeletonBTreeMap<Address, UriEntry>>,

    ttab_tree: Arc<TreeTranslator<String, SkeletonBTreeSet<TermEntry>>>,
    utab_tree: Arc<TreeTranslator<UriKey, SkeletonBTreeMap<Address, UriEntry>>>,
}

impl ComponentSerialiser {
    /// Builds the archivers of a format, failing on an unknown format.
    pub fn new(cfg: Config, leaf: Arc<dyn LiveArchiver<Record>>) -> Result<Self, Error> {
        // Hand-built configs must still name a known format.
        Config::for_format(cfg.format)?;

        let term_entries = Arc::new(SetEntries::new(Arc::new(EntryTranslator)));
        let term_sets: NodeArchiver<TermEntry, ()> =
            scheduled_node(&cfg, NodeArchiver::new(leaf.clone(), term_entries.clone()));
        let set_translator = Arc::new(SetTranslator::new(term_entries, Some(term_sets.clone())));
        let ttab_entries = Arc::new(MapEntries::new(Arc::new(StringKey), set_translator));
        let ttab = scheduled_node(&cfg, NodeArchiver::new(leaf.clone(), ttab_entries.clone()));
        let ttab_tree = Arc::new(TreeTranslator::new(ttab_entries, Some(ttab.clone())));

        let uri_entries = Arc::new(MapEntries::new(
            Arc::new(AddressKey),
            Arc::new(UriEntryTranslator),
        ));
        let uri_maps = scheduled_node(&cfg, NodeArchiver::new(leaf.clone(), uri_entries.clone()));
        let uri_tree = Arc::new(TreeTranslator::new(uri_entries, Some(uri_maps.clone())));
        let utab_entries = Arc::new(MapEntries::new(Arc::new(UriKeyTranslator), uri_tree));
        let utab = scheduled_node(&cfg, NodeArchiver::new(leaf.clone(), utab_entries.clone()));
        let utab_tree = Arc::new(TreeTranslator::new(utab_entries, Some(utab.clone())));

        Ok(Self {
            config: cfg,
            leaf,
            term_sets,
            uri_maps,
            ttab,
            utab,
            ttab_tree,
            utab_tree,
        })
    }

    /// Builds the archivers of a format with its default configuration.
    pub fn get(format: i64, leaf: Arc<dyn LiveArchiver<Record>>) -> Result<Self, Error> {
        Self::new(Config::for_format(format)?, leaf)
    }

    pub fn format(&self) -> i64 {
        self.config.format
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The archiver every node of every tree is stored in.
    pub fn leaf(&self) -> &Arc<dyn LiveArchiver<Record>> {
        &self.leaf
    }

    /// Attaches the table archivers to `index`.
    pub fn set_serialiser_for_index(&self, index: &mut ProtoIndex) {
        index.ttab.set_archiver(self.ttab.clone());
        index.utab.set_archiver(self.utab.clone());
        index.set_components(self.clone());
    }

    pub fn set_serialiser_for_set(&self, set: &mut SkeletonBTreeSet<TermEntry>) {
        set.set_archiver(self.term_sets.clone());
    }

    pub fn set_serialiser_for_uri_map(&self, map: &mut SkeletonBTreeMap<Address, UriEntry>) {
        map.set_archiver(self.uri_maps.clone());
    }

    /// An empty posting set stored alongside the rest of the index.
    pub fn new_term_set(&self) -> SkeletonBTreeSet<TermEntry> {
        let mut set = SkeletonBTreeSet::new(self.config.entry_node_min);
        self.set_serialiser_for_set(&mut set);
        set
    }

    /// An empty page map stored alongside the rest of the index.
    pub fn new_uri_map(&self) -> SkeletonBTreeMap<Address, UriEntry> {
        let mut map = SkeletonBTreeMap::new(self.config.entry_node_min);
        self.set_serialiser_for_uri_map(&mut map);
        map
    }
}

fn scheduled_node<K, V>(cfg: &Config, archiver: NodeArchiver<K, V>) -> NodeArchiver<K, V> {
    match &cfg.pool {
        Some(pool) => archiver.with_pool(pool.clone(), cfg.metrics.clone()),
        None => archiver,
    }
}

/// Converts a [ProtoIndex] to and from its top-level record.
///
/// Decoding picks the [ComponentSerialiser] from the record's serial format, building one on
/// first use of each format.
pub struct IndexTranslator {
    leaf: Arc<dyn LiveArchiver<Record>>,
    pool: Option<(ThreadPool, Metrics)>,
    components: Mutex<HashMap<i64, ComponentSerialiser>>,
}

impl IndexTranslator {
    pub fn new(leaf: Arc<dyn LiveArchiver<Record>>) -> Self {
        Self {
            leaf,
            pool: None,
            components: Mutex::new(HashMap::new()),
        }
    }

    fn components(&self, format: i64) -> Result<ComponentSerialiser, Error> {
        let mut components = self.components.lock().unwrap();
        if let Some(existing) = components.get(&format) {
            return Ok(existing.clone());
        }
        let mut cfg = Config::for_format(format)?;
        if let Some((pool, metrics)) = &self.pool {
            cfg = cfg.with_pool(pool.clone(), metrics.clone());
        }
        let created = ComponentSerialiser::new(cfg, self.leaf.clone())?;
        components.insert(format, created.clone());
        Ok(created)
    }

    /// Encodes `index`; both tables must be bare.
    pub fn to_record(&self, index: &ProtoIndex) -> Result<Record, Error> {
        if !index.is_bare() {
            return Err(Error::NotBare);
        }
        let components = index.components();
        let mut record = Record::map();
        record.insert("serialVersionUID", SERIAL_VERSION_UID);
        record.insert("serialFormatUID", components.format());
        record.insert("insID", index.ins_id.as_ref().map(Address::as_str));
        record.insert("name", index.name.as_str());
        record.insert("owner", index.owner.as_str());
        record.insert("ownerEmail", index.owner_email.as_str());
        record.insert("totalPages", index.total_pages);
        record.insert("modified", index.modified);
        record.insert("extra", index.extra.clone());
        record.insert("utab", components.utab_tree.to_record(&index.utab)?);
        record.insert("ttab", components.ttab_tree.to_record(&index.ttab)?);
        Ok(record)
    }

    /// Decodes an index record, attaching archivers for its serial format.
    pub fn from_record(&self, record: &Record) -> Result<ProtoIndex, Error> {
        let version = record.int_field("serialVersionUID")?;
        if version != SERIAL_VERSION_UID {
            return Err(freelib_codec::Error::InvalidField {
                field: "serialVersionUID".into(),
                expected: "a recognised serial version",
                found: format!("{version:#x}"),
            }
            .into());
        }
        let format = record.int_field("serialFormatUID")?;
        let components = match self.components(format) {
            Err(Error::UnsupportedFormat(_)) => {
                return Err(freelib_codec::Error::InvalidField {
                    field: "serialFormatUID".into(),
                    expected: "a recognised serial format",
                    found: format!("{format:#x}"),
                }
                .into())
            }
            result => result?,
        };

        let ttab = components.ttab_tree.from_record(record.field("ttab")?)?;
        let utab = components.utab_tree.from_record(record.field("utab")?)?;
        let mut index = ProtoIndex::from_parts(components, ttab, utab);
        index.req_id = optional_address(record, "reqID")?;
        index.ins_id = optional_address(record, "insID")?;
        index.name = record.opt_str_field("name")?.unwrap_or_default().to_string();
        index.owner = record.opt_str_field("owner")?.unwrap_or_default().to_string();
        index.owner_email = record
            .opt_str_field("ownerEmail")?
            .unwrap_or_default()
            .to_string();
        index.total_pages = optional_int(record, "totalPages")?;
        index.modified = optional_int(record, "modified")?;
        index.extra = match record.get("extra") {
            None | Some(Record::Null) => BTreeMap::new(),
            Some(_) => record.map_field("extra")?.clone(),
        };
        Ok(index)
    }
}

fn optional_address(record: &Record, field: &str) -> Result<Option<Address>, Error> {
    match record.get(field) {
        None | Some(Record::Null) => Ok(None),
        Some(value) => Ok(Some(Address::from_record(value)?)),
    }
}

fn optional_int(record: &Record, field: &str) -> Result<i64, Error> {
    match record.get(field) {
        None | Some(Record::Null) => Ok(0),
        Some(value) => Ok(value
            .as_int()
            .ok_or_else(|| invalid(field, "integer", value))?),
    }
}

/// Pushes and pulls whole indexes through a leaf archiver.
///
/// A pushed index is stored under its `ins_id` when set, otherwise under its content hash. The
/// address it lands at becomes its `req_id`.
pub struct ProtoIndexSerialiser {
    leaf: Arc<dyn LiveArchiver<Record>>,
    translator: IndexTranslator,
}

impl ProtoIndexSerialiser {
    pub fn new(leaf: Arc<dyn LiveArchiver<Record>>) -> Self {
        Self {
            translator: IndexTranslator::new(leaf.clone()),
            leaf,
        }
    }

    /// Schedules node I/O of pulled indexes on `pool`.
    pub fn with_pool(mut self, pool: ThreadPool, metrics: Metrics) -> Self {
        self.translator.pool = Some((pool, metrics));
        self
    }

    /// Decodes indexes of `components.format()` with `components` instead of the defaults.
    pub fn with_components(self, components: ComponentSerialiser) -> Self {
        self.translator
            .components
            .lock()
            .unwrap()
            .insert(components.format(), components);
        self
    }

    pub fn translator(&self) -> &IndexTranslator {
        &self.translator
    }
}

impl Archiver<ProtoIndex> for ProtoIndexSerialiser {
    fn pull(&self, task: &mut PullTask<ProtoIndex>) -> Result<(), Error> {
        let mut raw = PullTask::new(task.meta.clone());
        self.leaf.pull(&mut raw)?;
        let Some(mut record) = raw.data else {
            return Err(Error::abort(
                format!("no index at {}", task.meta),
                false,
            ));
        };
        if record.as_map().is_none() {
            return Err(invalid("index", "map", &record).into());
        }
        record.insert("reqID", task.meta.as_str());
        let index = self.translator.from_record(&record)?;
        debug!(address = %task.meta, format = index.components().format(), "pulled index");
        task.data = Some(index);
        Ok(())
    }

    fn push(&self, task: &mut PushTask<ProtoIndex>) -> Result<(), Error> {
        let mut record = self.translator.to_record(&task.data)?;
        let hint = optional_address(&record, "insID")?;
        record.remove("insID");
        if let (Some(hint), Some(meta)) = (&hint, &task.meta) {
            if hint != meta {
                warn!(%hint, %meta, "push hint differs from insID; using insID");
            }
        }

        let mut raw = PushTask {
            data: record,
            meta: hint.or_else(|| task.meta.clone()),
        };
        self.leaf.push(&mut raw)?;
        let Some(address) = raw.meta else {
            return Err(Error::abort("leaf archiver returned no address", false));
        };
        debug!(%address, "pushed index");
        task.data.req_id = Some(address.clone());
        task.meta = Some(address);
        Ok(())
    }
}

impl IterableArchiver<ProtoIndex> for ProtoIndexSerialiser {}
