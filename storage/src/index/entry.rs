//! Postings stored in the term table.

use crate::address::Address;
use freelib_codec::{record::invalid, Error, Primitive, Record, Translator};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

/// Discriminant of a [TermEntry]. Entries with the same subject sort in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryType {
    Index,
    Term,
    Page,
    DeletePage,
}

impl EntryType {
    fn tag(self) -> &'static str {
        match self {
            EntryType::Index => "index",
            EntryType::Term => "term",
            EntryType::Page => "page",
            EntryType::DeletePage => "delete",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "index" => Some(EntryType::Index),
            "term" => Some(EntryType::Term),
            "page" => Some(EntryType::Page),
            "delete" => Some(EntryType::DeletePage),
            _ => None,
        }
    }
}

/// A posting of `subject` on a page.
#[derive(Clone, Debug)]
pub struct TermPageEntry {
    pub subject: String,

    /// In `[0, 1]`; zero means unknown.
    pub relevance: f32,

    pub page: Address,
    pub title: Option<String>,

    /// Word positions of the subject on the page.
    pub positions: Option<BTreeSet<u32>>,

    /// Text surrounding selected positions.
    pub fragments: Option<BTreeMap<u32, String>>,
}

impl TermPageEntry {
    pub fn new(subject: impl Into<String>, page: Address) -> Self {
        Self {
            subject: subject.into(),
            relevance: 0.0,
            page,
            title: None,
            positions: None,
            fragments: None,
        }
    }

    /// # Panics
    ///
    /// Panics if `relevance` is outside `[0, 1]`.
    pub fn with_relevance(mut self, relevance: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&relevance),
            "relevance must be in [0, 1]: {relevance}"
        );
        self.relevance = relevance;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_positions(mut self, positions: impl IntoIterator<Item = u32>) -> Self {
        self.positions = Some(positions.into_iter().collect());
        self
    }
}

/// An entry in a term's posting set.
///
/// Identity is the subject, the [EntryType], and the target (page, index, or related term).
/// Relevance and page details do not take part in ordering or equality.
#[derive(Clone, Debug)]
pub enum TermEntry {
    /// The subject is covered by another index.
    Index {
        subject: String,
        relevance: f32,
        index: Address,
    },
    /// The subject is related to another term.
    Term {
        subject: String,
        relevance: f32,
        term: String,
    },
    Page(TermPageEntry),
    /// Tombstone for a [TermEntry::Page] with the same subject and page.
    DeletePage(TermPageEntry),
}

impl TermEntry {
    pub fn entry_type(&self) -> EntryType {
        match self {
            TermEntry::Index { .. } => EntryType::Index,
            TermEntry::Term { .. } => EntryType::Term,
            TermEntry::Page(_) => EntryType::Page,
            TermEntry::DeletePage(_) => EntryType::DeletePage,
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            TermEntry::Index { subject, .. } | TermEntry::Term { subject, .. } => subject,
            TermEntry::Page(page) | TermEntry::DeletePage(page) => &page.subject,
        }
    }

    pub fn relevance(&self) -> f32 {
        match self {
            TermEntry::Index { relevance, .. } | TermEntry::Term { relevance, .. } => *relevance,
            TermEntry::Page(page) | TermEntry::DeletePage(page) => page.relevance,
        }
    }

    fn target(&self) -> &str {
        match self {
            TermEntry::Index { index, .. } => index.as_str(),
            TermEntry::Term { term, .. } => term,
            TermEntry::Page(page) | TermEntry::DeletePage(page) => page.page.as_str(),
        }
    }

    /// The page posting of a [TermEntry::Page] or [TermEntry::DeletePage].
    pub fn page_entry(&self) -> Option<&TermPageEntry> {
        match self {
            TermEntry::Page(page) | TermEntry::DeletePage(page) => Some(page),
            _ => None,
        }
    }

    /// Turns a page posting into its tombstone. Other entries are returned unchanged.
    pub fn into_delete(self) -> Self {
        match self {
            TermEntry::Page(page) => TermEntry::DeletePage(page),
            other => other,
        }
    }

    /// Turns a tombstone back into the posting it deletes. Other entries are returned unchanged.
    pub fn into_page(self) -> Self {
        match self {
            TermEntry::DeletePage(page) => TermEntry::Page(page),
            other => other,
        }
    }
}

impl From<TermPageEntry> for TermEntry {
    fn from(page: TermPageEntry) -> Self {
        TermEntry::Page(page)
    }
}

impl Ord for TermEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.subject()
            .cmp(other.subject())
            .then_with(|| self.entry_type().cmp(&other.entry_type()))
            .then_with(|| self.target().cmp(other.target()))
    }
}

impl PartialOrd for TermEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TermEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TermEntry {}

fn relevance(record: &Record) -> Result<f32, Error> {
    let relevance = match record.get("rel") {
        None | Some(Record::Null) => return Ok(0.0),
        Some(value) => value.as_float().ok_or_else(|| invalid("rel", "float", value))?,
    };
    if !(0.0..=1.0).contains(&relevance) {
        return Err(Error::InvalidField {
            field: "rel".into(),
            expected: "relevance in [0, 1]",
            found: relevance.to_string(),
        });
    }
    Ok(relevance as f32)
}

fn positions(record: &Record) -> Result<Option<BTreeSet<u32>>, Error> {
    let Some(list) = record.get("positions").filter(|r| !r.is_null()) else {
        return Ok(None);
    };
    let list = list
        .as_list()
        .ok_or_else(|| invalid("positions", "list", list))?;
    list.iter()
        .map(u32::from_record)
        .collect::<Result<BTreeSet<_>, _>>()
        .map(Some)
}

fn fragments(record: &Record) -> Result<Option<BTreeMap<u32, String>>, Error> {
    let Some(map) = record.get("fragments").filter(|r| !r.is_null()) else {
        return Ok(None);
    };
    let map = map
        .as_map()
        .ok_or_else(|| invalid("fragments", "map", map))?;
    map.iter()
        .map(|(position, fragment)| {
            let position = position.parse::<u32>().map_err(|_| Error::InvalidField {
                field: "fragments".into(),
                expected: "word position",
                found: position.clone(),
            })?;
            Ok((position, String::from_record(fragment)?))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()
        .map(Some)
}

/// Translates [TermEntry]s to `{type, subject, rel, ...}` records.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntryTranslator;

impl Translator<TermEntry> for EntryTranslator {
    fn to_record(&self, entry: &TermEntry) -> Result<Record, Error> {
        let mut record = Record::map();
        record.insert("type", entry.entry_type().tag());
        record.insert("subject", entry.subject());
        if entry.relevance() != 0.0 {
            record.insert("rel", entry.relevance() as f64);
        }
        match entry {
            TermEntry::Index { index, .. } => {
                record.insert("index", index.as_str());
            }
            TermEntry::Term { term, .. } => {
                record.insert("term", term.as_str());
            }
            TermEntry::Page(page) | TermEntry::DeletePage(page) => {
                record.insert("page", page.page.as_str());
                record.insert("title", page.title.clone());
                if let Some(positions) = &page.positions {
                    let positions = positions.iter().map(|p| Record::Int(*p as i64)).collect();
                    record.insert("positions", Record::List(positions));
                }
                if let Some(fragments) = &page.fragments {
                    let fragments: BTreeMap<String, Record> = fragments
                        .iter()
                        .map(|(p, f)| (p.to_string(), Record::from(f.as_str())))
                        .collect();
                    record.insert("fragments", fragments);
                }
            }
        }
        Ok(record)
    }

    fn from_record(&self, record: &Record) -> Result<TermEntry, Error> {
        let tag = record.str_field("type")?;
        let Some(kind) = EntryType::from_tag(tag) else {
            return Err(Error::InvalidField {
                field: "type".into(),
                expected: "entry type",
                found: tag.to_string(),
            });
        };
        let subject = record.str_field("subject")?.to_string();
        let relevance = relevance(record)?;
        let entry = match kind {
            EntryType::Index => TermEntry::Index {
                subject,
                relevance,
                index: Address::from_record(record.field("index")?)?,
            },
            EntryType::Term => TermEntry::Term {
                subject,
                relevance,
                term: record.str_field("term")?.to_string(),
            },
            EntryType::Page | EntryType::DeletePage => {
                let page = TermPageEntry {
                    subject,
                    relevance,
                    page: Address::from_record(record.field("page")?)?,
                    title: record.opt_str_field("title")?.map(str::to_string),
                    positions: positions(record)?,
                    fragments: fragments(record)?,
                };
                match kind {
                    EntryType::Page => TermEntry::Page(page),
                    _ => TermEntry::DeletePage(page),
                }
            }
        };
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn test_ordering() {
        let page = TermEntry::from(TermPageEntry::new("adam", address("CHK@1,2,A3")));
        let other_page = TermEntry::from(TermPageEntry::new("adam", address("CHK@2,2,A3")));
        let index = TermEntry::Index {
            subject: "adam".into(),
            relevance: 0.5,
            index: address("CHK@9,2,A3"),
        };
        let later = TermEntry::from(TermPageEntry::new("eve", address("CHK@0,2,A3")));

        assert!(index < page);
        assert!(page < other_page);
        assert!(other_page < later);
        assert!(page < page.clone().into_delete());
    }

    #[test]
    fn test_identity_ignores_details() {
        let plain = TermEntry::from(TermPageEntry::new("adam", address("CHK@1,2,A3")));
        let rich = TermEntry::from(
            TermPageEntry::new("adam", address("CHK@1,2,A3"))
                .with_relevance(0.9)
                .with_title("Eden")
                .with_positions([1, 5]),
        );
        assert_eq!(plain, rich);
        assert_ne!(plain, plain.clone().into_delete());
        assert_eq!(plain, plain.clone().into_delete().into_page());
    }

    #[test]
    #[should_panic(expected = "relevance must be in [0, 1]")]
    fn test_relevance_range() {
        TermPageEntry::new("adam", address("CHK@1,2,A3")).with_relevance(1.5);
    }

    #[test]
    fn test_translate() {
        let mut page = TermPageEntry::new("adam", address("USK@k,c,AQACAAE/site/3"))
            .with_relevance(0.25)
            .with_title("Garden")
            .with_positions([3, 1, 4]);
        page.fragments = Some(BTreeMap::from([(3, "the adam said".to_string())]));
        let entries = [
            TermEntry::Page(page.clone()),
            TermEntry::DeletePage(page),
            TermEntry::Index {
                subject: "adam".into(),
                relevance: 0.0,
                index: address("CHK@9,2,A3"),
            },
            TermEntry::Term {
                subject: "adam".into(),
                relevance: 1.0,
                term: "eve".into(),
            },
        ];
        for entry in entries {
            let record = EntryTranslator.to_record(&entry).unwrap();
            let decoded = EntryTranslator.from_record(&record).unwrap();
            assert_eq!(decoded.entry_type(), entry.entry_type());
            assert_eq!(decoded, entry);
            assert_eq!(decoded.relevance(), entry.relevance());
            assert_eq!(
                decoded.page_entry().map(|p| (&p.title, &p.positions, &p.fragments)),
                entry.page_entry().map(|p| (&p.title, &p.positions, &p.fragments))
            );
        }
    }

    #[test]
    fn test_reject_bad_records() {
        let mut record = Record::map();
        record.insert("type", "page");
        record.insert("subject", "adam");
        record.insert("page", "CHK@1,2,A3");
        record.insert("rel", 2.0);
        assert!(matches!(
            EntryTranslator.from_record(&record),
            Err(Error::InvalidField { ref field, .. }) if field == "rel"
        ));

        record.insert("rel", 0.5);
        record.insert("type", "bogus");
        assert!(matches!(
            EntryTranslator.from_record(&record),
            Err(Error::InvalidField { ref field, .. }) if field == "type"
        ));

        record.insert("type", "page");
        record.remove("page");
        assert!(matches!(
            EntryTranslator.from_record(&record),
            Err(Error::MissingField(_))
        ));
    }
}
