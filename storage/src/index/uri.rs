//! Keys and values of the URI table.

use crate::{address::Address, from_hex, hex, sha256};
use freelib_codec::{record::invalid, Error, KeyTranslator, Primitive, Record, Translator};
use std::{collections::BTreeSet, fmt};

/// Groups the addresses that share an updatable root: the SHA-256 of the root address (or of the
/// address itself when it has no root).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UriKey([u8; 32]);

impl UriKey {
    pub fn of(address: &Address) -> Self {
        let root = address.root();
        let canonical = root.as_ref().unwrap_or(address);
        Self(sha256(canonical.as_str().as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for UriKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex(&self.0))
    }
}

impl fmt::Debug for UriKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UriKey({self})")
    }
}

/// Uses the hex form of a [UriKey] as its map key.
#[derive(Clone, Copy, Debug, Default)]
pub struct UriKeyTranslator;

impl KeyTranslator<UriKey> for UriKeyTranslator {
    fn key_to_string(&self, key: &UriKey) -> String {
        key.to_string()
    }

    fn key_from_string(&self, raw: &str) -> Result<UriKey, Error> {
        from_hex(raw)
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .map(UriKey)
            .ok_or_else(|| Error::InvalidField {
                field: "utab key".into(),
                expected: "32-byte hex digest",
                found: raw.to_string(),
            })
    }
}

/// What the index knows about one page.
#[derive(Clone, Debug, PartialEq)]
pub struct UriEntry {
    pub subject: Address,

    /// In `[0, 1]`.
    pub quality: f32,

    /// Unix milliseconds of the last check, if ever checked.
    pub date_checked: Option<i64>,

    /// Terms posted for this page.
    pub terms: BTreeSet<String>,
}

impl UriEntry {
    pub fn new(subject: Address) -> Self {
        Self {
            subject,
            quality: 0.0,
            date_checked: None,
            terms: BTreeSet::new(),
        }
    }
}

/// Translates [UriEntry]s to `{subject, quality, dateChecked, terms}` records.
#[derive(Clone, Copy, Debug, Default)]
pub struct UriEntryTranslator;

impl Translator<UriEntry> for UriEntryTranslator {
    fn to_record(&self, entry: &UriEntry) -> Result<Record, Error> {
        let mut record = Record::map();
        record.insert("subject", entry.subject.as_str());
        record.insert("quality", entry.quality as f64);
        record.insert("dateChecked", entry.date_checked);
        record.insert(
            "terms",
            Record::List(entry.terms.iter().map(|t| Record::from(t.as_str())).collect()),
        );
        Ok(record)
    }

    fn from_record(&self, record: &Record) -> Result<UriEntry, Error> {
        let quality = record.float_field("quality")?;
        if !(0.0..=1.0).contains(&quality) {
            return Err(Error::InvalidField {
                field: "quality".into(),
                expected: "quality in [0, 1]",
                found: quality.to_string(),
            });
        }
        let date_checked = match record.get("dateChecked") {
            None | Some(Record::Null) => None,
            Some(value) => Some(
                value
                    .as_int()
                    .ok_or_else(|| invalid("dateChecked", "integer", value))?,
            ),
        };
        let terms = record
            .list_field("terms")?
            .iter()
            .map(String::from_record)
            .collect::<Result<_, _>>()?;
        Ok(UriEntry {
            subject: Address::from_record(record.field("subject")?)?,
            quality: quality as f32,
            date_checked,
            terms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_groups_editions() {
        let a = Address::parse("USK@k,c,AQACAAE/site/3").unwrap();
        let b = Address::parse("USK@k,c,AQACAAE/site/9/page.html").unwrap();
        let c = Address::parse("CHK@1,2,A3").unwrap();
        assert_eq!(UriKey::of(&a), UriKey::of(&b));
        assert_ne!(UriKey::of(&a), UriKey::of(&c));
    }

    #[test]
    fn test_key_string_round_trip() {
        let key = UriKey::of(&Address::parse("CHK@1,2,A3").unwrap());
        let raw = UriKeyTranslator.key_to_string(&key);
        assert_eq!(raw.len(), 64);
        assert_eq!(UriKeyTranslator.key_from_string(&raw).unwrap(), key);
        assert!(UriKeyTranslator.key_from_string("abcd").is_err());
        assert!(UriKeyTranslator.key_from_string(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_entry_round_trip() {
        let mut entry = UriEntry::new(Address::parse("CHK@1,2,A3").unwrap());
        entry.quality = 0.5;
        entry.date_checked = Some(1_700_000_000_000);
        entry.terms.extend(["adam".to_string(), "eve".to_string()]);
        let record = UriEntryTranslator.to_record(&entry).unwrap();
        assert_eq!(UriEntryTranslator.from_record(&record).unwrap(), entry);

        let mut unchecked = record.clone();
        unchecked.insert("dateChecked", Record::Null);
        assert_eq!(
            UriEntryTranslator.from_record(&unchecked).unwrap().date_checked,
            None
        );

        let mut bad = record;
        bad.insert("quality", 3.0);
        assert!(UriEntryTranslator.from_record(&bad).is_err());
    }
}
