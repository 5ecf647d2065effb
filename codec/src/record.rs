//! A generic, self-describing serializable record.
//!
//! Every persisted object (tree nodes, whole trees, index roots) is translated into a [Record]
//! before it is framed into bytes. Maps are keyed by strings and kept sorted, so two equal records
//! always produce identical bytes (and therefore identical content addresses).

use crate::{
    codec::at_least,
    varint, EncodeSize, Error, Read, Write,
};
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeMap;

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_MAP: u8 = 8;

/// A nested map/list/scalar value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Record {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Record>),
    Map(BTreeMap<String, Record>),
}

/// Limits applied when decoding untrusted records.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum length of any string, byte string, list, or map.
    pub max_len: usize,

    /// Maximum nesting depth of lists and maps.
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_len: 1 << 24,
            max_depth: 64,
        }
    }
}

impl Record {
    /// Creates an empty map record.
    pub fn map() -> Self {
        Record::Map(BTreeMap::new())
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Null => "null",
            Record::Bool(_) => "bool",
            Record::Int(_) => "int",
            Record::Float(_) => "float",
            Record::Str(_) => "string",
            Record::Bytes(_) => "bytes",
            Record::List(_) => "list",
            Record::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Record::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Record::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Record::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers are accepted where floats are expected.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Record::Float(f) => Some(*f),
            Record::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Record::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Record::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Record]> {
        match self {
            Record::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Record>> {
        match self {
            Record::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Looks up `field` in a map record.
    pub fn get(&self, field: &str) -> Option<&Record> {
        self.as_map().and_then(|m| m.get(field))
    }

    /// Inserts `field` into a map record, returning the previous value.
    ///
    /// Panics if the record is not a map.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Record>) -> Option<Record> {
        match self {
            Record::Map(m) => m.insert(field.into(), value.into()),
            other => panic!("insert into {} record", other.kind()),
        }
    }

    /// Removes `field` from a map record.
    pub fn remove(&mut self, field: &str) -> Option<Record> {
        match self {
            Record::Map(m) => m.remove(field),
            _ => None,
        }
    }

    /// Returns `field` of a map record, failing if it is absent.
    pub fn field(&self, field: &str) -> Result<&Record, Error> {
        match self {
            Record::Map(m) => m
                .get(field)
                .ok_or_else(|| Error::MissingField(field.to_string())),
            other => Err(invalid(field, "map", other)),
        }
    }

    pub fn int_field(&self, field: &str) -> Result<i64, Error> {
        let value = self.field(field)?;
        value.as_int().ok_or_else(|| invalid(field, "int", value))
    }

    pub fn float_field(&self, field: &str) -> Result<f64, Error> {
        let value = self.field(field)?;
        value.as_float().ok_or_else(|| invalid(field, "float", value))
    }

    pub fn str_field(&self, field: &str) -> Result<&str, Error> {
        let value = self.field(field)?;
        value.as_str().ok_or_else(|| invalid(field, "string", value))
    }

    pub fn list_field(&self, field: &str) -> Result<&[Record], Error> {
        let value = self.field(field)?;
        value.as_list().ok_or_else(|| invalid(field, "list", value))
    }

    pub fn map_field(&self, field: &str) -> Result<&BTreeMap<String, Record>, Error> {
        let value = self.field(field)?;
        value.as_map().ok_or_else(|| invalid(field, "map", value))
    }

    /// Returns a string field, treating an absent or null field as `None`.
    pub fn opt_str_field(&self, field: &str) -> Result<Option<&str>, Error> {
        match self.get(field) {
            None | Some(Record::Null) => Ok(None),
            Some(Record::Str(s)) => Ok(Some(s)),
            Some(other) => Err(invalid(field, "string", other)),
        }
    }
}

/// Builds an [Error::InvalidField] for a value of the wrong kind.
pub fn invalid(field: &str, expected: &'static str, found: &Record) -> Error {
    Error::InvalidField {
        field: field.to_string(),
        expected,
        found: found.kind().to_string(),
    }
}

impl From<bool> for Record {
    fn from(value: bool) -> Self {
        Record::Bool(value)
    }
}

impl From<i64> for Record {
    fn from(value: i64) -> Self {
        Record::Int(value)
    }
}

impl From<i32> for Record {
    fn from(value: i32) -> Self {
        Record::Int(value as i64)
    }
}

impl From<u32> for Record {
    fn from(value: u32) -> Self {
        Record::Int(value as i64)
    }
}

impl From<f64> for Record {
    fn from(value: f64) -> Self {
        Record::Float(value)
    }
}

impl From<&str> for Record {
    fn from(value: &str) -> Self {
        Record::Str(value.to_string())
    }
}

impl From<String> for Record {
    fn from(value: String) -> Self {
        Record::Str(value)
    }
}

impl From<Bytes> for Record {
    fn from(value: Bytes) -> Self {
        Record::Bytes(value)
    }
}

impl From<Vec<Record>> for Record {
    fn from(value: Vec<Record>) -> Self {
        Record::List(value)
    }
}

impl From<BTreeMap<String, Record>> for Record {
    fn from(value: BTreeMap<String, Record>) -> Self {
        Record::Map(value)
    }
}

impl<T: Into<Record>> From<Option<T>> for Record {
    fn from(value: Option<T>) -> Self {
        value.map_or(Record::Null, Into::into)
    }
}

fn write_str(value: &str, buf: &mut impl BufMut) {
    varint::write(value.len() as u64, buf);
    buf.put_slice(value.as_bytes());
}

fn str_size(value: &str) -> usize {
    varint::size(value.len() as u64) + value.len()
}

fn read_str(buf: &mut impl Buf, limits: &Limits) -> Result<String, Error> {
    let len = varint::read_len(buf, limits.max_len)?;
    at_least(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| Error::InvalidUtf8)
}

impl Write for Record {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Record::Null => buf.put_u8(TAG_NULL),
            Record::Bool(false) => buf.put_u8(TAG_FALSE),
            Record::Bool(true) => buf.put_u8(TAG_TRUE),
            Record::Int(i) => {
                buf.put_u8(TAG_INT);
                varint::write_signed(*i, buf);
            }
            Record::Float(f) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64(*f);
            }
            Record::Str(s) => {
                buf.put_u8(TAG_STR);
                write_str(s, buf);
            }
            Record::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                varint::write(b.len() as u64, buf);
                buf.put_slice(b);
            }
            Record::List(items) => {
                buf.put_u8(TAG_LIST);
                varint::write(items.len() as u64, buf);
                for item in items {
                    item.write(buf);
                }
            }
            Record::Map(fields) => {
                buf.put_u8(TAG_MAP);
                varint::write(fields.len() as u64, buf);
                for (key, value) in fields {
                    write_str(key, buf);
                    value.write(buf);
                }
            }
        }
    }
}

impl EncodeSize for Record {
    fn encode_size(&self) -> usize {
        1 + match self {
            Record::Null | Record::Bool(_) => 0,
            Record::Int(i) => varint::size_signed(*i),
            Record::Float(_) => 8,
            Record::Str(s) => str_size(s),
            Record::Bytes(b) => varint::size(b.len() as u64) + b.len(),
            Record::List(items) => {
                varint::size(items.len() as u64)
                    + items.iter().map(EncodeSize::encode_size).sum::<usize>()
            }
            Record::Map(fields) => {
                varint::size(fields.len() as u64)
                    + fields
                        .iter()
                        .map(|(k, v)| str_size(k) + v.encode_size())
                        .sum::<usize>()
            }
        }
    }
}

fn read_record(buf: &mut impl Buf, limits: &Limits, depth: usize) -> Result<Record, Error> {
    at_least(buf, 1)?;
    let tag = buf.get_u8();
    match tag {
        TAG_NULL => Ok(Record::Null),
        TAG_FALSE => Ok(Record::Bool(false)),
        TAG_TRUE => Ok(Record::Bool(true)),
        TAG_INT => Ok(Record::Int(varint::read_signed(buf)?)),
        TAG_FLOAT => {
            at_least(buf, 8)?;
            Ok(Record::Float(buf.get_f64()))
        }
        TAG_STR => Ok(Record::Str(read_str(buf, limits)?)),
        TAG_BYTES => {
            let len = varint::read_len(buf, limits.max_len)?;
            at_least(buf, len)?;
            Ok(Record::Bytes(buf.copy_to_bytes(len)))
        }
        TAG_LIST | TAG_MAP => {
            if depth >= limits.max_depth {
                return Err(Error::DepthExceeded(limits.max_depth));
            }
            let len = varint::read_len(buf, limits.max_len)?;
            if tag == TAG_LIST {
                // Every item takes at least one byte, so cap the preallocation by what is left.
                let mut items = Vec::with_capacity(len.min(buf.remaining()));
                for _ in 0..len {
                    items.push(read_record(buf, limits, depth + 1)?);
                }
                return Ok(Record::List(items));
            }
            let mut fields = BTreeMap::new();
            let mut last: Option<String> = None;
            for _ in 0..len {
                let key = read_str(buf, limits)?;
                if let Some(prev) = &last {
                    if *prev >= key {
                        return Err(Error::InvalidData(
                            "Record".into(),
                            format!("map keys out of order at {key:?}"),
                        ));
                    }
                }
                let value = read_record(buf, limits, depth + 1)?;
                fields.insert(key.clone(), value);
                last = Some(key);
            }
            Ok(Record::Map(fields))
        }
        other => Err(Error::InvalidTag(other)),
    }
}

impl Read for Record {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, cfg: &Limits) -> Result<Self, Error> {
        read_record(buf, cfg, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decode, Encode};

    fn sample() -> Record {
        let mut inner = Record::map();
        inner.insert("meta", "CHK@a,b,AAIC");
        inner.insert("size", 12i64);
        let mut record = Record::map();
        record.insert("node_min", 2i64);
        record.insert("subnodes", Record::List(vec![inner, Record::Null]));
        record.insert("flag", true);
        record.insert("score", 0.5f64);
        record.insert("raw", Bytes::from_static(b"\x00\x01"));
        record.insert("neg", -300i64);
        record
    }

    #[test]
    fn test_round_trip() {
        let record = sample();
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encode_size());
        let decoded = Record::decode_cfg(encoded.freeze(), &Limits::default()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_deterministic() {
        let mut a = Record::map();
        a.insert("b", 1i64);
        a.insert("a", 2i64);
        let mut b = Record::map();
        b.insert("a", 2i64);
        b.insert("b", 1i64);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_unsorted_map_rejected() {
        // Map with keys "b" then "a".
        let raw: &[u8] = &[TAG_MAP, 2, 1, b'b', TAG_NULL, 1, b'a', TAG_NULL];
        let err = Record::decode_cfg(raw, &Limits::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_, _)));
    }

    #[test]
    fn test_depth_limit() {
        let mut record = Record::Null;
        for _ in 0..5 {
            record = Record::List(vec![record]);
        }
        let limits = Limits {
            max_len: 16,
            max_depth: 3,
        };
        let err = Record::decode_cfg(record.encode().freeze(), &limits).unwrap_err();
        assert!(matches!(err, Error::DepthExceeded(3)));
    }

    #[test]
    fn test_invalid_tag() {
        let raw: &[u8] = &[42];
        assert!(matches!(
            Record::decode_cfg(raw, &Limits::default()),
            Err(Error::InvalidTag(42))
        ));
    }

    #[test]
    fn test_field_errors() {
        let record = sample();
        assert_eq!(record.int_field("node_min").unwrap(), 2);
        assert!(matches!(
            record.int_field("missing"),
            Err(Error::MissingField(f)) if f == "missing"
        ));
        assert!(matches!(
            record.str_field("node_min"),
            Err(Error::InvalidField { field, expected: "string", .. }) if field == "node_min"
        ));
        assert_eq!(record.opt_str_field("absent").unwrap(), None);
    }
}
