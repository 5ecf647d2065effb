//! Mapping between typed values and [Record]s.
//!
//! Translators are stateless and compose: a tree translator delegates each entry to an entry
//! translator, which may in turn delegate to a value translator.

use crate::{record::invalid, Error, Record};
use bytes::Bytes;

/// Bidirectional mapping between `T` and a generic [Record].
pub trait Translator<T>: Send + Sync {
    /// Translates `value` into a record.
    ///
    /// Fails only if `value` cannot be represented (for example, a partially persisted tree).
    fn to_record(&self, value: &T) -> Result<Record, Error>;

    /// Rebuilds a value from `record`, failing with a data-format error naming the offending
    /// field on missing or mistyped input.
    fn from_record(&self, record: &Record) -> Result<T, Error>;
}

/// Bidirectional mapping between a map key and its string form.
pub trait KeyTranslator<K>: Send + Sync {
    fn key_to_string(&self, key: &K) -> String;

    fn key_from_string(&self, raw: &str) -> Result<K, Error>;
}

/// Values with a canonical inline record form.
pub trait Primitive: Sized {
    /// Fails with [Error::Unencodable] if `self` has no record form.
    fn to_record(&self) -> Result<Record, Error>;

    fn from_record(record: &Record) -> Result<Self, Error>;
}

/// Translates any [Primitive] inline.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl<T: Primitive> Translator<T> for Inline {
    fn to_record(&self, value: &T) -> Result<Record, Error> {
        value.to_record()
    }

    fn from_record(&self, record: &Record) -> Result<T, Error> {
        T::from_record(record)
    }
}

/// Uses strings as their own key form.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringKey;

impl KeyTranslator<String> for StringKey {
    fn key_to_string(&self, key: &String) -> String {
        key.clone()
    }

    fn key_from_string(&self, raw: &str) -> Result<String, Error> {
        Ok(raw.to_string())
    }
}

impl Primitive for () {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(Record::Null)
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        match record {
            Record::Null => Ok(()),
            other => Err(invalid("value", "null", other)),
        }
    }
}

impl Primitive for bool {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(Record::Bool(*self))
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        record
            .as_bool()
            .ok_or_else(|| invalid("value", "bool", record))
    }
}

impl Primitive for i64 {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(Record::Int(*self))
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        record.as_int().ok_or_else(|| invalid("value", "int", record))
    }
}

macro_rules! impl_narrow_int {
    ($type:ty) => {
        impl Primitive for $type {
            fn to_record(&self) -> Result<Record, Error> {
                i64::try_from(*self)
                    .map(Record::Int)
                    .map_err(|_| Error::Unencodable(format!("{self} exceeds i64")))
            }

            fn from_record(record: &Record) -> Result<Self, Error> {
                let wide = record.as_int().ok_or_else(|| invalid("value", "int", record))?;
                <$type>::try_from(wide).map_err(|_| Error::InvalidField {
                    field: "value".into(),
                    expected: stringify!($type),
                    found: wide.to_string(),
                })
            }
        }
    };
}

impl_narrow_int!(i32);
impl_narrow_int!(u32);
impl_narrow_int!(u64);

impl Primitive for f64 {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(Record::Float(*self))
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        record
            .as_float()
            .ok_or_else(|| invalid("value", "float", record))
    }
}

impl Primitive for String {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(Record::Str(self.clone()))
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        record
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| invalid("value", "string", record))
    }
}

impl Primitive for Bytes {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(Record::Bytes(self.clone()))
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        record
            .as_bytes()
            .cloned()
            .ok_or_else(|| invalid("value", "bytes", record))
    }
}

impl Primitive for Record {
    fn to_record(&self) -> Result<Record, Error> {
        Ok(self.clone())
    }

    fn from_record(record: &Record) -> Result<Self, Error> {
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline() {
        let record = Translator::<i32>::to_record(&Inline, &-7).unwrap();
        assert_eq!(record, Record::Int(-7));
        let value: i32 = Inline.from_record(&record).unwrap();
        assert_eq!(value, -7);
    }

    #[test]
    fn test_inline_narrowing() {
        let result: Result<u32, _> = Inline.from_record(&Record::Int(-1));
        assert!(matches!(result, Err(Error::InvalidField { expected: "u32", .. })));
    }

    #[test]
    fn test_inline_wide_unsigned() {
        let large = i64::MAX as u64;
        let record = Translator::<u64>::to_record(&Inline, &large).unwrap();
        assert_eq!(record, Record::Int(i64::MAX));
        let value: u64 = Inline.from_record(&record).unwrap();
        assert_eq!(value, large);

        let result = Translator::<u64>::to_record(&Inline, &u64::MAX);
        assert!(matches!(result, Err(Error::Unencodable(_))));
        let result = Translator::<u64>::to_record(&Inline, &(large + 1));
        assert!(matches!(result, Err(Error::Unencodable(_))));
    }

    #[test]
    fn test_inline_mistyped() {
        let result: Result<String, _> = Inline.from_record(&Record::Int(1));
        assert!(matches!(result, Err(Error::InvalidField { expected: "string", .. })));
    }

    #[test]
    fn test_string_key() {
        assert_eq!(StringKey.key_to_string(&"adam".to_string()), "adam");
        assert_eq!(StringKey.key_from_string("eve").unwrap(), "eve");
    }
}
