//! Serialize index structures.
//!
//! # Overview
//!
//! Persisted objects pass through two layers:
//! - A [Translator] maps a typed value to a generic [Record] (a nested map/list/scalar value) and
//!   back. Translators are pure and compose, so a tree of sets of entries is encoded by nesting
//!   translators rather than special-casing.
//! - An [ObjectStreamWriter]/[ObjectStreamReader] frames a [Record] into a self-contained block.
//!   [BinaryStream] is the provided framing: a deterministic tag/varint encoding where map keys are
//!   always written in sorted order.
//!
//! # Example
//!
//! ```
//! use freelib_codec::{BinaryStream, ObjectStreamReader, ObjectStreamWriter, Record};
//!
//! let mut record = Record::map();
//! record.insert("node_min", 2i64);
//! record.insert("entries", Record::map());
//!
//! let stream = BinaryStream::default();
//! let block = stream.write_object(&record).unwrap();
//! assert_eq!(stream.read_object(&block).unwrap(), record);
//! ```

pub mod codec;
pub mod error;
pub mod record;
pub mod stream;
pub mod translate;
pub mod varint;

pub use codec::{Decode, Encode, EncodeSize, Read, Write};
pub use error::Error;
pub use record::{Limits, Record};
pub use stream::{BinaryStream, ObjectStreamReader, ObjectStreamWriter};
pub use translate::{Inline, KeyTranslator, Primitive, StringKey, Translator};
