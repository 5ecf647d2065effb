//! Framing of [Record]s into self-contained byte blocks.

use crate::{record::Limits, Decode, Encode, Error, Record};
use bytes::{BufMut, Bytes, BytesMut};

/// Leading bytes of every block written by [BinaryStream].
pub const MAGIC: [u8; 4] = *b"FLRC";

/// Current framing version.
pub const VERSION: u8 = 1;

/// Writes a record as one block.
pub trait ObjectStreamWriter: Send + Sync {
    fn write_object(&self, record: &Record) -> Result<Bytes, Error>;
}

/// Reads a record back from one block.
pub trait ObjectStreamReader: Send + Sync {
    fn read_object(&self, block: &[u8]) -> Result<Record, Error>;
}

/// Binary framing: magic, version byte, then the record encoding.
#[derive(Clone, Debug, Default)]
pub struct BinaryStream {
    limits: Limits,
}

impl BinaryStream {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl ObjectStreamWriter for BinaryStream {
    fn write_object(&self, record: &Record) -> Result<Bytes, Error> {
        let encoded = record.encode();
        let mut block = BytesMut::with_capacity(MAGIC.len() + 1 + encoded.len());
        block.put_slice(&MAGIC);
        block.put_u8(VERSION);
        block.put_slice(&encoded);
        Ok(block.freeze())
    }
}

impl ObjectStreamReader for BinaryStream {
    fn read_object(&self, block: &[u8]) -> Result<Record, Error> {
        if block.len() < MAGIC.len() + 1 {
            return Err(Error::EndOfBuffer);
        }
        if block[..MAGIC.len()] != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = block[MAGIC.len()];
        if version != VERSION {
            return Err(Error::UnsupportedStreamVersion(version));
        }
        Record::decode_cfg(&block[MAGIC.len() + 1..], &self.limits)
    }
}
