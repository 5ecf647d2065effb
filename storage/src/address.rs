//! Content addresses naming stored blocks.
//!
//! # Textual form
//!
//! `<TYPE>@<routing>,<crypto>,<extra>[/docname][/meta]*` where `TYPE` is one of `CHK` (content
//! hash), `SSK` (signed, mutable), or `USK` (updatable, versioned); `KSK@<docname>` for keyword
//! addresses. A dashed 36-character lowercase hex string is accepted verbatim as a literal
//! identifier. Key material is rendered with the Freenet base64 alphabet (`~` and `-` in place of
//! `+` and `/`, no padding).
//!
//! Equality, ordering, and hashing are defined on the canonical string.
//!
//! # Updatable addresses
//!
//! `USK@k/site/7` names edition 7 of `site`. Every edition maps to a signed address by suffixing the
//! document name (`SSK@k/site-7`), and back.

use crate::{sha256, Error};
use base64::{
    alphabet::Alphabet,
    engine::{general_purpose::NO_PAD, GeneralPurpose},
    Engine,
};
use bytes::{Buf, BufMut};
use freelib_codec::{record::invalid, KeyTranslator, Primitive, Record};
use std::{fmt, str::FromStr};

const FREENET_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789~-") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("invalid base64 alphabet"),
    };

/// Base64 engine using the Freenet alphabet.
pub const FREENET_BASE64: GeneralPurpose = GeneralPurpose::new(&FREENET_ALPHABET, NO_PAD);

const TYPE_CHK: u8 = 1;
const TYPE_SSK: u8 = 2;
const TYPE_KSK: u8 = 3;
const ROUTING_KEY_LENGTH: usize = 32;
const CRYPTO_KEY_LENGTH: usize = 32;
const EXTRA_LENGTH: usize = 5;

/// Extra bytes of addresses produced by [Address::content_hash].
const CHK_EXTRA: [u8; EXTRA_LENGTH] = [0, 2, 0, 0, 0];

/// Kind of an [Address].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressKind {
    Chk,
    Ssk,
    Ksk,
    Usk,
    Literal,
}

impl AddressKind {
    fn prefix(&self) -> &'static str {
        match self {
            AddressKind::Chk => "CHK",
            AddressKind::Ssk => "SSK",
            AddressKind::Ksk => "KSK",
            AddressKind::Usk => "USK",
            AddressKind::Literal => "",
        }
    }
}

/// An immutable, opaque name for a stored block.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    raw: String,
    kind: AddressKind,
}

fn is_literal(s: &str) -> bool {
    s.len() == 36
        && s.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_digit() || (b'a'..=b'f').contains(&b),
        })
}

/// Some `@` must be followed by nothing or by `<a>,<b>,A<c>`.
fn has_key_material(s: &str) -> bool {
    s.match_indices('@').any(|(at, _)| {
        let rest = &s[at + 1..];
        rest.is_empty()
            || rest
                .match_indices(",A")
                .any(|(comma, _)| rest[..comma].contains(','))
    })
}

impl Address {
    /// Parses and validates `s`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if is_literal(s) {
            return Ok(Self {
                raw: s.to_string(),
                kind: AddressKind::Literal,
            });
        }
        if s.contains(['\n', '\r']) {
            return Err(Error::MalformedAddress(s.to_string()));
        }
        let kind = match s.get(..4) {
            Some("CHK@") => AddressKind::Chk,
            Some("SSK@") => AddressKind::Ssk,
            Some("KSK@") => AddressKind::Ksk,
            Some("USK@") => AddressKind::Usk,
            _ => return Err(Error::MalformedAddress(s.to_string())),
        };
        if kind != AddressKind::Ksk && !has_key_material(s) {
            return Err(Error::MalformedAddress(s.to_string()));
        }
        Ok(Self {
            raw: s.to_string(),
            kind,
        })
    }

    /// Content-hash address of `block`.
    pub fn content_hash(block: &[u8]) -> Self {
        let routing = sha256(block);
        let crypto = sha256(&routing);
        Self {
            raw: format!(
                "CHK@{},{},{}",
                FREENET_BASE64.encode(routing),
                FREENET_BASE64.encode(crypto),
                FREENET_BASE64.encode(CHK_EXTRA)
            ),
            kind: AddressKind::Chk,
        }
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_usk(&self) -> bool {
        self.kind == AddressKind::Usk
    }

    /// Key material (`<routing>,<crypto>,<extra>` or the keyword of a KSK).
    pub fn key(&self) -> &str {
        match self.kind {
            AddressKind::Literal => &self.raw,
            _ => {
                let rest = &self.raw[4..];
                rest.split('/').next().unwrap_or(rest)
            }
        }
    }

    /// Path segments following the key material.
    fn segments(&self) -> impl Iterator<Item = &str> {
        let path = match self.kind {
            AddressKind::Literal => None,
            _ => self.raw[4..].split_once('/').map(|(_, path)| path),
        };
        path.into_iter().flat_map(|path| path.split('/'))
    }

    /// Document name, if the address kind carries one.
    pub fn doc_name(&self) -> Option<&str> {
        match self.kind {
            AddressKind::Ksk => Some(self.key()),
            AddressKind::Ssk | AddressKind::Usk => self.segments().next(),
            AddressKind::Chk | AddressKind::Literal => None,
        }
    }

    /// Path segments after the document name (all segments for content-hash addresses).
    pub fn meta_strings(&self) -> Vec<&str> {
        let skip = match self.kind {
            AddressKind::Chk | AddressKind::Ksk | AddressKind::Literal => 0,
            AddressKind::Ssk => 1,
            AddressKind::Usk => 2,
        };
        self.segments().skip(skip).collect()
    }

    /// Edition of an updatable address.
    pub fn edition(&self) -> Option<i64> {
        if self.kind != AddressKind::Usk {
            return None;
        }
        self.segments().nth(1)?.parse().ok()
    }

    /// The updatable address with its edition and meta strings stripped.
    pub fn root(&self) -> Option<Address> {
        if self.kind != AddressKind::Usk {
            return None;
        }
        let site = self.doc_name()?;
        Some(Self {
            raw: format!("USK@{}/{}", self.key(), site),
            kind: AddressKind::Usk,
        })
    }

    fn with_meta(mut raw: String, meta: &[&str]) -> String {
        for segment in meta {
            raw.push('/');
            raw.push_str(segment);
        }
        raw
    }

    /// Signed address of this edition (`USK@k/site/7` becomes `SSK@k/site-7`).
    pub fn ssk_for_usk(&self) -> Result<Address, Error> {
        let (Some(site), Some(edition)) = (self.doc_name(), self.edition()) else {
            return Err(Error::MalformedAddress(self.raw.clone()));
        };
        let raw = format!("SSK@{}/{}-{}", self.key(), site, edition);
        Ok(Self {
            raw: Self::with_meta(raw, &self.meta_strings()),
            kind: AddressKind::Ssk,
        })
    }

    /// Whether this is the signed form of an updatable address.
    pub fn is_ssk_for_usk(&self) -> bool {
        self.kind == AddressKind::Ssk && self.split_edition().is_some()
    }

    fn split_edition(&self) -> Option<(&str, i64)> {
        let (site, edition) = self.doc_name()?.rsplit_once('-')?;
        if site.is_empty() || edition.is_empty() || !edition.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((site, edition.parse().ok()?))
    }

    /// Updatable form of a signed address (`SSK@k/site-7` becomes `USK@k/site/7`).
    pub fn usk_for_ssk(&self) -> Result<Address, Error> {
        let Some((site, edition)) = self
            .split_edition()
            .filter(|_| self.kind == AddressKind::Ssk)
        else {
            return Err(Error::MalformedAddress(self.raw.clone()));
        };
        let raw = format!("USK@{}/{}/{}", self.key(), site, edition);
        Ok(Self {
            raw: Self::with_meta(raw, &self.meta_strings()),
            kind: AddressKind::Usk,
        })
    }

    /// Writes the length-prefixed binary form.
    ///
    /// Only the textual variant is ever written: a zero length, then the canonical string.
    pub fn write_legacy(&self, buf: &mut impl BufMut) -> Result<(), Error> {
        let len = u16::try_from(self.raw.len())
            .map_err(|_| Error::MalformedAddress(self.raw.clone()))?;
        buf.put_u16(0);
        buf.put_u16(len);
        buf.put_slice(self.raw.as_bytes());
        Ok(())
    }

    /// Reads the length-prefixed binary form, including the structured encoding written by
    /// older crawlers.
    pub fn read_legacy(buf: &mut impl Buf) -> Result<Self, Error> {
        let len = get_u16(buf)? as usize;
        if len == 0 {
            return Self::parse(&get_utf(buf)?);
        }
        if buf.remaining() < len {
            return Err(truncated());
        }
        let mut body = buf.copy_to_bytes(len);
        let kind = match get_u8(&mut body)? {
            TYPE_CHK => AddressKind::Chk,
            TYPE_SSK => AddressKind::Ssk,
            TYPE_KSK => AddressKind::Ksk,
            other => {
                return Err(Error::Format(freelib_codec::Error::InvalidData(
                    "Address".into(),
                    format!("unrecognized key type {other}"),
                )))
            }
        };

        let mut raw = format!("{}@", kind.prefix());
        if kind != AddressKind::Ksk {
            let routing = get_bytes(&mut body, ROUTING_KEY_LENGTH)?;
            let crypto = get_bytes(&mut body, CRYPTO_KEY_LENGTH)?;
            let extra = get_bytes(&mut body, EXTRA_LENGTH)?;
            raw.push_str(&FREENET_BASE64.encode(routing));
            raw.push(',');
            raw.push_str(&FREENET_BASE64.encode(crypto));
            raw.push(',');
            raw.push_str(&FREENET_BASE64.encode(extra));
        }
        if kind != AddressKind::Chk {
            let doc_name = get_utf(&mut body)?;
            if kind != AddressKind::Ksk {
                raw.push('/');
            }
            raw.push_str(&urlencoding::encode(&doc_name));
        }
        let count = get_i32(&mut body)?;
        for _ in 0..count.max(0) {
            raw.push('/');
            raw.push_str(&urlencoding::encode(&get_utf(&mut body)?));
        }
        if body.has_remaining() {
            return Err(Error::Format(freelib_codec::Error::ExtraData(
                body.remaining(),
            )));
        }
        Self::parse(&raw)
    }
}

fn truncated() -> Error {
    Error::Format(freelib_codec::Error::EndOfBuffer)
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, Error> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn get_i32(buf: &mut impl Buf) -> Result<i32, Error> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn get_bytes(buf: &mut impl Buf, len: usize) -> Result<Vec<u8>, Error> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_utf(buf: &mut impl Buf) -> Result<String, Error> {
    let len = get_u16(buf)? as usize;
    let raw = get_bytes(buf, len)?;
    String::from_utf8(raw).map_err(|_| Error::Format(freelib_codec::Error::InvalidUtf8))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl Primitive for Address {
    fn to_record(&self) -> Result<Record, freelib_codec::Error> {
        Ok(Record::Str(self.raw.clone()))
    }

    fn from_record(record: &Record) -> Result<Self, freelib_codec::Error> {
        let raw = record
            .as_str()
            .ok_or_else(|| invalid("address", "string", record))?;
        Self::parse(raw).map_err(|_| freelib_codec::Error::InvalidField {
            field: "address".into(),
            expected: "address",
            found: raw.to_string(),
        })
    }
}

/// Uses the canonical string of an [Address] as its map key.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddressKey;

impl KeyTranslator<Address> for AddressKey {
    fn key_to_string(&self, key: &Address) -> String {
        key.raw.clone()
    }

    fn key_from_string(&self, raw: &str) -> Result<Address, freelib_codec::Error> {
        Address::from_record(&Record::Str(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use test_case::test_case;

    #[test_case("CHK@0,2,A3"; "minimal chk")]
    #[test_case("CHK@"; "empty key")]
    #[test_case("SSK@abc,def,AQACAAE/site-3"; "ssk")]
    #[test_case("USK@abc,def,AQACAAE/site/12/index.html"; "usk")]
    #[test_case("KSK@gpl.txt"; "ksk")]
    #[test_case("0123abcd-0123-4567-89ab-0123456789ab"; "literal")]
    fn test_parse_valid(raw: &str) {
        let address = Address::parse(raw).unwrap();
        assert_eq!(address.to_string(), raw);
    }

    #[test_case("http://example.com"; "unknown scheme")]
    #[test_case("CHK@abc"; "no key structure")]
    #[test_case("CHK@a,b,c"; "extra missing marker")]
    #[test_case("0123ABCD-0123-4567-89ab-0123456789ab"; "uppercase literal")]
    #[test_case(""; "empty")]
    fn test_parse_invalid(raw: &str) {
        assert!(matches!(
            Address::parse(raw),
            Err(Error::MalformedAddress(s)) if s == raw
        ));
    }

    #[test]
    fn test_equality_is_structural() {
        let a = Address::parse("CHK@0,2,A3").unwrap();
        let b: Address = "CHK@0,2,A3".parse().unwrap();
        let c = Address::parse("CHK@1,2,A3").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn test_usk_mapping() {
        let usk = Address::parse("USK@abc,def,AQACAAE/site/12/index.html").unwrap();
        assert!(usk.is_usk());
        assert_eq!(usk.edition(), Some(12));
        assert_eq!(usk.doc_name(), Some("site"));
        assert_eq!(usk.meta_strings(), vec!["index.html"]);
        assert_eq!(usk.root().unwrap().as_str(), "USK@abc,def,AQACAAE/site");

        let ssk = usk.ssk_for_usk().unwrap();
        assert_eq!(ssk.as_str(), "SSK@abc,def,AQACAAE/site-12/index.html");
        assert!(ssk.is_ssk_for_usk());
        assert_eq!(ssk.usk_for_ssk().unwrap(), usk);
    }

    #[test]
    fn test_plain_ssk_is_not_for_usk() {
        let ssk = Address::parse("SSK@abc,def,AQACAAE/site").unwrap();
        assert!(!ssk.is_ssk_for_usk());
        assert!(ssk.usk_for_ssk().is_err());
        assert!(ssk.edition().is_none());
    }

    #[test]
    fn test_content_hash() {
        let a = Address::content_hash(b"block");
        let b = Address::content_hash(b"block");
        let c = Address::content_hash(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.kind(), AddressKind::Chk);
        assert!(a.as_str().ends_with(",AAIAAAA"));
        assert!(Address::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_legacy_textual() {
        let address = Address::parse("USK@abc,def,AQACAAE/site/3").unwrap();
        let mut buf = BytesMut::new();
        address.write_legacy(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0, 0]);
        assert_eq!(Address::read_legacy(&mut buf.freeze()).unwrap(), address);
    }

    #[test]
    fn test_legacy_structured_chk() {
        let mut body = BytesMut::new();
        body.put_u8(TYPE_CHK);
        body.put_slice(&[0u8; ROUTING_KEY_LENGTH]);
        body.put_slice(&[0xffu8; CRYPTO_KEY_LENGTH]);
        body.put_slice(&CHK_EXTRA);
        body.put_i32(1);
        body.put_u16(8);
        body.put_slice(b"a b.html");

        let mut buf = BytesMut::new();
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        let address = Address::read_legacy(&mut buf.freeze()).unwrap();

        let zeros = FREENET_BASE64.encode([0u8; 32]);
        let ones = FREENET_BASE64.encode([0xffu8; 32]);
        assert_eq!(
            address.as_str(),
            format!("CHK@{zeros},{ones},AAIAAAA/a%20b.html")
        );
        assert!(ones.contains('~') || ones.contains('-'));
    }

    #[test]
    fn test_legacy_structured_ksk() {
        let mut body = BytesMut::new();
        body.put_u8(TYPE_KSK);
        body.put_u16(7);
        body.put_slice(b"gpl.txt");
        body.put_i32(0);

        let mut buf = BytesMut::new();
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        let address = Address::read_legacy(&mut buf.freeze()).unwrap();
        assert_eq!(address.as_str(), "KSK@gpl.txt");
        assert_eq!(address.doc_name(), Some("gpl.txt"));
    }

    #[test]
    fn test_legacy_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u8(4);
        assert!(matches!(
            Address::read_legacy(&mut buf.freeze()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_legacy_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u16(40);
        buf.put_u8(TYPE_CHK);
        assert!(matches!(
            Address::read_legacy(&mut buf.freeze()),
            Err(Error::Format(freelib_codec::Error::EndOfBuffer))
        ));
    }

    #[test]
    fn test_record_form() {
        let address = Address::parse("CHK@0,2,A3").unwrap();
        let record = address.to_record().unwrap();
        assert_eq!(<Address as Primitive>::from_record(&record).unwrap(), address);
        assert!(<Address as Primitive>::from_record(&Record::Str("nope".into())).is_err());
        assert_eq!(AddressKey.key_to_string(&address), "CHK@0,2,A3");
    }
}
