/// Subscriber identities (SIDs) and ply bundle identifiers
///
/// Both are 32-byte binary values rendered as upper-case hex.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::MeshmsError;

pub const SID_SIZE: usize = 32;
pub const BUNDLE_ID_SIZE: usize = 32;

/// Identity address of one MeshMS party.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid([u8; SID_SIZE]);

/// Identifier of the bundle holding one ply.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleId([u8; BUNDLE_ID_SIZE]);

impl Sid {
    pub const fn from_bytes(bytes: [u8; SID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex_upper(&self.0)
    }

    /// Parse exactly `2 * SID_SIZE` hex digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        match Self::parse_prefix(s) {
            Some((sid, "")) => Some(sid),
            _ => None,
        }
    }

    /// Parse a SID at the start of `s`, returning the unparsed remainder.
    pub fn parse_prefix(s: &str) -> Option<(Self, &str)> {
        let mut bytes = [0u8; SID_SIZE];
        let rest = decode_hex_prefix(s, &mut bytes)?;
        Some((Self(bytes), rest))
    }
}

impl BundleId {
    pub const fn from_bytes(bytes: [u8; BUNDLE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BUNDLE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex_upper(&self.0)
    }

    /// Bundle id of the ply authored by `author` addressed to `recipient`.
    pub fn for_ply(author: &Sid, recipient: &Sid) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(author.as_bytes());
        hasher.update(recipient.as_bytes());
        hasher.update(b"meshms-ply");
        let mut bytes = [0u8; BUNDLE_ID_SIZE];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }
}

fn to_hex_upper(bytes: &[u8]) -> String {
    let mut buf = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(buf, "{byte:02X}");
    }
    buf
}

/// Fill `out` from the leading hex digits of `s`.
fn decode_hex_prefix<'a>(s: &'a str, out: &mut [u8]) -> Option<&'a str> {
    let digits = out.len() * 2;
    let bytes = s.as_bytes();
    if bytes.len() < digits {
        return None;
    }
    for (i, chunk) in bytes[..digits].chunks_exact(2).enumerate() {
        let hi = hex_digit(chunk[0])?;
        let lo = hex_digit(chunk[1])?;
        out[i] = (hi << 4) | lo;
    }
    // The remainder must not continue the hex run.
    if bytes.get(digits).is_some_and(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(&s[digits..])
}

const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({}*)", &self.to_hex()[..8])
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleId({}*)", &self.to_hex()[..8])
    }
}

impl FromStr for Sid {
    type Err = MeshmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sid::from_hex(s).ok_or_else(|| MeshmsError::NotFound(format!("Invalid SID: {}", s)))
    }
}

impl Serialize for Sid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sid::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid SID hex"))
    }
}
