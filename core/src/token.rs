/// Resumption tokens: (ply bundle id, byte offset) as URL-safe base64
///
/// The binary form is the 32-byte bundle id followed by the offset as a
/// little-endian `u64`, encoded without padding so it can sit in a path
/// segment.
use crate::error::{MeshmsError, Result};
use crate::sid::{BundleId, BUNDLE_ID_SIZE};
use base64::{engine::general_purpose, Engine as _};
use std::fmt;

const TOKEN_BINARY_LEN: usize = BUNDLE_ID_SIZE + 8;

/// Length of every encoded token.
pub const TOKEN_STRLEN: usize = (TOKEN_BINARY_LEN * 4 + 2) / 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshmsToken {
    pub bundle_id: BundleId,
    pub offset: u64,
}

impl MeshmsToken {
    pub fn new(bundle_id: BundleId, offset: u64) -> Self {
        Self { bundle_id, offset }
    }

    pub fn encode(&self) -> String {
        let mut raw = [0u8; TOKEN_BINARY_LEN];
        raw[..BUNDLE_ID_SIZE].copy_from_slice(self.bundle_id.as_bytes());
        raw[BUNDLE_ID_SIZE..].copy_from_slice(&self.offset.to_le_bytes());
        general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token that must make up the whole of `s`.
    pub fn decode(s: &str) -> Result<Self> {
        match Self::decode_prefix(s)? {
            (token, "") => Ok(token),
            _ => Err(MeshmsError::InvalidToken),
        }
    }

    /// Decode a token at the start of `s` and return whatever follows the
    /// base64 run, for tokens embedded in a longer path.
    pub fn decode_prefix(s: &str) -> Result<(Self, &str)> {
        let end = s
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(s.len());
        let (text, rest) = s.split_at(end);
        let raw = general_purpose::URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_| MeshmsError::InvalidToken)?;
        if raw.len() != TOKEN_BINARY_LEN {
            return Err(MeshmsError::InvalidToken);
        }

        let mut bid = [0u8; BUNDLE_ID_SIZE];
        bid.copy_from_slice(&raw[..BUNDLE_ID_SIZE]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&raw[BUNDLE_ID_SIZE..]);

        Ok((
            Self {
                bundle_id: BundleId::from_bytes(bid),
                offset: u64::from_le_bytes(offset),
            },
            rest,
        ))
    }
}

impl fmt::Display for MeshmsToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bid(byte: u8) -> BundleId {
        BundleId::from_bytes([byte; BUNDLE_ID_SIZE])
    }

    #[test]
    fn test_token_fixed_length() {
        assert_eq!(TOKEN_STRLEN, 54);
        assert_eq!(MeshmsToken::new(bid(0), 0).encode().len(), TOKEN_STRLEN);
        assert_eq!(MeshmsToken::new(bid(0xff), u64::MAX).encode().len(), TOKEN_STRLEN);
    }

    #[test]
    fn test_token_is_url_safe() {
        let text = MeshmsToken::new(bid(0xfb), u64::MAX - 1).encode();
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let text = MeshmsToken::new(bid(7), 99).encode();
        assert!(MeshmsToken::decode(&text[..TOKEN_STRLEN - 4]).is_err());
        assert!(MeshmsToken::decode(&format!("{}AAAA", text)).is_err());
        assert!(MeshmsToken::decode("").is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_characters() {
        let text = MeshmsToken::new(bid(7), 99).encode();
        let bad = format!("{}+{}", &text[..10], &text[11..]);
        assert!(MeshmsToken::decode(&bad).is_err());
        assert!(MeshmsToken::decode(&format!("{}=", text)).is_err());
    }

    #[test]
    fn test_decode_prefix_leaves_suffix() {
        let token = MeshmsToken::new(bid(3), 1234);
        let path = format!("{}/messagelist.json", token.encode());
        let (decoded, rest) = MeshmsToken::decode_prefix(&path).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(rest, "/messagelist.json");
        assert!(MeshmsToken::decode(&path).is_err());
    }

    proptest! {
        #[test]
        fn prop_token_roundtrip(bytes in proptest::array::uniform32(any::<u8>()), offset in any::<u64>()) {
            let token = MeshmsToken::new(BundleId::from_bytes(bytes), offset);
            prop_assert_eq!(MeshmsToken::decode(&token.encode()).unwrap(), token);
        }
    }
}
