use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

const SHORT_ID_ALPHABET: &[u8] = b"23456789abcdefghijkmnpqrstuvwxyz";
const CONFIRMATION_ID_TOKEN_LEN: usize = 12;

/// Current time as RFC 3339 with microsecond precision, UTC.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_base32_u64_prefix(value: u64, len: usize) -> String {
    let mut out = String::with_capacity(len);
    for i in 0..len {
        let shift = 64 - (i + 1) * 5;
        let idx = ((value >> shift) & 31) as usize;
        out.push(SHORT_ID_ALPHABET[idx] as char);
    }
    out
}

/// Length-prefixed sha256 over `parts`, so `["ab", "c"]` and `["a", "bc"]`
/// never collide.
pub fn digest_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Deterministic short id: `<prefix>-<12 base32 chars>`.
pub fn short_digest_id(prefix: &str, parts: &[&[u8]]) -> String {
    let digest = digest_parts(parts);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(bytes);
    format!(
        "{}-{}",
        prefix,
        encode_base32_u64_prefix(value, CONFIRMATION_ID_TOKEN_LEN)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_ids_are_stable_and_prefixed() {
        let a = short_digest_id("cf", &[b"cell", b"Sheet1!B2"]);
        let b = short_digest_id("cf", &[b"cell", b"Sheet1!B2"]);
        assert_eq!(a, b);
        assert!(a.starts_with("cf-"));
        assert_eq!(a.len(), 3 + CONFIRMATION_ID_TOKEN_LEN);
    }

    #[test]
    fn digest_parts_are_length_delimited() {
        assert_ne!(digest_parts(&[b"ab", b"c"]), digest_parts(&[b"a", b"bc"]));
    }
}
