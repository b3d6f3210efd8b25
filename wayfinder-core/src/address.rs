use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Length of a transaction id: the base64url form of 32 bytes.
pub const TXID_LENGTH: usize = 43;

/// Length of a sandbox subdomain: the base32 form of a 32-byte digest.
pub const SANDBOX_LENGTH: usize = 52;

const ARNS_MAX_LENGTH: usize = 51;

/// A content address: 43 characters of base64url. Case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxId(String);

impl TxId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 32 raw bytes the id encodes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        URL_SAFE_NO_PAD
            .decode(self.0.as_bytes())
            .map_err(|e| Error::InvalidRequest {
                message: format!("Transaction id `{}` is not valid base64url: {e}", self.0),
            })
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TxId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TXID_LENGTH || !s.bytes().all(is_base64url_byte) {
            return Err(Error::InvalidRequest {
                message: format!("`{s}` is not a valid transaction id"),
            });
        }
        Ok(TxId(s.to_string()))
    }
}

/// A human-readable ArNS name. Normalised to lower-case on parse; anything
/// that reads as a transaction id is rejected so the two namespaces cannot
/// shadow each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArnsName(String);

impl ArnsName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ArnsName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if TxId::from_str(s).is_ok() {
            return Err(Error::InvalidRequest {
                message: format!("`{s}` is a transaction id, not an ArNS name"),
            });
        }
        let normalized = s.to_ascii_lowercase();
        if normalized.is_empty()
            || normalized.len() > ARNS_MAX_LENGTH
            || !normalized
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(Error::InvalidRequest {
                message: format!("`{s}` is not a valid ArNS name"),
            });
        }
        Ok(ArnsName(normalized))
    }
}

fn is_base64url_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// The deterministic subdomain a transaction id is served under:
/// lowercase base32 of `sha256(txid_bytes)`, 52 characters. One-way, so a
/// gateway host can sandbox browser origins per content address without a
/// lookup table.
pub fn sandbox_subdomain(txid: &TxId) -> Result<String, Error> {
    let bytes = txid.to_bytes()?;
    let digest = Sha256::digest(&bytes);
    Ok(BASE32_NOPAD.encode(&digest).to_ascii_lowercase())
}

/// True iff `subdomain` is the sandbox for `txid`.
pub fn validate_sandbox(subdomain: &str, txid: &TxId) -> bool {
    match sandbox_subdomain(txid) {
        Ok(expected) => subdomain == expected,
        Err(_) => false,
    }
}

/// True for labels shaped like a sandbox subdomain (lowercase base32,
/// 52 chars). Shape only; validity against a txid is checked separately.
pub fn looks_like_sandbox(label: &str) -> bool {
    label.len() == SANDBOX_LENGTH
        && label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Canonical ids: 43 base64url chars decoding to exactly 32 bytes.
    const TX: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const TX2: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBA";

    #[test]
    fn txid_accepts_43_char_base64url() {
        assert!(TxId::from_str(TX).is_ok());
        assert!(TxId::from_str("aBcDeFgHiJkLmNoPqRsTuVwXyZ0123456789_-AbCdE").is_ok());
    }

    #[test]
    fn txid_rejects_wrong_length_and_alphabet() {
        assert!(TxId::from_str("short").is_err());
        assert!(TxId::from_str(&"a".repeat(44)).is_err());
        assert!(TxId::from_str(&format!("{}+", &TX[..42])).is_err());
        assert!(TxId::from_str(&format!("{}/", &TX[..42])).is_err());
    }

    #[test]
    fn arns_name_normalises_to_lowercase() {
        let name = ArnsName::from_str("ArDrive").unwrap();
        assert_eq!(name.as_str(), "ardrive");
    }

    #[test]
    fn arns_name_rejects_txid_shapes() {
        assert!(ArnsName::from_str(TX).is_err());
    }

    #[test]
    fn arns_name_rejects_bad_input() {
        assert!(ArnsName::from_str("").is_err());
        assert!(ArnsName::from_str(&"a".repeat(52)).is_err());
        assert!(ArnsName::from_str("has.dot").is_err());
        assert!(ArnsName::from_str("has space").is_err());
    }

    #[test]
    fn sandbox_is_deterministic_and_52_chars() {
        let txid = TxId::from_str(TX).unwrap();
        let a = sandbox_subdomain(&txid).unwrap();
        let b = sandbox_subdomain(&txid).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), SANDBOX_LENGTH);
        assert!(looks_like_sandbox(&a));
    }

    #[test]
    fn sandbox_differs_per_txid() {
        let a = sandbox_subdomain(&TxId::from_str(TX).unwrap()).unwrap();
        let b = sandbox_subdomain(&TxId::from_str(TX2).unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn validate_sandbox_accepts_only_the_synthesised_label() {
        let txid = TxId::from_str(TX).unwrap();
        let label = sandbox_subdomain(&txid).unwrap();
        assert!(validate_sandbox(&label, &txid));
        assert!(!validate_sandbox(&"a".repeat(SANDBOX_LENGTH), &txid));
    }

    #[test]
    fn looks_like_sandbox_rejects_uppercase_and_bad_digits() {
        assert!(!looks_like_sandbox(&"A".repeat(SANDBOX_LENGTH)));
        assert!(!looks_like_sandbox(&"1".repeat(SANDBOX_LENGTH)));
        assert!(!looks_like_sandbox("tooshort"));
    }
}
