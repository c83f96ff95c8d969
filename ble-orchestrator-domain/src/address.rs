use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address must have 6 colon-separated octets, got {0}")]
    WrongOctetCount(usize),
    #[error("octet {0:?} is not two hex digits")]
    BadOctet(String),
}

/// A 48-bit BLE device address, canonicalised to uppercase colon-separated
/// hex (`AA:BB:CC:DD:EE:FF`). Equality and hashing are case-insensitive by
/// construction: the canonical form is the only form ever stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.split(':').collect();
        if octets.len() != 6 {
            return Err(AddressParseError::WrongOctetCount(octets.len()));
        }
        let mut canonical = String::with_capacity(17);
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AddressParseError::BadOctet((*octet).to_string()));
            }
            if i > 0 {
                canonical.push(':');
            }
            canonical.push_str(&octet.to_ascii_uppercase());
        }
        Ok(Address(canonical))
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonicalises_lowercase() {
        let addr: Address = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn equality_is_case_insensitive() {
        let a: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let b: Address = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_octet_count() {
        let err = "AA:BB:CC".parse::<Address>().unwrap_err();
        assert_eq!(err, AddressParseError::WrongOctetCount(3));
    }

    #[test]
    fn rejects_non_hex_octet() {
        let err = "ZZ:BB:CC:DD:EE:FF".parse::<Address>().unwrap_err();
        assert!(matches!(err, AddressParseError::BadOctet(_)));
    }
}
