//! # Identifiers and Contacts
//!
//! - [`KademliaID`]: 256-bit identifier; XOR of two IDs is their distance
//! - [`Contact`]: a peer's ID plus the network address it listens on
//!
//! ## Invariants
//!
//! - `KademliaID::from_hex(id.to_hex()) == id` and `to_hex` is lowercase
//! - `a.calc_distance(&b) == b.calc_distance(&a)`
//! - `a.calc_distance(&b)` is all zeros iff `a == b`
//! - `Contact` equality and hashing use the ID only; `distance` is scratch
//!   space for sorting and is never serialized

use std::cmp::Ordering;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::generate_hash;
use crate::error::DhtError;

/// Length of a [`KademliaID`] in bytes.
pub const ID_LENGTH: usize = 32;

/// Maximum accepted length of a contact address.
const MAX_ADDRESS_LEN: usize = 256;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct KademliaID([u8; ID_LENGTH]);

impl KademliaID {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string (either case).
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(s)
            .map_err(|e| DhtError::Validation(format!("invalid hex identifier: {}", e)))?;
        if bytes.len() != ID_LENGTH {
            return Err(DhtError::Validation(format!(
                "identifier must be {} bytes, got {}",
                ID_LENGTH,
                bytes.len()
            )));
        }
        let mut arr = [0u8; ID_LENGTH];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Derive an ID by hashing arbitrary data (public key material, owner IDs).
    pub fn from_data(data: &[u8]) -> Self {
        Self(generate_hash(data))
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// XOR distance to `other`, itself an ID.
    #[inline]
    pub fn calc_distance(&self, other: &KademliaID) -> KademliaID {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        KademliaID(out)
    }

    /// Big-endian lexicographic comparison: the first differing byte decides.
    #[inline]
    pub fn less(&self, other: &KademliaID) -> bool {
        distance_cmp(&self.0, &other.0) == Ordering::Less
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances lexicographically.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LENGTH], b: &[u8; ID_LENGTH]) -> Ordering {
    for i in 0..ID_LENGTH {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl std::fmt::Debug for KademliaID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KademliaID({})", self.short())
    }
}

impl std::fmt::Display for KademliaID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LENGTH]> for KademliaID {
    fn from(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<KademliaID> for String {
    fn from(id: KademliaID) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for KademliaID {
    type Error = DhtError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl std::str::FromStr for KademliaID {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for KademliaID {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Contact {
    #[serde(rename = "ID")]
    pub id: KademliaID,
    pub address: String,
    /// Distance to the target of the most recent `calc_distance` call.
    #[serde(skip)]
    pub distance: KademliaID,
}

impl Contact {
    pub fn new(id: KademliaID, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            distance: KademliaID::default(),
        }
    }

    pub fn calc_distance(&mut self, target: &KademliaID) {
        self.distance = self.id.calc_distance(target);
    }

    /// Orders by the cached `distance`; callers must have run `calc_distance`
    /// against the same target on both contacts.
    pub fn less(&self, other: &Contact) -> bool {
        self.distance.less(&other.distance)
    }

    /// Bounds and format checks for contacts received from the network.
    pub fn validate_structure(&self) -> bool {
        !self.address.is_empty() && self.address.len() <= MAX_ADDRESS_LEN
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.address)
    }
}
