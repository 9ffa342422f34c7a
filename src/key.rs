//! Blob identity and the remote object key contract.
//!
//! A [`BlobKey`] names one immutable blob revision. The remote object key
//! derived from it is shared with the archival tool: both sides must
//! produce the same string or archived blobs become unreachable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one committed blob revision: object id plus transaction serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey {
    /// Object id
    pub oid: u64,
    /// Serial of the transaction that committed this revision
    pub serial: u64,
}

impl BlobKey {
    pub fn new(oid: u64, serial: u64) -> Self {
        Self { oid, serial }
    }

    /// Object id as 16 lowercase hex digits.
    pub fn oid_hex(&self) -> String {
        format!("{:016x}", self.oid)
    }

    /// Serial as 16 lowercase hex digits.
    pub fn serial_hex(&self) -> String {
        format!("{:016x}", self.serial)
    }

    /// Parse hex object id and serial, each with an optional `0x` prefix.
    pub fn parse(oid: &str, serial: &str) -> Option<Self> {
        Some(Self::new(parse_hex_u64(oid)?, parse_hex_u64(serial)?))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}@0x{:x}", self.oid, self.serial)
    }
}

/// Derive the remote object key for a blob.
///
/// Layout: `<oid hex16>/<serial hex16>.blob`
pub fn remote_object_key(key: &BlobKey) -> String {
    format!("{}/{}.blob", key.oid_hex(), key.serial_hex())
}

/// Parse a 16-digit (or shorter) hex field, with or without a `0x` prefix.
pub(crate) fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.len() > 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
