//! Node addresses and switch labels.
//!
//! A node is known by its 32-byte public key. The 16-byte network identifier
//! (`ip6`) is derived from the key, and reachability is a 64-bit switch label
//! (`path`) read from the least significant bit upward, with the highest set
//! bit acting as the terminator.
//!
//! - **Identity**: [`derive_ip6`], [`is_valid_ip6`]
//! - **Labels**: [`splice`], [`routes_through`], [`log2`]
//! - **Distance**: [`closest`], [`xor_distance`]
//! - **Wire form**: [`Address::serialize`], [`Address::parse`]

use std::cmp::Ordering;
use std::fmt;

use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::AddressError;

// ============================================================================
// Constants
// ============================================================================

/// Size of a node's public key.
pub const KEY_SIZE: usize = 32;

/// Size of the derived network identifier and of a search target.
pub const SEARCH_TARGET_SIZE: usize = 16;

/// Size of an address on the wire: key followed by a big-endian path.
pub const ADDRESS_SERIALIZED_SIZE: usize = KEY_SIZE + 8;

/// Path value reserved for "no route".
pub const UNROUTABLE: u64 = u64::MAX;

/// First byte every valid network identifier carries.
pub const ADDRESS_PREFIX: u8 = 0xfc;

/// The label that routes a packet to the local switch itself.
pub const SELF_ROUTE: u64 = 1;

/// Spliced labels longer than this many bits cannot be represented.
const MAX_SPLICED_BITS: u32 = 59;

// ============================================================================
// Identity
// ============================================================================

/// A 16-byte network identifier derived from a public key.
pub type Ip6 = [u8; SEARCH_TARGET_SIZE];

/// Derive the network identifier of a public key.
///
/// The identifier is the first 16 bytes of a double BLAKE3 digest, so it is
/// stable for a key and cannot be chosen independently of it:
///
/// ```
/// use mesh_dht::address::derive_ip6;
///
/// let key = [7u8; 32];
/// assert_eq!(derive_ip6(&key), derive_ip6(&key));
/// assert_ne!(derive_ip6(&key), derive_ip6(&[8u8; 32]));
/// ```
pub fn derive_ip6(key: &[u8; KEY_SIZE]) -> Ip6 {
    let first = iroh_blake3::hash(key);
    let mut hasher = Hasher::new();
    hasher.update(first.as_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; SEARCH_TARGET_SIZE];
    out.copy_from_slice(&digest.as_bytes()[..SEARCH_TARGET_SIZE]);
    out
}

/// Whether an identifier falls inside the mesh's address range.
pub fn is_valid_ip6(ip6: &Ip6) -> bool {
    ip6[0] == ADDRESS_PREFIX
}

// ============================================================================
// Labels
// ============================================================================

/// Index of the highest set bit, or 0 for 0.
pub fn log2(label: u64) -> u32 {
    if label == 0 {
        return 0;
    }
    63 - label.leading_zeros()
}

/// Splice `go_here` (a label valid at the node reached through `via_here`)
/// onto `via_here`, producing a label valid at the local node.
///
/// Returns [`UNROUTABLE`] when the combined label would not fit.
///
/// ```
/// use mesh_dht::address::{splice, SELF_ROUTE, UNROUTABLE};
///
/// // Going through ourselves changes nothing.
/// assert_eq!(splice(0x15, SELF_ROUTE), 0x15);
/// assert_eq!(splice(0x13, 0x15), 0x135);
/// assert_eq!(splice(1 << 40, 1 << 30), UNROUTABLE);
/// ```
pub fn splice(go_here: u64, via_here: u64) -> u64 {
    let via_bits = log2(via_here);
    if log2(go_here) + via_bits > MAX_SPLICED_BITS {
        return UNROUTABLE;
    }
    ((go_here ^ 1) << via_bits) ^ via_here
}

/// Whether `destination` is reached by first following `mid_path`.
pub fn routes_through(destination: u64, mid_path: u64) -> bool {
    if mid_path > destination {
        return false;
    }
    if mid_path < 2 {
        return true;
    }
    let mask = u64::MAX >> (64 - log2(mid_path));
    (destination & mask) == (mid_path & mask)
}

/// Render a label the way switch tooling prints it: four dotted hex groups.
pub fn format_path(path: u64) -> String {
    format!(
        "{:04x}.{:04x}.{:04x}.{:04x}",
        (path >> 48) & 0xffff,
        (path >> 32) & 0xffff,
        (path >> 16) & 0xffff,
        path & 0xffff
    )
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// XOR distance between two identifiers.
pub fn xor_distance(a: &Ip6, b: &Ip6) -> Ip6 {
    let mut out = [0u8; SEARCH_TARGET_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Compare how close `a` and `b` are to `target`.
///
/// `Ordering::Less` means `a` is strictly closer. Only the identifiers take
/// part in the comparison.
pub fn closest(target: &Address, a: &Address, b: &Address) -> Ordering {
    let da = xor_distance(&a.ip6, &target.ip6);
    let db = xor_distance(&b.ip6, &target.ip6);
    da.cmp(&db)
}

// ============================================================================
// Address
// ============================================================================

/// Everything needed to reach and identify a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Address {
    /// The node's public key.
    pub key: [u8; KEY_SIZE],
    /// Identifier derived from `key`, or the bare target of a search.
    pub ip6: Ip6,
    /// Switch label from the local node to this node.
    pub path: u64,
    /// Protocol version the node speaks, as far as we know.
    pub protocol_version: u32,
}

impl Address {
    /// Build an address from a key, deriving its identifier.
    pub fn new(key: [u8; KEY_SIZE], path: u64, protocol_version: u32) -> Self {
        Self {
            key,
            ip6: derive_ip6(&key),
            path,
            protocol_version,
        }
    }

    /// An address carrying only an identifier, used as a search target.
    pub fn from_target(target: Ip6) -> Self {
        Self {
            ip6: target,
            ..Self::default()
        }
    }

    /// Decode the 40-byte wire form. The version is left at 0.
    pub fn parse(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDRESS_SERIALIZED_SIZE {
            return Err(AddressError::Length(bytes.len()));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[..KEY_SIZE]);
        let mut path = [0u8; 8];
        path.copy_from_slice(&bytes[KEY_SIZE..]);
        Ok(Self::new(key, u64::from_be_bytes(path), 0))
    }

    /// Encode the 40-byte wire form. The version travels separately.
    pub fn serialize(&self) -> [u8; ADDRESS_SERIALIZED_SIZE] {
        let mut out = [0u8; ADDRESS_SERIALIZED_SIZE];
        out[..KEY_SIZE].copy_from_slice(&self.key);
        out[KEY_SIZE..].copy_from_slice(&self.path.to_be_bytes());
        out
    }

    /// Whether the identifier is inside the mesh's address range.
    pub fn is_valid(&self) -> bool {
        is_valid_ip6(&self.ip6)
    }

    /// Whether the path can be used at all.
    pub fn is_routable(&self) -> bool {
        self.path != UNROUTABLE
    }

    /// Short hex form of the identifier for log fields.
    pub fn short_id(&self) -> String {
        hex::encode(&self.ip6[..4])
    }
}

/// Format an identifier as eight colon-separated hex groups.
pub fn format_ip6(ip6: &Ip6) -> String {
    ip6.chunks(2)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(":")
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{}.{}.{}",
            self.protocol_version,
            format_path(self.path),
            format_ip6(&self.ip6)
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}
