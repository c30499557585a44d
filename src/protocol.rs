//! Find-node message definitions.
//!
//! Messages are logical maps; the short field names match what the mesh's
//! routers put on the wire. The node list in a reply is a packed run of
//! 40-byte addresses and the protocol versions travel beside it as a
//! [`VersionList`].
//!
//! [`RouterModule`] is the seam to the message layer that actually carries
//! queries across the mesh.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::{Address, Ip6, ADDRESS_SERIALIZED_SIZE};
use crate::error::ReplyError;

/// Query name for a find-node request.
pub const QUERY_FIND_NODE: &str = "fn";

/// Widest integer a version list entry may use.
const MAX_VERSION_WIDTH: usize = 4;

/// Ask a node for the nodes it knows closest to `target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeQuery {
    /// Query name, always [`QUERY_FIND_NODE`].
    #[serde(rename = "q")]
    pub query: String,
    /// The identifier being searched for.
    #[serde(rename = "tar")]
    pub target: Ip6,
}

impl FindNodeQuery {
    pub fn new(target: Ip6) -> Self {
        Self {
            query: QUERY_FIND_NODE.to_string(),
            target,
        }
    }
}

/// Answer to a [`FindNodeQuery`].
///
/// Both fields are optional on the wire; a reply missing either is rejected
/// by the search that receives it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesReply {
    /// Packed serialized addresses, paths relative to the responder.
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<u8>>,
    /// Encoded [`VersionList`], one entry per address.
    #[serde(rename = "np", default, skip_serializing_if = "Option::is_none")]
    pub node_protocols: Option<Vec<u8>>,
}

impl NodesReply {
    /// Pack a list of addresses and their versions.
    pub fn from_addresses(addresses: &[Address]) -> Self {
        let mut nodes = Vec::with_capacity(addresses.len() * ADDRESS_SERIALIZED_SIZE);
        for addr in addresses {
            nodes.extend_from_slice(&addr.serialize());
        }
        let versions = VersionList {
            versions: addresses.iter().map(|a| a.protocol_version).collect(),
        };
        Self {
            nodes: Some(nodes),
            node_protocols: Some(versions.encode()),
        }
    }

    /// Number of whole addresses in the node list.
    pub fn node_count(&self) -> usize {
        self.nodes
            .as_ref()
            .map(|n| n.len() / ADDRESS_SERIALIZED_SIZE)
            .unwrap_or(0)
    }
}

/// Protocol versions of the nodes in a reply.
///
/// Encoded as one byte giving the width of each entry (1 to 4 bytes)
/// followed by the entries in big-endian order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionList {
    pub versions: Vec<u32>,
}

impl VersionList {
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Decode a version list.
    ///
    /// ```
    /// use mesh_dht::protocol::VersionList;
    ///
    /// let list = VersionList::parse(&[1, 2, 3, 9]).unwrap();
    /// assert_eq!(list.versions, vec![2, 3, 9]);
    /// assert!(VersionList::parse(&[2, 0, 1, 7]).is_err());
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, ReplyError> {
        let (&width, body) = bytes.split_first().ok_or(ReplyError::MalformedVersions)?;
        let width = width as usize;
        if width == 0 || width > MAX_VERSION_WIDTH || body.len() % width != 0 {
            return Err(ReplyError::MalformedVersions);
        }
        let versions = body
            .chunks_exact(width)
            .map(|chunk| chunk.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
            .collect();
        Ok(Self { versions })
    }

    /// Encode using the narrowest width that fits every entry.
    pub fn encode(&self) -> Vec<u8> {
        let max = self.versions.iter().copied().max().unwrap_or(0);
        let width = match max {
            0..=0xff => 1,
            0x100..=0xffff => 2,
            0x1_0000..=0xff_ffff => 3,
            _ => 4,
        };
        let mut out = Vec::with_capacity(1 + width * self.versions.len());
        out.push(width as u8);
        for v in &self.versions {
            out.extend_from_slice(&v.to_be_bytes()[4 - width..]);
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Layer
// ─────────────────────────────────────────────────────────────────────────────

/// Carries find-node queries to other nodes.
#[async_trait]
pub trait RouterModule: Send + Sync + 'static {
    /// Send `query` to `to` and wait for its answer.
    ///
    /// Any error is treated by the caller as "no reply".
    async fn find_node(&self, to: &Address, query: FindNodeQuery) -> Result<NodesReply>;

    /// How long a search waits on one node before moving to the next.
    fn search_timeout(&self) -> Duration;
}
