//! Validation errors for addresses and find-node replies.
//!
//! None of these reach the caller of a search. The runner logs them at debug
//! level and keeps stepping.

use thiserror::Error;

/// A serialized address could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("serialized address must be 40 bytes, got {0}")]
    Length(usize),
}

/// A find-node reply was rejected before any entry was looked at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("reply carries no node list")]
    MissingNodes,

    #[error("node list of {0} bytes is not a non-empty multiple of 40")]
    BadNodesLength(usize),

    #[error("reply carries no version list")]
    MissingVersions,

    #[error("version list is malformed")]
    MalformedVersions,

    #[error("version list has {versions} entries for {nodes} nodes")]
    VersionCountMismatch { versions: usize, nodes: usize },
}
