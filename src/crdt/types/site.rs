//! Site identifier type.
//!
//! A site is one participant (one editor instance) producing operations
//! against a document.

/// A unique identifier for each site (collaborator) in the distributed system.
///
/// Site ids are opaque strings; clients default to a random UUID. They take
/// part in the total order of [`NodeId`](super::NodeId)s, so two sites must
/// never share one.
pub type SiteId = String;
