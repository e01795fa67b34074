//! Type definitions for the document CRDT.
//!
//! This module contains the identifier and clock types used throughout the
//! document engine, organized into focused submodules.

pub mod clock;
pub mod node_id;
pub mod site;

pub use clock::VectorClock;
pub use node_id::NodeId;
pub use site::SiteId;
