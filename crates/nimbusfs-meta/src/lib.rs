#![warn(missing_docs)]

//! NimbusFS metadata subsystem: namespace tree, chunk metadata, checkpoints, replication monitoring

pub mod authority;
pub mod checkpoint;
pub mod idgen;
pub mod node;
pub mod placement;
pub mod replicator;
pub mod request;
pub mod session;
pub mod store;
pub mod tree;
pub mod types;
