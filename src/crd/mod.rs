//! Custom Resource Definitions for ReplicaDB
//!
//! The Cluster CRD owned by this operator, plus the data-protection and
//! volume snapshot types the component engine reads and writes.

mod cluster;
pub mod dataprotection;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod tests;

pub use cluster::{Cluster, ClusterComponentSpec, ClusterSpec, ClusterStatus, SpecValidationError};
pub use dataprotection::{
    Backup, BackupPhase, BackupPolicy, BackupPolicySpec, BackupSpec, BackupStatus, BackupTool,
    BackupToolSpec, BackupType,
};
pub use snapshot::{VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotSpec, VolumeSnapshotStatus};
pub use types::*;
