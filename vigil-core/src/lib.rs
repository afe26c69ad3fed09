//! # Vigil Core
//!
//! Core engine for the Vigil consistency daemons: bad-replica recovery
//! planning, storage/catalog dump reconciliation, and the batched daemon
//! runtime both daemons run on.
//!
//! ## Overview
//!
//! `vigil-core` keeps a replica catalog and the storage it describes in
//! agreement:
//!
//! - **Recovery planning**: one deterministic decision per bad replica
//!   (repair from a surviving sibling, declare lost, or defer)
//! - **Reconciliation**: sorted merge-join of storage and catalog dumps into
//!   dark, lost, and corrupt findings, with recency suppression for
//!   in-flight writes
//! - **Batched runtime**: resumable cursor-ordered pulls, bounded worker
//!   fan-out, cooperative shutdown at batch boundaries
//! - **Idempotence throughout**: deterministic transfer request ids,
//!   state-guarded transitions, write-once findings, per-generation results
//!   files
//!
//! ## Feature Flags
//!
//! - `postgres`: the shipped catalog and transfer-queue adapters (SQLx)
//!
//! ## Architecture
//!
//! - [`types`]: replica, dump, and finding domain types
//! - [`catalog`]: ports onto the catalog of record, plus adapters
//! - [`reconcile`] / [`recovery`] / [`execute`]: the decision engine
//! - [`runtime`] / [`batch`]: the shared daemon loop and batch source
//! - [`daemons`]: the necromancer and the auditor
//!
//! ## Examples
//!
//! ```
//! use vigil_core::rse::{RseFilter, RseInfo};
//!
//! let filter = RseFilter::parse("tier=2&disk!=slow")?;
//! let rse = RseInfo::new("SITE_A_DISK").with_attribute("tier", "2");
//! assert!(filter.matches(&rse));
//! # Ok::<(), vigil_core::error::VigilError>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Resumable, file-boundary-aligned batching over the bad-replica backlog
pub mod batch;

/// Catalog ports and their in-memory and Postgres adapters
pub mod catalog;

/// Daemon tuning knobs and the TOML settings file
pub mod config;

/// The necromancer and auditor daemons
pub mod daemons;

/// Dump parsing, discovery, and staging
pub mod dumps;

/// Error taxonomy shared across the engine
pub mod error;

/// Decision execution against the catalog and transfer ports
pub mod execute;

/// Sorted merge-join reconciliation of dump pairs
pub mod reconcile;

/// Per-replica recovery planning
pub mod recovery;

/// Storage element descriptors and selection expressions
pub mod rse;

/// The shared daemon loop: cycles, sleep, shutdown, fan-out
pub mod runtime;

/// Cycle counters
pub mod stats;

/// Transfer submission port
pub mod transfer;

/// Domain types: replicas, dumps, findings
pub mod types;

pub use error::{Result, VigilError};
pub use types::{
    BadReplica, Checksum, FileKey, Finding, FindingKind, ReplicaKey, ReplicaState,
    RseId,
};
