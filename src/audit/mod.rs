//! Tamper-evident audit trail and anomaly detection
//!
//! - [`entry`] - Audit record shape and SHA-256 checksum sealing
//! - [`trail`] - Emission to a pluggable sink, best-effort and detachable
//! - [`anomaly`] - Heuristic rules run after each audited transaction

pub mod anomaly;
pub mod entry;
pub mod trail;

pub use anomaly::{Anomaly, AnomalyDetector};
pub use entry::{ActorType, AuditAction, AuditEntry, AuditError};
pub use trail::{AuditSink, AuditTrail, TracingSink};
