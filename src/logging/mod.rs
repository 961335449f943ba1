//! Audit logging for Gatehouse
//!
//! Moderation events and ingestion audit lines are written through a
//! bounded background queue so a slow or failing store never delays or
//! fails the request that produced them.

pub mod audit;

pub use audit::AuditLog;
