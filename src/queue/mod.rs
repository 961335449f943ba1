//! Analysis queue
//!
//! Hand-off to the downstream analyser. Two backends:
//! - `NatsQueue` publishes to NATS, by default through JetStream with an
//!   awaited ack so a successful publish is durable
//! - `MemoryQueue` records messages for dev mode and tests

use async_trait::async_trait;

use crate::types::Result;

pub mod memory;
pub mod messages;
pub mod nats;

pub use memory::MemoryQueue;
pub use messages::{
    AnalysedReportMessage, AnalysisPayload, RawReportMessage, ReportPayload, ANALYSED_SUBJECT,
    RAW_SUBJECT,
};
pub use nats::{NatsClient, NatsQueue};

/// Publisher for analysis messages
#[async_trait]
pub trait AnalysisQueue: Send + Sync {
    /// Queue a newly admitted (or re-submitted) report for analysis
    async fn publish_raw(&self, message: &RawReportMessage) -> Result<()>;

    /// Republish a promoted report with its analyses
    async fn publish_analysed(&self, message: &AnalysedReportMessage) -> Result<()>;

    /// Backend name for health output
    fn name(&self) -> &'static str;
}
