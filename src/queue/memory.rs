//! In-memory analysis queue
//!
//! Records every published message. Failure or a publish delay can be
//! switched on to exercise the partial-publish paths.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AnalysedReportMessage, AnalysisQueue, RawReportMessage};
use crate::types::{GatehouseError, Result};

#[derive(Default)]
pub struct MemoryQueue {
    raw: Mutex<Vec<RawReportMessage>>,
    analysed: Mutex<Vec<AnalysedReportMessage>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until switched off
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every publish for `delay` before it lands
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn raw_messages(&self) -> Vec<RawReportMessage> {
        self.raw.lock().await.clone()
    }

    pub async fn analysed_messages(&self) -> Vec<AnalysedReportMessage> {
        self.analysed.lock().await.clone()
    }

    async fn check(&self) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatehouseError::Queue("memory queue unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalysisQueue for MemoryQueue {
    async fn publish_raw(&self, message: &RawReportMessage) -> Result<()> {
        self.check().await?;
        debug!(seq = message.seq, "queued raw report");
        self.raw.lock().await.push(message.clone());
        Ok(())
    }

    async fn publish_analysed(&self, message: &AnalysedReportMessage) -> Result<()> {
        self.check().await?;
        debug!(seq = message.report.seq, "queued analysed report");
        self.analysed.lock().await.push(message.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TrustLevel, Visibility};

    fn message(seq: i64) -> RawReportMessage {
        RawReportMessage {
            seq,
            description: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            fetcher_id: "f".into(),
            source_id: format!("s{}", seq),
            visibility: Visibility::Shadow,
            trust_level: TrustLevel::Unverified,
        }
    }

    #[tokio::test]
    async fn test_records_and_fails_on_demand() {
        let queue = MemoryQueue::new();
        queue.publish_raw(&message(1)).await.unwrap();

        queue.set_failing(true);
        assert!(matches!(
            queue.publish_raw(&message(2)).await,
            Err(GatehouseError::Queue(_))
        ));

        queue.set_failing(false);
        queue.publish_raw(&message(3)).await.unwrap();

        let seqs: Vec<i64> = queue.raw_messages().await.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_delay_holds_publish() {
        let queue = MemoryQueue::new();
        queue.set_delay(Duration::from_millis(200));

        let held = tokio::time::timeout(Duration::from_millis(20), queue.publish_raw(&message(1))).await;
        assert!(held.is_err());
        assert!(queue.raw_messages().await.is_empty());

        queue.set_delay(Duration::ZERO);
        queue.publish_raw(&message(2)).await.unwrap();
        assert_eq!(queue.raw_messages().await.len(), 1);
    }
}
