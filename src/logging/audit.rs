//! Background audit writer

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::db::schemas::{IngestionAuditDoc, ModerationEventDoc};
use crate::store::Store;

enum AuditCommand {
    Moderation(ModerationEventDoc),
    Ingestion(IngestionAuditDoc),
    /// Replied to once every earlier command has been written
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit writer task
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditCommand>,
}

impl AuditLog {
    /// Start the writer task. `capacity` bounds the number of records
    /// waiting to be written; records beyond it are dropped with a warning.
    pub fn spawn(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditCommand>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    AuditCommand::Moderation(event) => {
                        let action = event.action.clone();
                        if let Err(e) = store.append_moderation_event(event).await {
                            error!(action = %action, "Failed to write moderation event: {}", e);
                        }
                    }
                    AuditCommand::Ingestion(line) => {
                        let endpoint = line.endpoint.clone();
                        if let Err(e) = store.append_ingestion_audit(line).await {
                            error!(endpoint = %endpoint, "Failed to write ingestion audit: {}", e);
                        }
                    }
                    AuditCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Audit writer stopped");
        });

        Self { tx }
    }

    /// Queue a moderation event
    pub fn record_moderation(&self, event: ModerationEventDoc) {
        if let Err(e) = self.tx.try_send(AuditCommand::Moderation(event)) {
            warn!("Dropped moderation event: {}", e);
        }
    }

    /// Queue an ingestion audit line
    pub fn record_ingestion(&self, line: IngestionAuditDoc) {
        if let Err(e) = self.tx.try_send(AuditCommand::Ingestion(line)) {
            warn!("Dropped ingestion audit line: {}", e);
        }
    }

    /// Wait until everything queued before this call has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::actions;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_records_are_written_in_order() {
        let store = Arc::new(MemoryStore::new());
        let audit = AuditLog::spawn(store.clone(), 16);

        audit.record_moderation(ModerationEventDoc::new(
            "ops",
            actions::FETCHER_SUSPEND,
            "fetcher",
            "f1",
        ));
        audit.record_ingestion(IngestionAuditDoc::new("/v1/reports:bulkIngest").with_outcome("ok", 200));
        audit.flush().await;

        let events = store.moderation_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, actions::FETCHER_SUSPEND);
        assert_eq!(store.ingestion_audits().await.len(), 1);
    }
}
