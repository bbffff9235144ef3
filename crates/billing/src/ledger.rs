//! Deduplication ledger
//!
//! Append-only record of every event id that has been claimed. The read check
//! filters replays cheaply; the uniqueness-constrained insert is what actually
//! decides which concurrent delivery wins.

use std::sync::Arc;

use crate::error::BillingResult;
use crate::store::{EventLedgerStore, InsertOutcome, NewProcessedEvent, ProcessedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery owns the event
    Claimed,
    /// A previous or concurrent delivery already recorded it
    AlreadyProcessed,
}

#[derive(Clone)]
pub struct DedupLedger {
    store: Arc<dyn EventLedgerStore>,
}

impl DedupLedger {
    pub fn new(store: Arc<dyn EventLedgerStore>) -> Self {
        Self { store }
    }

    /// Read check. `Claimed` here only means nothing is recorded yet.
    pub async fn try_claim(&self, event_id: &str) -> BillingResult<ClaimOutcome> {
        if self.store.event_exists(event_id).await? {
            tracing::debug!(event_id = %event_id, "Event already in ledger");
            return Ok(ClaimOutcome::AlreadyProcessed);
        }
        Ok(ClaimOutcome::Claimed)
    }

    /// Write the audit row. Losing the uniqueness race reports `AlreadyProcessed`.
    pub async fn record(&self, event: NewProcessedEvent) -> BillingResult<ClaimOutcome> {
        match self.store.insert_event(&event).await? {
            InsertOutcome::Inserted => {
                tracing::debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    user_id = ?event.user_id,
                    "Event recorded in ledger"
                );
                Ok(ClaimOutcome::Claimed)
            }
            InsertOutcome::Duplicate => {
                tracing::info!(
                    event_id = %event.event_id,
                    "Concurrent delivery recorded the event first"
                );
                Ok(ClaimOutcome::AlreadyProcessed)
            }
        }
    }

    pub async fn get(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        self.store.get_event(event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBillingStore;

    fn row(event_id: &str) -> NewProcessedEvent {
        NewProcessedEvent {
            event_id: event_id.to_string(),
            event_type: "invoice.paid".to_string(),
            user_id: Some("u_1".to_string()),
            payment_type: Some("invoice".to_string()),
            amount_cents: Some(1200),
            currency: Some("usd".to_string()),
            raw_payload: serde_json::json!({ "id": event_id }),
        }
    }

    #[tokio::test]
    async fn test_fresh_event_is_claimable() {
        let ledger = DedupLedger::new(Arc::new(InMemoryBillingStore::new()));
        assert_eq!(ledger.try_claim("evt_1").await.unwrap(), ClaimOutcome::Claimed);
        assert!(ledger.get("evt_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_then_duplicate() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ledger = DedupLedger::new(store.clone());

        assert_eq!(ledger.record(row("evt_1")).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            ledger.try_claim("evt_1").await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
        assert_eq!(
            ledger.record(row("evt_1")).await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
        assert_eq!(store.event_count().await, 1);

        let stored = ledger.get("evt_1").await.unwrap().unwrap();
        assert_eq!(stored.user_id.as_deref(), Some("u_1"));
        assert_eq!(stored.amount_cents, Some(1200));
    }

    #[tokio::test]
    async fn test_concurrent_records_single_winner() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ledger = DedupLedger::new(store.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.record(row("evt_race")).await }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == ClaimOutcome::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(store.event_count().await, 1);
    }
}
