//! Periodic analytics snapshots.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{StoreError, TicketStats};

/// Dashboard counters frozen at `recorded_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    #[serde(flatten)]
    pub stats: TicketStats,
    /// `verified_payments` times the configured ticket price.
    pub total_revenue: u64,
    pub recorded_at: DateTime<Utc>,
}

impl AnalyticsSnapshot {
    pub fn capture(stats: TicketStats, ticket_price: u64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            stats,
            total_revenue: stats.verified_payments.saturating_mul(ticket_price),
            recorded_at,
        }
    }
}

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn save(&self, snapshot: &AnalyticsSnapshot) -> Result<(), StoreError>;

    /// The snapshot with the greatest `recorded_at`, if any was saved.
    async fn latest(&self) -> Result<Option<AnalyticsSnapshot>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAnalyticsStore {
    snapshots: Mutex<Vec<AnalyticsSnapshot>>,
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn save(&self, snapshot: &AnalyticsSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        snapshots.push(*snapshot);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<AnalyticsSnapshot>, StoreError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(snapshots.iter().max_by_key(|s| s.recorded_at).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(verified: u64) -> TicketStats {
        TicketStats {
            total_tickets: verified + 1,
            stage2: verified,
            verified_payments: verified,
            given_tickets: 0,
            entries_marked: 0,
        }
    }

    #[test]
    fn revenue_is_verified_payments_times_price() {
        let at = Utc::now();
        assert_eq!(AnalyticsSnapshot::capture(stats(3), 250, at).total_revenue, 750);
        assert_eq!(AnalyticsSnapshot::capture(stats(3), 0, at).total_revenue, 0);
    }

    #[tokio::test]
    async fn latest_is_by_timestamp_not_insertion() {
        let store = InMemoryAnalyticsStore::new();
        assert_eq!(store.latest().await.unwrap(), None);

        let newer = AnalyticsSnapshot::capture(
            stats(2),
            10,
            DateTime::from_timestamp(1_700_000_100, 0).unwrap(),
        );
        let older = AnalyticsSnapshot::capture(
            stats(1),
            10,
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );
        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().await.unwrap(), Some(newer));
    }

    #[test]
    fn snapshot_serializes_flat() {
        let snapshot = AnalyticsSnapshot::capture(stats(1), 100, Utc::now());
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["verified_payments"], 1);
        assert_eq!(json["total_revenue"], 100);
        assert!(json.get("stats").is_none());
    }
}
