//! Hourly cleanup of state that only exists for duplicate detection.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};
use transactional_outbox::OutboxRepository;

use crate::commands::cooldown::CooldownTracker;
use crate::store::SharedStore;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub outbox_rows: u64,
    pub inbox_claims: u64,
}

pub struct Janitor {
    outbox: Arc<dyn OutboxRepository>,
    store: SharedStore,
    cooldowns: Arc<CooldownTracker>,
    retention: Duration,
    cooldown_ttl: Duration,
}

impl Janitor {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        store: SharedStore,
        cooldowns: Arc<CooldownTracker>,
        retention: Duration,
        cooldown_ttl: Duration,
    ) -> Self {
        Self {
            outbox,
            store,
            cooldowns,
            retention,
            cooldown_ttl,
        }
    }

    /// Purge published outbox rows and inbox claims past the retention window.
    /// A failing step is logged and does not stop the others.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(2));
        match self.outbox.purge_published(Utc::now() - retention).await {
            Ok(n) => report.outbox_rows = n,
            Err(e) => error!(error = %e, "Failed to purge published outbox rows"),
        }

        match self.store.purge_expired_claims().await {
            Ok(n) => report.inbox_claims = n,
            Err(e) => error!(error = %e, "Failed to purge inbox claims"),
        }

        self.cooldowns.prune(self.cooldown_ttl);

        info!(
            outbox_rows = report.outbox_rows,
            inbox_claims = report.inbox_claims,
            "Janitor sweep finished"
        );
        report
    }

    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}
