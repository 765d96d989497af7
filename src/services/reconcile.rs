//! Background reconciliation.
//!
//! Each sweep retries queued reference releases, finishes deletes and writes
//! whose claimant went away, compares reference counts and usage against the
//! file records, and removes blobs that no content row points at.
//!
//! Counter drift is only repaired when enabled, and only once the same drift
//! has been seen on two consecutive sweeps, so in-flight uploads and deletes
//! are never "corrected".

use crate::{
    config::ReconcileConfig,
    db::{FileRecordRepository, UsageRepository, now_millis},
    errors::{VaultError, VaultResult},
    models::{ContentHash, ContentState},
    services::{
        ledger::{ContentLedger, ReleaseOutcome},
        vault::VaultService,
        with_timeout,
    },
    storage::StorageBackend,
};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub releases_retried: usize,
    pub releases_failed: usize,
    pub deletes_completed: usize,
    pub writes_recovered: usize,
    pub refcount_drift: usize,
    pub refcount_repaired: usize,
    pub usage_drift: usize,
    pub usage_repaired: usize,
    pub dangling_references: usize,
    pub orphans_deleted: usize,
    pub temp_files_removed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.releases_failed == 0
            && self.refcount_drift == 0
            && self.usage_drift == 0
            && self.dangling_references == 0
    }
}

/// (stored, actual) pairs seen on the previous sweep.
#[derive(Default)]
struct DriftMemory {
    refcounts: HashMap<ContentHash, (i64, i64)>,
    usage: HashMap<String, (i64, i64)>,
}

pub struct Reconciler {
    ledger: ContentLedger,
    files: Arc<dyn FileRecordRepository>,
    usage: Arc<dyn UsageRepository>,
    backend: Arc<dyn StorageBackend>,
    config: ReconcileConfig,
    storage_timeout: Duration,
    previous: Mutex<DriftMemory>,
}

impl Reconciler {
    pub fn new(vault: &VaultService, config: ReconcileConfig, storage_timeout: Duration) -> Self {
        Self {
            ledger: vault.ledger().clone(),
            files: vault.files().clone(),
            usage: vault.quota().repository().clone(),
            backend: vault.backend().clone(),
            config,
            storage_timeout,
            previous: Mutex::new(DriftMemory::default()),
        }
    }

    pub async fn run_once(&self) -> VaultResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.retry_releases(&mut report).await?;
        self.sweep_content(&mut report).await?;
        self.check_refcounts(&mut report).await?;
        self.check_usage(&mut report).await?;
        self.sweep_orphans(&mut report).await?;
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.interval, repair = self.config.repair_drift, "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.is_clean() => debug!(?report, "reconcile sweep finished"),
                        Ok(report) => warn!(?report, "reconcile sweep found inconsistencies"),
                        Err(err) => error!(error = %err, "reconcile sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciler stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn retry_releases(&self, report: &mut ReconcileReport) -> VaultResult<()> {
        let repo = self.ledger.repository();
        for pending in repo.pending_releases(self.config.batch_size).await? {
            match self.ledger.release(&pending.content_hash).await {
                Ok(outcome) => {
                    info!(
                        hash = %pending.content_hash,
                        reason = %pending.reason,
                        attempts = pending.attempts + 1,
                        outcome = ?outcome,
                        "queued release applied"
                    );
                    repo.complete_pending_release(pending.id).await?;
                    report.releases_retried += 1;
                }
                Err(err @ VaultError::ReferenceIntegrity { .. }) => {
                    error!(
                        hash = %pending.content_hash,
                        error = %err,
                        "queued release no longer applies, dropping it"
                    );
                    repo.complete_pending_release(pending.id).await?;
                    report.releases_failed += 1;
                }
                Err(err) => {
                    warn!(hash = %pending.content_hash, error = %err, "queued release failed again");
                    repo.fail_pending_release(pending.id, &err.to_string())
                        .await?;
                    report.releases_failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Finish unreferenced rows and writes whose claim expired.
    async fn sweep_content(&self, report: &mut ReconcileReport) -> VaultResult<()> {
        let now = now_millis();
        for record in self.ledger.repository().list_all().await? {
            if record.has_live_claim(now) {
                continue;
            }
            if record.reference_count == 0 {
                if let Some(ReleaseOutcome::Deleted) =
                    self.ledger.collect_unreferenced(&record.content_hash).await
                {
                    report.deletes_completed += 1;
                }
            } else if record.state != ContentState::Present
                && self.ledger.recover_abandoned_write(&record).await?
            {
                report.writes_recovered += 1;
            }
        }
        Ok(())
    }

    async fn check_refcounts(&self, report: &mut ReconcileReport) -> VaultResult<()> {
        let actual: HashMap<ContentHash, i64> =
            self.files.reference_counts().await?.into_iter().collect();
        let records = self.ledger.repository().list_all().await?;
        let known: HashSet<&ContentHash> = records.iter().map(|r| &r.content_hash).collect();

        for hash in actual.keys().filter(|h| !known.contains(h)) {
            error!(hash = %hash, files = actual[hash], "file records reference content with no ledger row");
            report.dangling_references += 1;
        }

        let mut drifted = HashMap::new();
        for record in &records {
            let expected = actual.get(&record.content_hash).copied().unwrap_or(0);
            if record.reference_count == expected {
                continue;
            }
            report.refcount_drift += 1;
            warn!(
                hash = %record.content_hash,
                stored = record.reference_count,
                actual = expected,
                "reference count drift"
            );
            drifted.insert(
                record.content_hash.clone(),
                (record.reference_count, expected),
            );
        }

        let confirmed: Vec<(ContentHash, (i64, i64))> = {
            let mut previous = self.lock_previous();
            let confirmed = drifted
                .iter()
                .filter(|(hash, seen)| previous.refcounts.get(*hash) == Some(*seen))
                .map(|(hash, seen)| (hash.clone(), *seen))
                .collect();
            previous.refcounts = drifted;
            confirmed
        };
        if !self.config.repair_drift {
            return Ok(());
        }

        for (hash, (stored, expected)) in confirmed {
            if self
                .ledger
                .repository()
                .set_reference_count(&hash, stored, expected)
                .await?
            {
                warn!(hash = %hash, from = stored, to = expected, "reference count repaired");
                report.refcount_repaired += 1;
                if expected == 0 {
                    self.ledger.collect_unreferenced(&hash).await;
                }
            }
        }
        Ok(())
    }

    async fn check_usage(&self, report: &mut ReconcileReport) -> VaultResult<()> {
        let actual: HashMap<String, i64> = self.files.usage_by_owner().await?.into_iter().collect();
        let rows = self.usage.list_all().await?;

        let mut drifted = HashMap::new();
        for row in &rows {
            let expected = actual.get(&row.owner_id).copied().unwrap_or(0);
            if row.used_bytes == expected {
                continue;
            }
            report.usage_drift += 1;
            warn!(
                owner_id = %row.owner_id,
                stored = row.used_bytes,
                actual = expected,
                "usage drift"
            );
            drifted.insert(row.owner_id.clone(), (row.used_bytes, expected));
        }

        let confirmed: Vec<(String, (i64, i64))> = {
            let mut previous = self.lock_previous();
            let confirmed = drifted
                .iter()
                .filter(|(owner, seen)| previous.usage.get(*owner) == Some(*seen))
                .map(|(owner, seen)| (owner.clone(), *seen))
                .collect();
            previous.usage = drifted;
            confirmed
        };
        if !self.config.repair_drift {
            return Ok(());
        }

        for (owner_id, (stored, expected)) in confirmed {
            if self.usage.set_used(&owner_id, stored, expected).await? {
                warn!(owner_id = %owner_id, from = stored, to = expected, "usage repaired");
                report.usage_repaired += 1;
            }
        }
        Ok(())
    }

    /// Delete blobs no content row points at, once older than the grace period.
    async fn sweep_orphans(&self, report: &mut ReconcileReport) -> VaultResult<()> {
        let blobs = with_timeout(self.storage_timeout, "list", "", self.backend.list("")).await?;
        let known: HashSet<String> = self
            .ledger
            .repository()
            .list_all()
            .await?
            .into_iter()
            .map(|r| r.storage_path)
            .collect();
        let Some(cutoff) = chrono::Duration::from_std(self.config.orphan_grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return Ok(());
        };

        match with_timeout(
            self.storage_timeout,
            "purge",
            "",
            self.backend.purge_stale_temp(cutoff),
        )
        .await
        {
            Ok(0) => {}
            Ok(removed) => {
                info!(removed, "stale temp files removed");
                report.temp_files_removed += removed;
            }
            Err(err) => warn!(error = %err, "failed to purge stale temp files"),
        }

        for blob in blobs {
            if known.contains(&blob.path) {
                continue;
            }
            match blob.modified_at {
                Some(modified) if modified <= cutoff => {}
                _ => {
                    debug!(path = %blob.path, "unreferenced blob inside grace period");
                    continue;
                }
            }
            match with_timeout(
                self.storage_timeout,
                "delete",
                &blob.path,
                self.backend.delete(&blob.path),
            )
            .await
            {
                Ok(()) => {
                    info!(path = %blob.path, bytes = blob.size, "orphaned blob deleted");
                    report.orphans_deleted += 1;
                }
                Err(err) => warn!(path = %blob.path, error = %err, "failed to delete orphaned blob"),
            }
        }
        Ok(())
    }

    fn lock_previous(&self) -> std::sync::MutexGuard<'_, DriftMemory> {
        self.previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
