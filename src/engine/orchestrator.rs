//! Update Orchestrator
//!
//! Turns a hardware inventory into update plans and drives each plan
//! through download, verification and installation. Transfers run with
//! bounded concurrency; installs go through the single install gate.

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::catalog::{is_warranted, CatalogResolver};
use super::config::UpdatePolicy;
use super::error::{EngineError, ErrorKind, Result};
use super::installer::InstallationEngine;
use super::locks::InstallGate;
use super::model::{CatalogListing, DeviceRecord, HardwareId, InstallationRecord, Outcome, UpdatePlan};
use super::updater::{
    plan_dir, ApprovedPackage, Downloader, Progress, RejectReason, Stage, Verdict, VerificationGate,
};

/// A device the resolver could not handle.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIssue {
    pub hardware_id: HardwareId,
    pub kind: ErrorKind,
    pub message: String,
}

/// Listings only offered for manual selection.
#[derive(Debug, Clone, Serialize)]
pub struct ManualCandidates {
    pub hardware_id: HardwareId,
    pub listings: Vec<CatalogListing>,
}

/// Result of planning, without side effects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanSet {
    pub plans: Vec<UpdatePlan>,
    pub up_to_date: Vec<DeviceRecord>,
    pub no_candidates: Vec<DeviceRecord>,
    pub manual: Vec<ManualCandidates>,
    /// Non-fatal resolver warnings, e.g. remote catalog unavailable
    pub warnings: Vec<String>,
    pub errors: Vec<DeviceIssue>,
    pub filtered_out: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: PlanSet,
    pub records: Vec<InstallationRecord>,
}

impl RunReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn needs_attention(&self) -> Vec<&InstallationRecord> {
        self.records.iter().filter(|r| r.needs_attention).collect()
    }
}

pub struct UpdateOrchestrator {
    resolver: CatalogResolver,
    downloader: Downloader,
    verifier: VerificationGate,
    engine: InstallationEngine,
    gate: InstallGate,
    download_root: PathBuf,
    progress: Progress,
}

impl UpdateOrchestrator {
    pub fn new(
        resolver: CatalogResolver,
        downloader: Downloader,
        verifier: VerificationGate,
        engine: InstallationEngine,
        gate: InstallGate,
        download_root: PathBuf,
    ) -> Self {
        Self {
            resolver,
            downloader,
            verifier,
            engine,
            gate,
            download_root,
            progress: Progress::silent(),
        }
    }

    /// Publish download/verify stage events; pair with `InstallationEngine::with_progress`.
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Resolve every device and decide which ones get an update.
    pub async fn plan(&self, devices: &[DeviceRecord], policy: &UpdatePolicy) -> PlanSet {
        let mut set = PlanSet::default();

        let selected: Vec<&DeviceRecord> = devices
            .iter()
            .filter(|device| match &policy.classes {
                Some(classes) => classes.contains(&device.class),
                None => true,
            })
            .collect();
        set.filtered_out = devices.len() - selected.len();

        let resolved: Vec<_> = stream::iter(selected)
            .map(|device| async move { (device, self.resolver.resolve(device).await) })
            .buffered(policy.max_parallel_transfers.max(1))
            .collect()
            .await;

        for (device, resolution) in resolved {
            let resolution = match resolution {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(device = %device.hardware_id, error = %e, "Could not resolve candidates");
                    set.errors.push(DeviceIssue {
                        hardware_id: device.hardware_id.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            set.warnings.extend(resolution.warnings.iter().map(|w| w.to_string()));
            if !resolution.manual.is_empty() {
                set.manual.push(ManualCandidates {
                    hardware_id: device.hardware_id.clone(),
                    listings: resolution.manual.clone(),
                });
            }

            match resolution.best() {
                Some(best) if is_warranted(device, best) => {
                    set.plans.push(UpdatePlan::new(device.clone(), best.clone()));
                }
                Some(_) => set.up_to_date.push(device.clone()),
                None => set.no_candidates.push(device.clone()),
            }
        }

        set.warnings.dedup();
        info!(
            plans = set.plans.len(),
            up_to_date = set.up_to_date.len(),
            no_candidates = set.no_candidates.len(),
            "Planning complete"
        );
        set
    }

    /// Plan, then download, verify and install every plan.
    ///
    /// At most `max_parallel_transfers` plans download or verify at once; a
    /// plan gives up its transfer slot before queueing at the install gate.
    /// Per-device failures never stop other devices. After cancellation no
    /// new install starts; an install already running finishes first.
    pub async fn run(&self, devices: &[DeviceRecord], policy: &UpdatePolicy, cancel: &CancellationToken) -> RunReport {
        let plan = self.plan(devices, policy).await;
        let transfers = Semaphore::new(policy.max_parallel_transfers.max(1));
        let dirs = download_dirs(&self.download_root, &plan.plans);

        let records: Vec<InstallationRecord> = join_all(
            plan.plans
                .iter()
                .zip(dirs)
                .map(|(p, dir)| self.drive(p, dir, policy, &transfers, cancel)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let report = RunReport { plan, records };
        info!(
            succeeded = report.count(Outcome::Succeeded),
            rolled_back = report.count(Outcome::RolledBack),
            failed = report.count(Outcome::Failed),
            needs_attention = report.needs_attention().len(),
            "Run complete"
        );
        report
    }

    async fn drive(
        &self,
        plan: &UpdatePlan,
        dir: PathBuf,
        policy: &UpdatePolicy,
        transfers: &Semaphore,
        cancel: &CancellationToken,
    ) -> Vec<InstallationRecord> {
        let package = {
            let _slot = tokio::select! {
                _ = cancel.cancelled() => None,
                slot = transfers.acquire() => slot.ok(),
            };
            if cancel.is_cancelled() {
                return vec![self.engine.record_failure(plan, &EngineError::Cancelled)];
            }
            match self.fetch_verified(plan, &dir, policy, cancel).await {
                Ok(package) => package,
                Err(e) => return vec![self.engine.record_failure(plan, &e)],
            }
        };

        let records = self.engine.execute(plan, package, &self.gate, cancel).await;
        let _ = std::fs::remove_dir_all(&dir);
        records
    }

    /// Download and verify, re-downloading once after a hash mismatch when
    /// the policy allows it.
    async fn fetch_verified(
        &self,
        plan: &UpdatePlan,
        dir: &Path,
        policy: &UpdatePolicy,
        cancel: &CancellationToken,
    ) -> Result<ApprovedPackage> {
        let mut downloads_left = if policy.redownload_on_hash_mismatch { 2 } else { 1 };

        loop {
            self.progress.emit(plan, Stage::Downloading);
            // Partial data stays on disk for the next run
            let download = self.downloader.fetch(&plan.entry, dir, cancel).await?;
            downloads_left -= 1;

            if cancel.is_cancelled() {
                let _ = std::fs::remove_file(&download.path);
                return Err(EngineError::Cancelled);
            }

            self.progress.emit(plan, Stage::Verifying);
            match self.verifier.verify_blocking(&download, &plan.entry).await? {
                Verdict::Approved(package) => return Ok(package),
                Verdict::Rejected(reason @ RejectReason::HashMismatch { .. }) if downloads_left > 0 => {
                    warn!(device = %plan.device.hardware_id, %reason, "Re-downloading after hash mismatch");
                }
                Verdict::Rejected(reason) => return Err(reason.into()),
            }
        }
    }
}

/// One download directory per plan. Devices the scan could not tell apart
/// get a numbered suffix.
fn download_dirs(root: &Path, plans: &[UpdatePlan]) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    plans
        .iter()
        .map(|p| {
            let base = plan_dir(root, &p.entry, &p.device);
            let mut dir = base.clone();
            let mut n = 1;
            while !taken.insert(dir.clone()) {
                n += 1;
                dir = PathBuf::from(format!("{}-{}", base.display(), n));
            }
            dir
        })
        .collect()
}
