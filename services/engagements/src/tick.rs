use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as WallDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use skillbridge_common::AppError;

use crate::clock::{Sweep, TickTask};
use crate::config::SchedulerConfig;
use crate::engine::EngineContext;
use crate::models::{ContractStatus, SessionStatus};
use crate::progress::ProgressAggregator;
use crate::reschedule::RescheduleGovernor;
use crate::sessions::SessionService;
use crate::store::SessionScan;

const BOOKED: [SessionStatus; 2] = [SessionStatus::Scheduled, SessionStatus::Confirmed];

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub sweep: Sweep,
    pub scanned: usize,
    pub changed: usize,
    pub failed: usize,
    /// False when the sweep stopped on a row or time limit; the next tick resumes it.
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub task: TickTask,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sweeps: Vec<SweepReport>,
    pub budget_exhausted: bool,
}

/// Runs tick sweeps. Every row is committed on its own, so a failing row is
/// logged and skipped without holding up the batch.
#[derive(Clone)]
pub struct Scheduler {
    ctx: EngineContext,
    sessions: SessionService,
    reschedules: RescheduleGovernor,
    progress: ProgressAggregator,
    config: SchedulerConfig,
    cursors: Arc<Mutex<HashMap<Sweep, Uuid>>>,
}

impl Scheduler {
    pub fn new(
        ctx: EngineContext,
        sessions: SessionService,
        reschedules: RescheduleGovernor,
        progress: ProgressAggregator,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            sessions,
            reschedules,
            progress,
            config,
            cursors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cursor(&self, sweep: Sweep) -> Option<Uuid> {
        match self.cursors.lock() {
            Ok(cursors) => cursors.get(&sweep).copied(),
            Err(poisoned) => poisoned.into_inner().get(&sweep).copied(),
        }
    }

    fn set_cursor(&self, sweep: Sweep, cursor: Option<Uuid>) {
        let mut cursors = match self.cursors.lock() {
            Ok(cursors) => cursors,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cursor {
            Some(id) => cursors.insert(sweep, id),
            None => cursors.remove(&sweep),
        };
    }

    pub async fn run(&self, task: TickTask) -> Result<TickReport, AppError> {
        let started_at = self.ctx.now();
        let deadline = Instant::now() + WallDuration::from_secs(self.config.budget_seconds);
        tracing::info!(task = task.as_str(), "Scheduler tick started");

        let mut sweeps = Vec::with_capacity(task.sweeps().len());
        let mut budget_exhausted = false;
        for &sweep in task.sweeps() {
            if Instant::now() >= deadline {
                budget_exhausted = true;
                tracing::warn!(sweep = sweep.as_str(), "Tick budget exhausted before sweep");
                break;
            }
            let report = self.run_sweep(sweep, deadline).await?;
            tracing::info!(
                sweep = sweep.as_str(),
                scanned = report.scanned,
                changed = report.changed,
                failed = report.failed,
                complete = report.complete,
                "Sweep finished"
            );
            sweeps.push(report);
        }

        let report = TickReport {
            task,
            started_at,
            finished_at: self.ctx.now(),
            budget_exhausted: budget_exhausted || sweeps.iter().any(|sweep| !sweep.complete),
            sweeps,
        };
        tracing::info!(
            task = task.as_str(),
            changed = report.sweeps.iter().map(|sweep| sweep.changed).sum::<usize>(),
            failed = report.sweeps.iter().map(|sweep| sweep.failed).sum::<usize>(),
            "Scheduler tick finished"
        );
        Ok(report)
    }

    fn scan_for(&self, sweep: Sweep, now: DateTime<Utc>) -> SessionScan {
        let base = SessionScan {
            limit: self.config.batch_size.max(1),
            ..SessionScan::default()
        };
        match sweep {
            Sweep::MarkReady | Sweep::AutoActivate => SessionScan {
                statuses: BOOKED.to_vec(),
                scheduled_from: Some(now - Duration::days(1)),
                scheduled_before: Some(now + Duration::days(1)),
                ..base
            },
            Sweep::AutoComplete => SessionScan {
                statuses: vec![SessionStatus::Active],
                ..base
            },
            Sweep::AutoMiss => SessionScan {
                statuses: BOOKED.to_vec(),
                scheduled_before: Some(now),
                ..base
            },
            Sweep::Reminders => SessionScan {
                statuses: BOOKED.to_vec(),
                scheduled_from: Some(now),
                scheduled_before: Some(now + Duration::hours(24) + Duration::seconds(1)),
                ..base
            },
            Sweep::RescheduleExpiry => SessionScan {
                statuses: BOOKED.to_vec(),
                reschedule_pending: true,
                ..base
            },
            Sweep::Cleanup => SessionScan {
                scheduled_before: Some(now - Duration::days(self.config.retention_days)),
                flagged: true,
                ..base
            },
            // Contract sweep; never scans sessions.
            Sweep::Progress => base,
        }
    }

    async fn apply(&self, sweep: Sweep, id: Uuid) -> Result<bool, AppError> {
        match sweep {
            Sweep::MarkReady => self.sessions.mark_ready_if_due(id).await,
            Sweep::AutoActivate => self.sessions.activate_if_due(id).await,
            Sweep::AutoComplete => self.sessions.complete_if_due(id).await,
            Sweep::AutoMiss => self.sessions.miss_if_due(id).await,
            Sweep::Reminders => self.sessions.send_reminder_if_due(id).await,
            Sweep::RescheduleExpiry => self.reschedules.expire_if_due(id).await,
            Sweep::Cleanup => {
                self.sessions
                    .clear_flags_if_stale(id, Duration::days(self.config.retention_days))
                    .await
            }
            Sweep::Progress => self.progress.refresh(id).await.map(|change| !change.is_noop()),
        }
    }

    async fn page(&self, sweep: Sweep, after: Option<Uuid>) -> Result<Vec<Uuid>, AppError> {
        if sweep == Sweep::Progress {
            let contracts = self
                .ctx
                .store
                .scan_contracts(&[ContractStatus::Active], after, self.config.batch_size.max(1))
                .await?;
            return Ok(contracts.into_iter().map(|contract| contract.id).collect());
        }

        let scan = SessionScan {
            after,
            ..self.scan_for(sweep, self.ctx.now())
        };
        let sessions = self.ctx.store.scan_sessions(&scan).await?;
        Ok(sessions.into_iter().map(|session| session.id).collect())
    }

    async fn run_sweep(&self, sweep: Sweep, deadline: Instant) -> Result<SweepReport, AppError> {
        let batch_size = self.config.batch_size.max(1);
        let mut report = SweepReport {
            sweep,
            scanned: 0,
            changed: 0,
            failed: 0,
            complete: true,
        };
        let mut cursor = self.cursor(sweep);

        loop {
            let ids = self.page(sweep, cursor).await?;
            let exhausted = ids.len() < batch_size;

            for id in ids {
                if report.scanned >= self.config.max_rows_per_sweep || Instant::now() >= deadline {
                    report.complete = false;
                    self.set_cursor(sweep, cursor);
                    return Ok(report);
                }

                report.scanned += 1;
                match self.apply(sweep, id).await {
                    Ok(true) => report.changed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        report.failed += 1;
                        tracing::warn!(sweep = sweep.as_str(), id = %id, error = %err, "Sweep row failed");
                    }
                }
                cursor = Some(id);
            }

            if exhausted {
                self.set_cursor(sweep, None);
                return Ok(report);
            }
        }
    }
}
