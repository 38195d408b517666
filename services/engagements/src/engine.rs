use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use skillbridge_common::AppError;

use crate::clock::SharedClock;
use crate::config::{LifecyclePolicy, PaymentsConfig, SchedulerConfig};
use crate::contracts::ContractService;
use crate::meeting_links::MeetingLinkDispatcher;
use crate::messages::MessageOutbox;
use crate::payments::{provider::PaymentProvider, PaymentCoordinator};
use crate::progress::ProgressAggregator;
use crate::reschedule::RescheduleGovernor;
use crate::sessions::SessionService;
use crate::store::{retry_on_conflict, EngagementStore};
use crate::tick::Scheduler;

/// Shared handles every lifecycle service works through.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn EngagementStore>,
    pub clock: SharedClock,
    pub outbox: MessageOutbox,
    pub policy: LifecyclePolicy,
}

impl EngineContext {
    pub fn new(store: Arc<dyn EngagementStore>, clock: SharedClock, policy: LifecyclePolicy) -> Self {
        Self {
            outbox: MessageOutbox::new(store.clone()),
            store,
            clock,
            policy,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.utc()
    }

    pub async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        retry_on_conflict(self.policy.max_conflict_retries, operation).await
    }
}

#[derive(Clone)]
pub struct Engine {
    pub context: EngineContext,
    pub contracts: ContractService,
    pub payments: PaymentCoordinator,
    pub sessions: SessionService,
    pub reschedules: RescheduleGovernor,
    pub progress: ProgressAggregator,
    pub meeting_links: MeetingLinkDispatcher,
    pub scheduler: Scheduler,
}

impl Engine {
    pub fn new(
        context: EngineContext,
        provider: Arc<dyn PaymentProvider>,
        payments: &PaymentsConfig,
        scheduler: &SchedulerConfig,
    ) -> Self {
        let progress = ProgressAggregator::new(context.clone());
        let sessions = SessionService::new(context.clone());
        let reschedules = RescheduleGovernor::new(context.clone());

        Self {
            contracts: ContractService::new(context.clone()),
            payments: PaymentCoordinator::new(context.clone(), provider, payments.currency.clone()),
            meeting_links: MeetingLinkDispatcher::new(context.clone()),
            scheduler: Scheduler::new(
                context.clone(),
                sessions.clone(),
                reschedules.clone(),
                progress.clone(),
                scheduler.clone(),
            ),
            sessions,
            reschedules,
            progress,
            context,
        }
    }
}
