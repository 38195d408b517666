#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use skillbridge_engagements::{
    clock::ManualClock,
    config::{LifecyclePolicy, PaymentsConfig, SchedulerConfig},
    contracts::{ContractDetails, ContractTerms},
    engine::{Engine, EngineContext},
    models::{ContractStatus, MessageCard, PaymentStatus, Proposal, ProviderEventKind},
    payments::{
        provider::{PaymentError, PaymentIntent, PaymentProvider},
        webhooks::ProviderEvent,
    },
    store::{ChangeSet, EngagementStore, MemoryStore},
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap()
}

/// Provider double that hands out sequential intent ids.
#[derive(Default)]
pub struct FakeProvider {
    pub calls: Mutex<Vec<(Decimal, String, HashMap<String, String>)>>,
    pub fail: bool,
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        idempotency_key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PaymentIntent, PaymentError> {
        if self.fail {
            return Err(PaymentError::Network("connection refused".to_string()));
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push((amount, idempotency_key.to_string(), metadata.clone()));
        Ok(PaymentIntent {
            id: format!("pi_{}", calls.len()),
            client_secret: Some(format!("pi_{}_secret", calls.len())),
            amount,
            currency: currency.to_string(),
            status: "requires_payment_method".to_string(),
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<FakeProvider>,
    pub engine: Engine,
    pub student: Uuid,
    pub coach: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(FakeProvider::default())
    }

    pub fn with_provider(provider: FakeProvider) -> Self {
        Self::build(provider, SchedulerConfig::default())
    }

    pub fn with_scheduler(scheduler: SchedulerConfig) -> Self {
        Self::build(FakeProvider::default(), scheduler)
    }

    fn build(provider: FakeProvider, scheduler: SchedulerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let provider = Arc::new(provider);
        let context = EngineContext::new(store.clone(), clock.clone(), LifecyclePolicy::default());
        let payments = PaymentsConfig {
            stripe_secret_key: String::new(),
            webhook_secret: "whsec_test".to_string(),
            stripe_base_url: "http://localhost".to_string(),
            currency: "usd".to_string(),
        };
        let engine = Engine::new(context, provider.clone(), &payments, &scheduler);

        Self {
            store,
            clock,
            provider,
            engine,
            student: Uuid::new_v4(),
            coach: Uuid::new_v4(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.engine.context.now()
    }

    pub async fn seed_proposal(&self, sessions: u32, price: Decimal, minutes: u32) -> Proposal {
        let proposal = Proposal::per_session(Uuid::new_v4(), self.student, self.coach, sessions, price, minutes, self.now());
        let mut changes = ChangeSet::new();
        changes.insert_proposal(proposal.clone());
        self.store.commit(changes).await.unwrap();
        proposal
    }

    pub fn terms(&self) -> ContractTerms {
        ContractTerms {
            start_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            timezone: "UTC".to_string(),
            cancellation_policy: None,
            learning_outcomes: None,
        }
    }

    pub async fn accepted_contract(&self, sessions: u32, price: Decimal, minutes: u32) -> ContractDetails {
        let proposal = self.seed_proposal(sessions, price, minutes).await;
        self.engine
            .contracts
            .accept_proposal(proposal.id, self.student, self.terms())
            .await
            .unwrap()
    }

    /// Accepted by the coach and paid through a provider callback.
    pub async fn active_contract(&self, sessions: u32, price: Decimal, minutes: u32) -> ContractDetails {
        let details = self.accepted_contract(sessions, price, minutes).await;
        let contract_id = details.contract.id;
        self.engine
            .contracts
            .respond_to_offer(contract_id, self.coach, true)
            .await
            .unwrap();
        let intent = self
            .engine
            .payments
            .create_payment_intent(contract_id, self.student)
            .await
            .unwrap();
        self.engine
            .payments
            .apply_provider_event(&self.event("evt_paid", ProviderEventKind::IntentSucceeded, &intent.intent_id))
            .await
            .unwrap();

        let details = self.engine.contracts.details(contract_id, self.student).await.unwrap();
        assert_eq!(details.contract.status, ContractStatus::Active);
        assert_eq!(details.contract.payment_status, PaymentStatus::Paid);
        details
    }

    pub fn event(&self, id: &str, kind: ProviderEventKind, intent_id: &str) -> ProviderEvent {
        ProviderEvent {
            id: id.to_string(),
            kind,
            intent_id: intent_id.to_string(),
            created: self.now(),
            amount: None,
            contract_id: None,
            payment_record_id: None,
        }
    }

    /// Every card for `user`, oldest first.
    pub async fn messages_for(&self, user: Uuid) -> Vec<MessageCard> {
        let mut cards = self.store.messages_for(user, None, 1000).await.unwrap();
        cards.reverse();
        cards
    }
}
