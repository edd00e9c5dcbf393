#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billflow billing module
//!
//! The asynchronous payment and notification pipeline behind the HTTP API
//! and the worker:
//!
//! - **Webhook ingestion**: verify, persist, deduplicate, enqueue
//! - **Payment events**: reconcile processor transactions into payments and
//!   subscription cycles
//! - **Charges**: manual checkout links and auto-debits, idempotent per cycle
//! - **Notifications**: scheduled reminders with dispatch-time guards,
//!   delivered through Chatwoot
//! - **Metering**: per-tenant usage counters with overage billing
//! - **Credentials**: encrypted provider secrets with per-environment
//!   resolution

pub mod charges;
pub mod chatwoot;
pub mod client;
pub mod credentials;
pub mod email;
pub mod error;
pub mod jobs;
pub mod metering;
pub mod notifications;
pub mod payments;
pub mod period;
pub mod processor_events;
pub mod reference;
pub mod segments;
pub mod signature;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Charges
pub use charges::{AutoDebitOutcome, ChargeService, PaymentLinkResult};

// Chatwoot
pub use chatwoot::{ChatwootClient, ChatwootConfig};

// Client
pub use client::{
    integrity_signature, CreatePaymentLink, CreateTransaction, PaymentLink, ProcessorClient,
    ProcessorTransaction, PROVIDER,
};

// Credentials
pub use credentials::{CredentialStore, Environment, RuntimeConfig};

// Email
pub use email::{ReportMailer, SmtpConfig};

// Error
pub use error::{BillingError, BillingResult};

// Jobs
pub use jobs::{retry_delay, JobQueue, JobRecord, DEFAULT_MAX_ATTEMPTS};

// Metering
pub use metering::{MeteringService, PeriodType, PlanLimit, UsageResult};

// Notifications
pub use notifications::{
    reminder_guard, render_template, ChatwootMessageRecord, DispatchOutcome,
    NotificationScheduler, ReminderPayload, ReminderRule, Trigger,
};

// Payments
pub use payments::{subscription_cycle_key, PaymentRecord, PaymentStore};

// Processor events
pub use processor_events::{ForwardTarget, PaymentEventProcessor, ProcessOutcome};

// Reference
pub use reference::{subscription_reference, PaymentReference};

// Segments
pub use segments::SegmentRule;

// Subscriptions
pub use subscriptions::{
    BillingContext, CustomerRecord, PlanRecord, SubscriptionRecord, SubscriptionService,
};

// Webhooks
pub use webhooks::{InboundEvent, IngestOutcome, WebhookEventRecord, WebhookIngestion};

use sqlx::PgPool;

/// Main billing service that combines the whole pipeline
pub struct BillingService {
    pub jobs: JobQueue,
    pub webhooks: WebhookIngestion,
    pub processor_events: PaymentEventProcessor,
    pub charges: ChargeService,
    pub notifications: NotificationScheduler,
    pub payments: PaymentStore,
    pub subscriptions: SubscriptionService,
    pub metering: MeteringService,
    pub credentials: CredentialStore,
    pub client: ProcessorClient,
    pub chatwoot: Option<ChatwootClient>,
    pub mailer: Option<ReportMailer>,
}

impl BillingService {
    /// Build the full pipeline from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let base_url = std::env::var("PROCESSOR_BASE_URL").map_err(|_| {
            BillingError::Configuration("PROCESSOR_BASE_URL not set".into())
        })?;

        let credentials = CredentialStore::new(pool.clone());
        let config = RuntimeConfig::new(credentials.clone(), Environment::from_env());
        let client = ProcessorClient::new(base_url, config);

        let jobs = JobQueue::new(pool.clone());
        let payments = PaymentStore::new(pool.clone());
        let subscriptions = SubscriptionService::new(pool.clone());
        let notifications = NotificationScheduler::new(
            pool.clone(),
            jobs.clone(),
            payments.clone(),
            subscriptions.clone(),
        );
        let chatwoot = ChatwootConfig::from_env().map(|c| ChatwootClient::new(c, pool.clone()));
        let charges = ChargeService::new(
            payments.clone(),
            subscriptions.clone(),
            client.clone(),
            notifications.clone(),
            chatwoot.clone(),
        );
        let processor_events = PaymentEventProcessor::new(
            pool.clone(),
            payments.clone(),
            subscriptions.clone(),
            notifications.clone(),
            jobs.clone(),
            ForwardTarget::from_env(),
        );

        Ok(Self {
            webhooks: WebhookIngestion::new(pool.clone(), jobs.clone()),
            jobs,
            processor_events,
            charges,
            notifications,
            payments,
            subscriptions,
            metering: MeteringService::new(pool),
            credentials,
            client,
            chatwoot,
            mailer: SmtpConfig::from_env().map(ReportMailer::new),
        })
    }
}
