//! Subscription charging: manual checkout links and automatic debits.
//!
//! Both entry points are idempotent per billing cycle. The cycle key pins
//! each cycle to a single payment row, an existing checkout link is returned
//! unchanged, and an existing processor transaction short-circuits the
//! auto-debit. One cycle therefore never produces two processor resources.

use uuid::Uuid;

use billflow_shared::types::{ExtensionMap, PaymentStatus};

use crate::chatwoot::ChatwootClient;
use crate::client::{CreatePaymentLink, CreateTransaction, ProcessorClient};
use crate::error::{BillingError, BillingResult};
use crate::notifications::{NotificationScheduler, Trigger};
use crate::payments::{PaymentRecord, PaymentStore};
use crate::reference::subscription_reference;
use crate::subscriptions::{BillingContext, SubscriptionService};

mod attempt {
    pub const MANUAL_LINK: &str = "manual_link";
    pub const AUTO_DEBIT: &str = "auto_debit";
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
    pub const SKIPPED: &str = "skipped";
}

/// Result of a manual-link request.
#[derive(Debug, Clone)]
pub struct PaymentLinkResult {
    pub payment_id: Uuid,
    pub link_id: String,
    pub checkout_url: String,
    pub cycle: i32,
    pub reused: bool,
}

/// Result of an auto-debit attempt.
#[derive(Debug, Clone)]
pub enum AutoDebitOutcome {
    Charged {
        transaction_id: String,
        status: PaymentStatus,
    },
    AlreadyCharged {
        transaction_id: String,
    },
}

#[derive(Clone)]
pub struct ChargeService {
    payments: PaymentStore,
    subscriptions: SubscriptionService,
    client: ProcessorClient,
    scheduler: NotificationScheduler,
    chatwoot: Option<ChatwootClient>,
}

impl ChargeService {
    pub fn new(
        payments: PaymentStore,
        subscriptions: SubscriptionService,
        client: ProcessorClient,
        scheduler: NotificationScheduler,
        chatwoot: Option<ChatwootClient>,
    ) -> Self {
        Self {
            payments,
            subscriptions,
            client,
            scheduler,
            chatwoot,
        }
    }

    /// Create (or return) the checkout link for a subscription's current
    /// cycle.
    pub async fn create_manual_link(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<PaymentLinkResult> {
        let ctx = self.subscriptions.billing_context(subscription_id).await?;
        self.require_chargeable(&ctx)?;
        let cycle = ctx.subscription.current_cycle;

        if let Some(existing) = self.link_for_cycle(&ctx, cycle).await? {
            return Ok(existing);
        }

        let payment = self
            .payments
            .ensure_pending(
                subscription_id,
                cycle,
                ctx.plan.amount_in_cents,
                &ctx.plan.currency,
            )
            .await?;
        if payment.is_approved() {
            return Err(BillingError::Precondition(format!(
                "cycle {} of subscription {} is already paid",
                cycle, subscription_id
            )));
        }
        // Another caller can have attached a link between the lookup and the
        // upsert; the row we just got back is authoritative.
        if let (Some(link_id), Some(url)) = (&payment.processor_link_id, &payment.checkout_url) {
            return Ok(PaymentLinkResult {
                payment_id: payment.id,
                link_id: link_id.clone(),
                checkout_url: url.clone(),
                cycle,
                reused: true,
            });
        }

        let link = match self
            .client
            .create_payment_link(&CreatePaymentLink {
                name: format!("{} - cycle {}", ctx.plan.name, cycle),
                description: format!("Subscription payment for {}", ctx.customer.name),
                amount_in_cents: ctx.plan.amount_in_cents,
                currency: ctx.plan.currency.clone(),
                reference: subscription_reference(subscription_id, cycle as i64),
            })
            .await
        {
            Ok(link) => link,
            Err(e) => {
                self.payments
                    .log_attempt(
                        subscription_id,
                        cycle,
                        attempt::MANUAL_LINK,
                        attempt::FAILURE,
                        Some(&e.to_string()),
                    )
                    .await?;
                return Err(e);
            }
        };

        let payment = self.payments.attach_link(payment.id, &link.id, &link.url).await?;
        self.payments
            .log_attempt(
                subscription_id,
                cycle,
                attempt::MANUAL_LINK,
                attempt::SUCCESS,
                Some(&link.id),
            )
            .await?;

        self.scheduler
            .schedule(Trigger::SubscriptionDue, &ctx, Some(&payment))
            .await?;

        if let Some(chatwoot) = &self.chatwoot {
            // Contact sync is convenience, not correctness; the link must
            // come back even when the messaging provider is down.
            if let Err(e) = chatwoot.sync_contact(&ctx.customer).await {
                tracing::warn!(
                    customer_id = %ctx.customer.id,
                    error = %e,
                    "Chatwoot contact sync failed, continuing"
                );
            }
        }

        tracing::info!(
            subscription_id = %subscription_id,
            cycle = cycle,
            link_id = %link.id,
            "Manual payment link created"
        );

        Ok(PaymentLinkResult {
            payment_id: payment.id,
            link_id: link.id,
            checkout_url: link.url,
            cycle,
            reused: false,
        })
    }

    /// Charge the customer's stored payment source for the current cycle.
    pub async fn auto_debit(&self, subscription_id: Uuid) -> BillingResult<AutoDebitOutcome> {
        let ctx = self.subscriptions.billing_context(subscription_id).await?;
        self.require_chargeable(&ctx)?;
        let cycle = ctx.subscription.current_cycle;

        if let Some(payment) = self
            .payments
            .find_by_cycle_key(&crate::payments::subscription_cycle_key(
                subscription_id,
                cycle,
            ))
            .await?
        {
            if let Some(txn_id) = payment.processor_transaction_id {
                self.payments
                    .log_attempt(
                        subscription_id,
                        cycle,
                        attempt::AUTO_DEBIT,
                        attempt::SKIPPED,
                        Some("transaction already exists for cycle"),
                    )
                    .await?;
                return Ok(AutoDebitOutcome::AlreadyCharged {
                    transaction_id: txn_id,
                });
            }
        }

        let extensions = ctx.customer.extensions();
        let source_token = extensions.get_str(ExtensionMap::PAYMENT_SOURCE_TOKEN);
        let email = ctx.customer.email.as_deref().filter(|e| !e.is_empty());
        let (Some(source_token), Some(email)) = (source_token, email) else {
            let detail = "customer has no payment source token or email";
            self.payments
                .log_attempt(
                    subscription_id,
                    cycle,
                    attempt::AUTO_DEBIT,
                    attempt::FAILURE,
                    Some(detail),
                )
                .await?;
            return Err(BillingError::Precondition(detail.into()));
        };

        let payment = self
            .payments
            .ensure_pending(
                subscription_id,
                cycle,
                ctx.plan.amount_in_cents,
                &ctx.plan.currency,
            )
            .await?;

        let request = CreateTransaction {
            amount_in_cents: ctx.plan.amount_in_cents,
            currency: ctx.plan.currency.clone(),
            reference: subscription_reference(subscription_id, cycle as i64),
            customer_email: email.to_string(),
            payment_source_token: source_token.to_string(),
        };

        match self.client.create_transaction(&request).await {
            Ok(txn) => {
                let status = PaymentStatus::from_processor(&txn.status);
                self.payments
                    .attach_transaction(
                        payment.id,
                        &txn.id,
                        status,
                        &serde_json::json!({ "id": txn.id, "status": txn.status }),
                    )
                    .await?;
                self.payments
                    .log_attempt(
                        subscription_id,
                        cycle,
                        attempt::AUTO_DEBIT,
                        attempt::SUCCESS,
                        Some(&txn.id),
                    )
                    .await?;
                tracing::info!(
                    subscription_id = %subscription_id,
                    cycle = cycle,
                    transaction_id = %txn.id,
                    status = %txn.status,
                    "Auto-debit submitted"
                );
                Ok(AutoDebitOutcome::Charged {
                    transaction_id: txn.id,
                    status,
                })
            }
            Err(e) => {
                self.payments
                    .log_attempt(
                        subscription_id,
                        cycle,
                        attempt::AUTO_DEBIT,
                        attempt::FAILURE,
                        Some(&e.to_string()),
                    )
                    .await?;
                // Fallback keeps the customer able to pay by hand; the
                // original failure is still surfaced to the caller.
                if let Err(link_err) = self.create_manual_link(subscription_id).await {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        cycle = cycle,
                        error = %link_err,
                        "Fallback manual link after failed auto-debit also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Make sure the current cycle has a checkout link, creating one when
    /// the cycle is unpaid and linkless. Returns the URL when one exists.
    pub async fn ensure_payment_link(
        &self,
        subscription_id: Uuid,
        cycle: i32,
    ) -> BillingResult<Option<String>> {
        let key = crate::payments::subscription_cycle_key(subscription_id, cycle);
        if let Some(payment) = self.payments.find_by_cycle_key(&key).await? {
            if payment.is_approved() {
                return Ok(None);
            }
            if let Some(url) = payment.checkout_url {
                return Ok(Some(url));
            }
        }
        let link = self.create_manual_link(subscription_id).await?;
        Ok(Some(link.checkout_url))
    }

    fn require_chargeable(&self, ctx: &BillingContext) -> BillingResult<()> {
        if ctx
            .subscription
            .status()
            .is_some_and(|s| s.is_terminal())
        {
            return Err(BillingError::Precondition(format!(
                "subscription {} is {}",
                ctx.subscription.id, ctx.subscription.status
            )));
        }
        Ok(())
    }

    async fn link_for_cycle(
        &self,
        ctx: &BillingContext,
        cycle: i32,
    ) -> BillingResult<Option<PaymentLinkResult>> {
        let key = crate::payments::subscription_cycle_key(ctx.subscription.id, cycle);
        let Some(payment) = self.payments.find_by_cycle_key(&key).await? else {
            return Ok(None);
        };
        if payment.is_approved() {
            return Err(BillingError::Precondition(format!(
                "cycle {} of subscription {} is already paid",
                cycle, ctx.subscription.id
            )));
        }
        Ok(Self::existing_link(&payment, cycle))
    }

    fn existing_link(payment: &PaymentRecord, cycle: i32) -> Option<PaymentLinkResult> {
        match (&payment.processor_link_id, &payment.checkout_url) {
            (Some(link_id), Some(url)) => Some(PaymentLinkResult {
                payment_id: payment.id,
                link_id: link_id.clone(),
                checkout_url: url.clone(),
                cycle,
                reused: true,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn payment(link: Option<(&str, &str)>, status: &str) -> PaymentRecord {
        PaymentRecord {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            cycle_number: 1,
            cycle_key: "k".into(),
            amount_in_cents: 50000,
            currency: "COP".into(),
            status: status.into(),
            processor_transaction_id: None,
            processor_link_id: link.map(|(id, _)| id.to_string()),
            checkout_url: link.map(|(_, url)| url.to_string()),
            raw_response: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            approved_at: None,
        }
    }

    #[test]
    fn existing_link_is_returned_unchanged() {
        let p = payment(Some(("lnk_1", "https://pay.example/lnk_1")), "PENDING");
        let result = ChargeService::existing_link(&p, 1).unwrap();
        assert!(result.reused);
        assert_eq!(result.link_id, "lnk_1");
        assert_eq!(result.checkout_url, "https://pay.example/lnk_1");
    }

    #[test]
    fn linkless_payment_yields_none() {
        let p = payment(None, "PENDING");
        assert!(ChargeService::existing_link(&p, 1).is_none());
    }
}
