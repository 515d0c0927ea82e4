//! Checkout and fulfillment.
//!
//! An order moves through two independent state machines. Payment status
//! goes `PENDING -> PAID | FAILED`. Once paid, fulfillment goes
//! `NOT_STARTED -> PROVISIONING -> PROVISIONED | FAILED`. Both transitions are
//! compare-and-set in the store, so webhook replays and the client/webhook
//! confirmation race can only provision once.

use crate::dtos::CheckoutRequest;
use crate::models::{
    normalize_email, Esim, EsimStatus, FulfillmentStatus, Order, OrderItem, OrderStatus,
    WebhookEventRecord,
};
use crate::services::metrics;
use crate::services::notifier::Notifier;
use crate::services::provider_manager::{PlanListing, PlanQuery, ProviderManager};
use crate::services::providers::{ProvisionedProfile, PurchaseRequest};
use crate::services::repository::{OrderFilter, StoreRepository};
use crate::services::stripe::{CreatePaymentIntent, PaymentIntent, StripeClient};
use crate::utils::order_amount_minor;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

/// A freshly created order with its PaymentIntent.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub order_id: String,
    pub payment_intent_id: String,
    pub client_secret: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub enum FulfillmentOutcome {
    Provisioned { order: Order, esims: Vec<Esim> },
    /// Another confirmation already claimed this order.
    AlreadyProcessed { order: Order, esims: Vec<Esim> },
    Failed { order: Order, reason: String },
}

impl FulfillmentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentOutcome::Provisioned { .. } => "provisioned",
            FulfillmentOutcome::AlreadyProcessed { .. } => "already_processed",
            FulfillmentOutcome::Failed { .. } => "failed",
        }
    }

    pub fn order(&self) -> &Order {
        match self {
            FulfillmentOutcome::Provisioned { order, .. }
            | FulfillmentOutcome::AlreadyProcessed { order, .. }
            | FulfillmentOutcome::Failed { order, .. } => order,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event id seen before.
    Duplicate,
    /// Event type or order we do not act on.
    Ignored,
    Provisioned,
    AlreadyProcessed,
    ProvisioningFailed,
    /// A card attempt was declined; the intent stays payable.
    PaymentDeclined,
    /// The intent was canceled and the order failed.
    PaymentFailed,
    /// Payment and order state disagree; operators were alerted.
    ManualReview,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Provisioned => "provisioned",
            WebhookOutcome::AlreadyProcessed => "already_processed",
            WebhookOutcome::ProvisioningFailed => "provisioning_failed",
            WebhookOutcome::PaymentDeclined => "payment_declined",
            WebhookOutcome::PaymentFailed => "payment_failed",
            WebhookOutcome::ManualReview => "manual_review",
        }
    }
}

impl From<&FulfillmentOutcome> for WebhookOutcome {
    fn from(outcome: &FulfillmentOutcome) -> Self {
        match outcome {
            FulfillmentOutcome::Provisioned { .. } => WebhookOutcome::Provisioned,
            FulfillmentOutcome::AlreadyProcessed { .. } => WebhookOutcome::AlreadyProcessed,
            FulfillmentOutcome::Failed { .. } => WebhookOutcome::ProvisioningFailed,
        }
    }
}

fn db_err(err: anyhow::Error) -> AppError {
    AppError::DatabaseError(err)
}

const DEFAULT_STALE_PROVISIONING: Duration = Duration::from_secs(15 * 60);

pub struct PurchaseOrchestrator {
    providers: Arc<ProviderManager>,
    stripe: Arc<StripeClient>,
    repo: Arc<dyn StoreRepository>,
    notifier: Arc<Notifier>,
    stale_provisioning: Duration,
}

impl PurchaseOrchestrator {
    pub fn new(
        providers: Arc<ProviderManager>,
        stripe: Arc<StripeClient>,
        repo: Arc<dyn StoreRepository>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            providers,
            stripe,
            repo,
            notifier,
            stale_provisioning: DEFAULT_STALE_PROVISIONING,
        }
    }

    /// How long a provisioning claim may sit untouched before a
    /// reconciliation retry can take it over.
    pub fn with_stale_provisioning_after(mut self, after: Duration) -> Self {
        self.stale_provisioning = after;
        self
    }

    /// Price the plan, create a pending order and its PaymentIntent.
    pub async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, AppError> {
        request.validate()?;

        let plan = self.providers.find_plan(request.plan_id.trim()).await?;
        if !plan.in_stock {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Plan {} is out of stock",
                plan.id
            )));
        }

        let amount = order_amount_minor(plan.price, request.quantity, &plan.currency);
        if amount <= 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Plan {} has no payable price",
                plan.id
            )));
        }

        let name = request
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        let user = self
            .repo
            .upsert_user(&request.email, name)
            .await
            .map_err(db_err)?;

        let item = OrderItem {
            plan_id: plan.id.clone(),
            provider_id: plan.provider_id.clone(),
            package_code: plan.package_code.clone(),
            name: plan.name.clone(),
            country_code: plan.country_code.clone(),
            data_amount_mb: plan.data_amount_mb,
            days: plan.days,
            unit_price: plan.price,
            unit_cost: plan.cost,
            quantity: request.quantity,
        };
        let order = Order::new(
            user.id.clone(),
            user.email.clone(),
            item,
            amount,
            plan.currency.clone(),
        );
        self.repo.insert_order(&order).await.map_err(db_err)?;

        let params = CreatePaymentIntent {
            amount,
            currency: order.currency.clone(),
            order_id: order.id.clone(),
            plan_id: plan.id.clone(),
            receipt_email: user.email.clone(),
            description: format!("{} x{}", plan.name, request.quantity),
            idempotency_key: order.id.clone(),
        };

        let intent = match self.stripe.create_payment_intent(&params).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::error!(order_id = %order.id, error = %e, "Payment intent creation failed");
                self.mark_payment_failed(&order.id, "Payment intent creation failed")
                    .await?;
                return Err(e.into());
            }
        };

        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            AppError::BadGateway("Payment intent has no client secret".to_string())
        })?;

        self.repo
            .set_payment_intent(&order.id, &intent.id)
            .await
            .map_err(db_err)?;

        metrics::record_order_created(&order.currency);
        tracing::info!(
            order_id = %order.id,
            payment_intent_id = %intent.id,
            plan_id = %plan.id,
            amount,
            currency = %order.currency,
            "Checkout created"
        );

        Ok(CheckoutSession {
            order_id: order.id,
            payment_intent_id: intent.id,
            client_secret,
            amount,
            currency: order.currency,
        })
    }

    async fn order_for_intent(&self, intent: &PaymentIntent) -> Result<Option<Order>, AppError> {
        if let Some(order) = self
            .repo
            .find_order_by_payment_intent(&intent.id)
            .await
            .map_err(db_err)?
        {
            return Ok(Some(order));
        }
        // The intent id is stored after Stripe answers; fall back to metadata.
        match intent.order_id() {
            Some(order_id) => self.repo.get_order(order_id).await.map_err(db_err),
            None => Ok(None),
        }
    }

    fn ensure_amount_matches(order: &Order, intent: &PaymentIntent) -> Result<(), AppError> {
        if intent.amount != order.amount || !intent.currency.eq_ignore_ascii_case(&order.currency)
        {
            tracing::error!(
                order_id = %order.id,
                payment_intent_id = %intent.id,
                expected = order.amount,
                received = intent.amount,
                "Payment amount does not match order"
            );
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment amount does not match order {}",
                order.id
            )));
        }
        Ok(())
    }

    /// Client-driven confirmation after Stripe.js reports success.
    pub async fn confirm_client_payment(
        &self,
        payment_intent_id: &str,
    ) -> Result<FulfillmentOutcome, AppError> {
        let intent = self.stripe.retrieve_payment_intent(payment_intent_id).await?;

        let order = self.order_for_intent(&intent).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "No order for payment intent {}",
                payment_intent_id
            ))
        })?;

        if !intent.is_succeeded() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment has not succeeded (status {})",
                intent.status
            )));
        }
        Self::ensure_amount_matches(&order, &intent)?;

        self.complete_payment(order, &intent.id).await
    }

    /// Verify and apply a Stripe webhook delivery.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, AppError> {
        let event = self.stripe.construct_event(payload, signature)?;

        if self
            .repo
            .is_event_processed(&event.id)
            .await
            .map_err(db_err)?
        {
            tracing::info!(event_id = %event.id, "Duplicate webhook event ignored");
            metrics::record_webhook(&event.type_, "duplicate");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match event.type_.as_str() {
            "payment_intent.succeeded" => {
                let intent = event.payment_intent()?;
                match self.order_for_intent(&intent).await? {
                    None => {
                        tracing::warn!(payment_intent_id = %intent.id, "Webhook for unknown order");
                        WebhookOutcome::Ignored
                    }
                    Some(order) => {
                        let result = match Self::ensure_amount_matches(&order, &intent) {
                            Ok(()) => self.complete_payment(order.clone(), &intent.id).await,
                            Err(e) => Err(e),
                        };
                        match result {
                            Ok(fulfillment) => WebhookOutcome::from(&fulfillment),
                            Err(AppError::Conflict(e)) => {
                                self.alert(&order, &e.to_string()).await;
                                WebhookOutcome::ManualReview
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
            // Stripe reports every declined attempt, but the customer may
            // still pay the same intent with another method.
            "payment_intent.payment_failed" => {
                let intent = event.payment_intent()?;
                match self.order_for_intent(&intent).await? {
                    None => WebhookOutcome::Ignored,
                    Some(order) => {
                        tracing::info!(
                            order_id = %order.id,
                            payment_intent_id = %intent.id,
                            intent_status = %intent.status,
                            reason = ?intent.failure_message(),
                            "Payment attempt declined, order stays pending"
                        );
                        WebhookOutcome::PaymentDeclined
                    }
                }
            }
            "payment_intent.canceled" => {
                let intent = event.payment_intent()?;
                match self.order_for_intent(&intent).await? {
                    None => WebhookOutcome::Ignored,
                    Some(order) => {
                        let reason = intent
                            .failure_message()
                            .unwrap_or_else(|| format!("Payment {}", intent.status));
                        match self.mark_payment_failed(&order.id, &reason).await? {
                            Some(_) => WebhookOutcome::PaymentFailed,
                            None => WebhookOutcome::Ignored,
                        }
                    }
                }
            }
            other => {
                tracing::debug!(event_type = %other, "Unhandled webhook event type");
                WebhookOutcome::Ignored
            }
        };

        self.repo
            .record_event(&WebhookEventRecord {
                id: event.id.clone(),
                event_type: event.type_.clone(),
                received_at: Utc::now(),
            })
            .await
            .map_err(db_err)?;

        metrics::record_webhook(&event.type_, outcome.as_str());
        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            outcome = outcome.as_str(),
            "Webhook processed"
        );

        Ok(outcome)
    }

    /// Mark the order paid (if it is not already) and provision it once.
    pub async fn complete_payment(
        &self,
        order: Order,
        payment_intent_id: &str,
    ) -> Result<FulfillmentOutcome, AppError> {
        let order = match order.status {
            OrderStatus::Pending => {
                match self
                    .repo
                    .transition_status(&order.id, OrderStatus::Pending, OrderStatus::Paid, None)
                    .await
                    .map_err(db_err)?
                {
                    Some(paid) => {
                        metrics::record_order_paid(&paid.currency, paid.amount);
                        tracing::info!(
                            order_id = %paid.id,
                            payment_intent_id = %payment_intent_id,
                            "Order paid"
                        );
                        paid
                    }
                    // Lost the race; reload and follow whatever state won.
                    None => self.load_order(&order.id).await?,
                }
            }
            _ => order,
        };

        match order.status {
            OrderStatus::Paid => {}
            OrderStatus::Failed => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Payment {} succeeded for order {} already marked FAILED",
                    payment_intent_id,
                    order.id
                )));
            }
            OrderStatus::Pending => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Order {} is still pending",
                    order.id
                )));
            }
        }

        self.fulfill(&order.id, FulfillmentStatus::NotStarted).await
    }

    async fn load_order(&self, order_id: &str) -> Result<Order, AppError> {
        self.repo
            .get_order(order_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))
    }

    /// Claim fulfillment from `from` and provision. Losing the claim is not
    /// an error; the current order is reported as already processed.
    async fn fulfill(
        &self,
        order_id: &str,
        from: FulfillmentStatus,
    ) -> Result<FulfillmentOutcome, AppError> {
        let Some(order) = self
            .repo
            .claim_fulfillment(order_id, from)
            .await
            .map_err(db_err)?
        else {
            tracing::info!(order_id = %order_id, "Fulfillment already claimed");
            return self.already_processed(order_id).await;
        };

        self.run_fulfillment(order).await
    }

    async fn already_processed(&self, order_id: &str) -> Result<FulfillmentOutcome, AppError> {
        let order = self.load_order(order_id).await?;
        let esims = self
            .repo
            .list_esims_for_order(order_id)
            .await
            .map_err(db_err)?;
        Ok(FulfillmentOutcome::AlreadyProcessed { order, esims })
    }

    /// Provision a claimed order and record the terminal fulfillment state.
    async fn run_fulfillment(&self, order: Order) -> Result<FulfillmentOutcome, AppError> {
        match self.provision(&order).await {
            Ok(esims) => {
                self.repo
                    .finish_fulfillment(&order.id, FulfillmentStatus::Provisioned, None)
                    .await
                    .map_err(db_err)?;
                metrics::record_provisioning("provisioned");
                let order = self.load_order(&order.id).await?;

                tracing::info!(
                    order_id = %order.id,
                    esims = esims.len(),
                    "Order provisioned"
                );

                if let Err(e) = self.notifier.send_order_confirmation(&order, &esims).await {
                    tracing::error!(order_id = %order.id, error = %e, "Failed to send confirmation email");
                }

                Ok(FulfillmentOutcome::Provisioned { order, esims })
            }
            Err(reason) => {
                self.repo
                    .finish_fulfillment(&order.id, FulfillmentStatus::Failed, Some(&reason))
                    .await
                    .map_err(db_err)?;
                metrics::record_provisioning("failed");
                let order = self.load_order(&order.id).await?;

                tracing::error!(
                    order_id = %order.id,
                    attempts = order.provisioning_attempts,
                    reason = %reason,
                    "Provisioning failed"
                );

                self.alert(&order, &reason).await;

                Ok(FulfillmentOutcome::Failed { order, reason })
            }
        }
    }

    async fn alert(&self, order: &Order, reason: &str) {
        if let Err(e) = self.notifier.send_admin_alert(order, reason).await {
            tracing::error!(order_id = %order.id, error = %e, "Failed to send admin alert");
        }
    }

    /// Order or look up profiles at the provider and store them.
    /// Every failure is reduced to a reason recorded on the order.
    async fn provision(&self, order: &Order) -> Result<Vec<Esim>, String> {
        let item = &order.item;

        let result = match order.provider_order_no.as_deref() {
            // The vendor already has this order; never order twice.
            Some(order_no) => self
                .providers
                .query_order(&item.provider_id, order_no)
                .await
                .map_err(|e| format!("Provider order query failed: {}", e))?,
            None => {
                let request = PurchaseRequest {
                    transaction_id: order.provider_transaction_id(),
                    order_id: order.id.clone(),
                    package_code: item.package_code.clone(),
                    quantity: item.quantity,
                    unit_cost: (item.unit_cost > 0.0).then_some(item.unit_cost),
                    customer_email: order.customer_email.clone(),
                };
                self.providers
                    .purchase(&item.provider_id, &request)
                    .await
                    .map_err(|e| format!("Provider purchase failed: {}", e))?
            }
        };

        if !result.success {
            return Err(result
                .error
                .unwrap_or_else(|| "Provider rejected the order".to_string()));
        }

        if let Some(order_no) = result.order_no.as_deref() {
            if order.provider_order_no.as_deref() != Some(order_no) {
                self.repo
                    .record_provider_order(&order.id, order_no)
                    .await
                    .map_err(|e| format!("Failed to record provider order: {}", e))?;
            }
        }

        if !result.is_allocated() {
            metrics::record_provisioning("pending");
            return Err(format!(
                "Provider order {} accepted but profiles are not allocated yet; retry provisioning to fetch them",
                result.order_no.as_deref().unwrap_or("-")
            ));
        }

        let mut esims = Vec::with_capacity(result.profiles.len());
        for profile in &result.profiles {
            let esim = esim_from_profile(order, profile);
            self.repo
                .upsert_esim(&esim)
                .await
                .map_err(|e| format!("Failed to store eSIM {}: {}", esim.iccid, e))?;
            esims.push(esim);
        }

        Ok(esims)
    }

    /// `PENDING -> FAILED`. Returns `None` if the order had already left pending.
    pub async fn mark_payment_failed(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<Option<Order>, AppError> {
        let updated = self
            .repo
            .transition_status(order_id, OrderStatus::Pending, OrderStatus::Failed, Some(reason))
            .await
            .map_err(db_err)?;

        if updated.is_some() {
            metrics::record_order_failed();
            tracing::info!(order_id = %order_id, reason = %reason, "Order payment failed");
        }
        Ok(updated)
    }

    /// Operator reconciliation: provision a paid order whose fulfillment
    /// failed, never started, or stalled in `PROVISIONING`.
    ///
    /// A `PROVISIONING` claim is taken over only once it has been idle for
    /// the stale threshold, or immediately with `force`. A known
    /// `provider_order_no` makes the takeover a vendor query, not a new order.
    pub async fn retry_provisioning(
        &self,
        order_id: &str,
        force: bool,
    ) -> Result<FulfillmentOutcome, AppError> {
        let order = self.load_order(order_id).await?;

        if order.status != OrderStatus::Paid {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Order {} is {}, only paid orders can be provisioned",
                order.id,
                order.status
            )));
        }

        match order.fulfillment {
            FulfillmentStatus::Failed | FulfillmentStatus::NotStarted => {
                tracing::info!(
                    order_id = %order.id,
                    from = %order.fulfillment,
                    attempts = order.provisioning_attempts,
                    "Retrying provisioning"
                );
                self.fulfill(&order.id, order.fulfillment).await
            }
            FulfillmentStatus::Provisioning => {
                let idle = (Utc::now() - order.updated_at).to_std().unwrap_or_default();
                if !force && idle < self.stale_provisioning {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Order {} has been provisioning for {}s; retry after {}s or force",
                        order.id,
                        idle.as_secs(),
                        self.stale_provisioning.as_secs()
                    )));
                }

                tracing::warn!(
                    order_id = %order.id,
                    idle_secs = idle.as_secs(),
                    force,
                    provider_order_no = ?order.provider_order_no,
                    "Taking over stalled provisioning"
                );
                match self
                    .repo
                    .reclaim_fulfillment(&order.id, order.updated_at)
                    .await
                    .map_err(db_err)?
                {
                    Some(claimed) => self.run_fulfillment(claimed).await,
                    None => self.already_processed(&order.id).await,
                }
            }
            other => Err(AppError::Conflict(anyhow::anyhow!(
                "Order {} fulfillment is {}",
                order.id,
                other
            ))),
        }
    }

    /// Order and its profiles, visible only to the purchasing email.
    pub async fn get_order_for_customer(
        &self,
        order_id: &str,
        email: &str,
    ) -> Result<(Order, Vec<Esim>), AppError> {
        let not_found = || AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id));

        let order = self
            .repo
            .get_order(order_id)
            .await
            .map_err(db_err)?
            .ok_or_else(not_found)?;
        if order.customer_email != normalize_email(email) {
            return Err(not_found());
        }

        let esims = self
            .repo
            .list_esims_for_order(order_id)
            .await
            .map_err(db_err)?;
        Ok((order, esims))
    }

    pub async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, AppError> {
        self.repo.list_orders(filter).await.map_err(db_err)
    }

    /// Refetch every provider catalog and persist the snapshot.
    pub async fn sync_plans(&self) -> Result<(usize, PlanListing), AppError> {
        self.providers.invalidate_cache(None);
        let listing = self.providers.get_all_plans(&PlanQuery::default()).await?;
        let stored = self
            .repo
            .upsert_plans(&listing.plans)
            .await
            .map_err(db_err)?;
        tracing::info!(
            stored,
            failed_providers = ?listing.failed_providers,
            "Plan snapshot synced"
        );
        Ok((stored, listing))
    }
}

fn esim_from_profile(order: &Order, profile: &ProvisionedProfile) -> Esim {
    Esim {
        id: uuid::Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        user_id: order.user_id.clone(),
        provider_id: order.item.provider_id.clone(),
        iccid: profile.iccid.clone(),
        qr_code_url: profile.qr_code_url.clone(),
        activation_code: profile.activation_code.clone(),
        status: EsimStatus::from_vendor(&profile.status),
        data_limit_mb: if profile.data_limit_mb > 0 {
            profile.data_limit_mb
        } else {
            order.item.data_amount_mb
        },
        data_used_mb: profile.data_used_mb,
        expires_at: profile.expires_at,
        created_at: Utc::now(),
    }
}
