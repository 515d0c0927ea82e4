use crate::models::{Esim, FulfillmentStatus, Order, OrderStatus, Plan, User, WebhookEventRecord};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions, ReturnDocument,
    UpdateOptions,
};
use mongodb::{
    bson::{self, doc, Document},
    Collection, Database, IndexModel,
};

/// Filters for the admin order listing.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub fulfillment: Option<FulfillmentStatus>,
    pub limit: i64,
    pub offset: u64,
}

/// Persistence for users, orders, eSIMs, plan snapshots and webhook events.
///
/// State changes on orders are compare-and-set: they apply only when the
/// stored state still matches `from`.
#[async_trait]
pub trait StoreRepository: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Find the user for `email`, creating one on first checkout.
    async fn upsert_user(&self, email: &str, name: Option<&str>) -> Result<User>;

    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn get_order(&self, id: &str) -> Result<Option<Order>>;

    async fn find_order_by_payment_intent(&self, payment_intent_id: &str)
        -> Result<Option<Order>>;

    async fn set_payment_intent(&self, order_id: &str, payment_intent_id: &str) -> Result<()>;

    /// Move `from -> to`. Returns the updated order, or `None` if the order
    /// was not in `from`.
    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<Order>>;

    /// Claim provisioning of a paid order: `from -> Provisioning`, bumping
    /// the attempt counter. `None` means another caller holds the claim.
    async fn claim_fulfillment(
        &self,
        order_id: &str,
        from: FulfillmentStatus,
    ) -> Result<Option<Order>>;

    /// Take over a stalled claim. Applies only while the order is still
    /// `Provisioning` and untouched since `seen_updated_at`; bumps the
    /// attempt counter like a fresh claim.
    async fn reclaim_fulfillment(
        &self,
        order_id: &str,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<Option<Order>>;

    async fn record_provider_order(&self, order_id: &str, provider_order_no: &str) -> Result<()>;

    /// Leave `Provisioning` for a terminal fulfillment state.
    async fn finish_fulfillment(
        &self,
        order_id: &str,
        to: FulfillmentStatus,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    /// Insert or refresh a profile, keyed by ICCID.
    async fn upsert_esim(&self, esim: &Esim) -> Result<()>;

    async fn list_esims_for_order(&self, order_id: &str) -> Result<Vec<Esim>>;

    /// Newest first.
    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>>;

    async fn upsert_plans(&self, plans: &[Plan]) -> Result<usize>;

    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Record a processed event. Recording the same id twice is not an error.
    async fn record_event(&self, record: &WebhookEventRecord) -> Result<()>;
}

#[derive(Clone)]
pub struct MongoStoreRepository {
    db: Database,
    users: Collection<User>,
    orders: Collection<Order>,
    esims: Collection<Esim>,
    plans: Collection<Plan>,
    webhook_events: Collection<WebhookEventRecord>,
}

pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == 11000
    )
}

impl MongoStoreRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            users: db.collection("users"),
            orders: db.collection("orders"),
            esims: db.collection("esims"),
            plans: db.collection("plans"),
            webhook_events: db.collection("webhook_events"),
        }
    }

    pub async fn init_indexes(&self) -> Result<()> {
        let email_index = IndexModel::builder()
            .keys(doc! { "email": 1 })
            .options(
                IndexOptions::builder()
                    .name("user_email_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        self.users.create_indexes([email_index], None).await?;

        // Unset intents are stored as null, so uniqueness only covers strings.
        let intent_index = IndexModel::builder()
            .keys(doc! { "payment_intent_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("order_payment_intent_idx".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "payment_intent_id": { "$type": "string" } })
                    .build(),
            )
            .build();

        let status_index = IndexModel::builder()
            .keys(doc! { "status": 1, "fulfillment": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("order_status_idx".to_string())
                    .build(),
            )
            .build();

        let user_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("order_user_idx".to_string())
                    .build(),
            )
            .build();

        self.orders
            .create_indexes([intent_index, status_index, user_index], None)
            .await?;

        let iccid_index = IndexModel::builder()
            .keys(doc! { "iccid": 1 })
            .options(
                IndexOptions::builder()
                    .name("esim_iccid_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();
        let esim_order_index = IndexModel::builder()
            .keys(doc! { "order_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("esim_order_idx".to_string())
                    .build(),
            )
            .build();
        self.esims
            .create_indexes([iccid_index, esim_order_index], None)
            .await?;

        let plan_country_index = IndexModel::builder()
            .keys(doc! { "country_code": 1, "price": 1 })
            .options(
                IndexOptions::builder()
                    .name("plan_country_idx".to_string())
                    .build(),
            )
            .build();
        self.plans.create_indexes([plan_country_index], None).await?;

        tracing::info!("Storefront indexes initialized");
        Ok(())
    }

    async fn find_and_update_order(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<Option<Order>> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .orders
            .find_one_and_update(filter, update, options)
            .await?)
    }
}

#[async_trait]
impl StoreRepository for MongoStoreRepository {
    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn upsert_user(&self, email: &str, name: Option<&str>) -> Result<User> {
        let candidate = User::new(email, name.map(str::to_string));

        let mut update = doc! {
            "$setOnInsert": {
                "_id": candidate.id.as_str(),
                "email": candidate.email.as_str(),
                "created_at": bson::DateTime::from_chrono(candidate.created_at),
            }
        };
        if let Some(name) = name {
            update.insert("$set", doc! { "name": name });
        }

        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        match self
            .users
            .find_one_and_update(doc! { "email": candidate.email.as_str() }, update, options)
            .await
        {
            Ok(Some(user)) => Ok(user),
            Ok(None) => bail!("Upsert returned no user for {}", candidate.email),
            // Lost an insert race on the unique email index; the winner's row is there now.
            Err(e) if is_duplicate_key(&e) => self
                .users
                .find_one(doc! { "email": candidate.email.as_str() }, None)
                .await?
                .ok_or_else(|| anyhow::anyhow!("User {} vanished after insert race", email)),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.orders.insert_one(order, None).await?;
        Ok(())
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.orders.find_one(doc! { "_id": id }, None).await?)
    }

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>> {
        Ok(self
            .orders
            .find_one(doc! { "payment_intent_id": payment_intent_id }, None)
            .await?)
    }

    async fn set_payment_intent(&self, order_id: &str, payment_intent_id: &str) -> Result<()> {
        let update = doc! {
            "$set": {
                "payment_intent_id": payment_intent_id,
                "updated_at": bson::DateTime::now(),
            }
        };
        self.orders
            .update_one(doc! { "_id": order_id }, update, None)
            .await?;
        Ok(())
    }

    async fn transition_status(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<Order>> {
        if !from.can_transition_to(to) {
            bail!("Illegal order transition {} -> {}", from, to);
        }

        let now = bson::DateTime::now();
        let mut set = doc! {
            "status": bson::to_bson(&to)?,
            "updated_at": now,
        };
        if to == OrderStatus::Paid {
            set.insert("paid_at", now);
        }
        if let Some(reason) = failure_reason {
            set.insert("failure_reason", reason);
        }

        self.find_and_update_order(
            doc! { "_id": order_id, "status": bson::to_bson(&from)? },
            doc! { "$set": set },
        )
        .await
    }

    async fn claim_fulfillment(
        &self,
        order_id: &str,
        from: FulfillmentStatus,
    ) -> Result<Option<Order>> {
        let filter = doc! {
            "_id": order_id,
            "status": bson::to_bson(&OrderStatus::Paid)?,
            "fulfillment": bson::to_bson(&from)?,
        };
        let update = doc! {
            "$set": {
                "fulfillment": bson::to_bson(&FulfillmentStatus::Provisioning)?,
                "updated_at": bson::DateTime::now(),
            },
            "$inc": { "provisioning_attempts": 1 },
        };
        self.find_and_update_order(filter, update).await
    }

    async fn reclaim_fulfillment(
        &self,
        order_id: &str,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<Option<Order>> {
        let filter = doc! {
            "_id": order_id,
            "status": bson::to_bson(&OrderStatus::Paid)?,
            "fulfillment": bson::to_bson(&FulfillmentStatus::Provisioning)?,
            "updated_at": bson::DateTime::from_chrono(seen_updated_at),
        };
        let update = doc! {
            "$set": { "updated_at": bson::DateTime::now() },
            "$inc": { "provisioning_attempts": 1 },
        };
        self.find_and_update_order(filter, update).await
    }

    async fn record_provider_order(&self, order_id: &str, provider_order_no: &str) -> Result<()> {
        let update = doc! {
            "$set": {
                "provider_order_no": provider_order_no,
                "updated_at": bson::DateTime::now(),
            }
        };
        self.orders
            .update_one(doc! { "_id": order_id }, update, None)
            .await?;
        Ok(())
    }

    async fn finish_fulfillment(
        &self,
        order_id: &str,
        to: FulfillmentStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let failure = match failure_reason {
            Some(reason) => bson::Bson::String(reason.to_string()),
            None => bson::Bson::Null,
        };
        let filter = doc! {
            "_id": order_id,
            "fulfillment": bson::to_bson(&FulfillmentStatus::Provisioning)?,
        };
        let update = doc! {
            "$set": {
                "fulfillment": bson::to_bson(&to)?,
                "failure_reason": failure,
                "updated_at": bson::DateTime::now(),
            }
        };
        let result = self.orders.update_one(filter, update, None).await?;
        if result.matched_count == 0 {
            tracing::warn!(order_id = %order_id, fulfillment = %to, "Order was not provisioning");
        }
        Ok(())
    }

    async fn upsert_esim(&self, esim: &Esim) -> Result<()> {
        let expires_at = match esim.expires_at {
            Some(dt) => bson::Bson::DateTime(bson::DateTime::from_chrono(dt)),
            None => bson::Bson::Null,
        };
        let update = doc! {
            "$setOnInsert": {
                "_id": esim.id.as_str(),
                "order_id": esim.order_id.as_str(),
                "user_id": esim.user_id.as_str(),
                "provider_id": esim.provider_id.as_str(),
                "created_at": bson::DateTime::from_chrono(esim.created_at),
            },
            "$set": {
                "qr_code_url": esim.qr_code_url.as_deref(),
                "activation_code": esim.activation_code.as_deref(),
                "status": bson::to_bson(&esim.status)?,
                "data_limit_mb": esim.data_limit_mb as i64,
                "data_used_mb": esim.data_used_mb as i64,
                "expires_at": expires_at,
            }
        };
        let options = UpdateOptions::builder().upsert(true).build();
        self.esims
            .update_one(doc! { "iccid": esim.iccid.as_str() }, update, options)
            .await?;
        Ok(())
    }

    async fn list_esims_for_order(&self, order_id: &str) -> Result<Vec<Esim>> {
        let cursor = self
            .esims
            .find(doc! { "order_id": order_id }, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let mut query = Document::new();
        if let Some(status) = filter.status {
            query.insert("status", bson::to_bson(&status)?);
        }
        if let Some(fulfillment) = filter.fulfillment {
            query.insert("fulfillment", bson::to_bson(&fulfillment)?);
        }

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .skip(filter.offset)
            .limit(filter.limit)
            .build();

        let cursor = self.orders.find(query, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn upsert_plans(&self, plans: &[Plan]) -> Result<usize> {
        let options = ReplaceOptions::builder().upsert(true).build();
        for plan in plans {
            self.plans
                .replace_one(doc! { "_id": plan.id.as_str() }, plan, options.clone())
                .await?;
        }
        Ok(plans.len())
    }

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .webhook_events
            .find_one(doc! { "_id": event_id }, None)
            .await?
            .is_some())
    }

    async fn record_event(&self, record: &WebhookEventRecord) -> Result<()> {
        match self.webhook_events.insert_one(record, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
