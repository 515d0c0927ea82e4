mod esim;
mod order;
mod plan;
mod user;

pub use esim::{Esim, EsimStatus};
pub use order::{FulfillmentStatus, Order, OrderItem, OrderStatus, WebhookEventRecord};
pub use plan::{ActivationInfo, Plan};
pub use user::{normalize_email, User};

// Optional DateTime<Utc> stored as a native BSON date.
pub(crate) mod opt_chrono_datetime_as_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt.map(|dt| dt.to_chrono()))
    }
}
