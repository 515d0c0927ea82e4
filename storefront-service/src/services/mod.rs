pub mod email;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod provider_manager;
pub mod providers;
pub mod repository;
pub mod stripe;

pub use email::{EmailProvider, MockEmailProvider, SmtpProvider};
pub use notifier::Notifier;
pub use orchestrator::{FulfillmentOutcome, PurchaseOrchestrator, WebhookOutcome};
pub use provider_manager::{PlanQuery, ProviderManager, ProviderSettings};
pub use repository::{MongoStoreRepository, OrderFilter, StoreRepository};
pub use stripe::StripeClient;
