use crate::config::SmtpConfig;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailProviderError {
    #[error("Provider not enabled: {0}")]
    NotEnabled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Returns the transport's message id when it reports one.
    async fn send(&self, email: &EmailMessage) -> Result<Option<String>, EmailProviderError>;
    async fn health_check(&self) -> Result<(), EmailProviderError>;
    fn is_enabled(&self) -> bool;
}

pub struct SmtpProvider {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> Result<Self, EmailProviderError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                EmailProviderError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }

    fn build_message(&self, email: &EmailMessage) -> Result<Message, EmailProviderError> {
        let from_mailbox: Mailbox =
            format!("{} <{}>", self.config.from_name, self.config.from_email)
                .parse()
                .map_err(|e| {
                    EmailProviderError::Configuration(format!("Invalid from address: {}", e))
                })?;

        let to_mailbox: Mailbox = email
            .to
            .parse()
            .map_err(|e| EmailProviderError::InvalidRecipient(format!("{}: {}", email.to, e)))?;

        let builder = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(&email.subject);

        let message = match &email.body_html {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.body_text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(email.body_text.clone()),
        };

        message.map_err(|e| {
            EmailProviderError::SendFailed(format!("Failed to build message: {}", e))
        })
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, email: &EmailMessage) -> Result<Option<String>, EmailProviderError> {
        if !self.config.enabled {
            return Err(EmailProviderError::NotEnabled(
                "SMTP email provider is not enabled".to_string(),
            ));
        }

        let transport = self.transport.as_ref().ok_or_else(|| {
            EmailProviderError::Configuration("SMTP transport not initialized".to_string())
        })?;

        let message = self.build_message(email)?;

        let response = transport
            .send(message)
            .await
            .map_err(|e| EmailProviderError::SendFailed(format!("Failed to send email: {}", e)))?;

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent");

        let message_id = response.message().next().map(|s| s.to_string());
        Ok(message_id)
    }

    async fn health_check(&self) -> Result<(), EmailProviderError> {
        let Some(transport) = self.transport.as_ref() else {
            return Ok(());
        };

        transport.test_connection().await.map_err(|e| {
            EmailProviderError::Connection(format!("SMTP connection test failed: {}", e))
        })?;

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// Mock email provider for testing. Keeps every message it is asked to send.
pub struct MockEmailProvider {
    enabled: bool,
    healthy: AtomicBool,
    send_count: AtomicU64,
    sent: Mutex<Vec<EmailMessage>>,
}

impl MockEmailProvider {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            healthy: AtomicBool::new(true),
            send_count: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Make `health_check` fail, as an unreachable relay would.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailProvider for MockEmailProvider {
    async fn send(&self, email: &EmailMessage) -> Result<Option<String>, EmailProviderError> {
        if !self.enabled {
            return Err(EmailProviderError::NotEnabled(
                "Mock email provider is not enabled".to_string(),
            ));
        }

        let count = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email.clone());
        }

        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            "[MOCK] Email would be sent"
        );

        Ok(Some(format!("mock-email-{}", count)))
    }

    async fn health_check(&self) -> Result<(), EmailProviderError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EmailProviderError::Connection(
                "Mock relay unreachable".to_string(),
            ))
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
