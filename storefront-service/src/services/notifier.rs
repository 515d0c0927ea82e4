//! Transactional email: order confirmations and operator alerts.

use crate::models::{Esim, Order};
use crate::services::email::{EmailMessage, EmailProvider, EmailProviderError};
use crate::utils::{generate_qr_base64, minor_unit_digits};
use std::fmt::Write as _;
use std::sync::Arc;

pub struct Notifier {
    provider: Arc<dyn EmailProvider>,
    admin_email: Option<String>,
}

impl Notifier {
    pub fn new(provider: Arc<dyn EmailProvider>, admin_email: Option<String>) -> Self {
        Self {
            provider,
            admin_email,
        }
    }

    async fn deliver(&self, message: EmailMessage) -> Result<(), EmailProviderError> {
        if !self.provider.is_enabled() {
            tracing::warn!(
                to = %message.to,
                subject = %message.subject,
                "Email provider disabled, message not sent"
            );
            return Ok(());
        }
        self.provider.send(&message).await.map(|_| ())
    }

    pub async fn send_order_confirmation(
        &self,
        order: &Order,
        esims: &[Esim],
    ) -> Result<(), EmailProviderError> {
        self.deliver(confirmation_message(order, esims)).await
    }

    /// Tell operators a paid order could not be provisioned.
    pub async fn send_admin_alert(
        &self,
        order: &Order,
        reason: &str,
    ) -> Result<(), EmailProviderError> {
        let Some(admin_email) = self.admin_email.as_deref() else {
            tracing::error!(
                order_id = %order.id,
                reason = %reason,
                "Provisioning failed and ADMIN_EMAIL is not set; alert not sent"
            );
            return Ok(());
        };
        self.deliver(admin_alert_message(admin_email, order, reason)).await
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Minor units rendered as a major-unit amount, e.g. `4.99 USD`.
pub fn format_amount(amount_minor: i64, currency: &str) -> String {
    let digits = minor_unit_digits(currency);
    if digits == 0 {
        return format!("{} {}", amount_minor, currency.to_ascii_uppercase());
    }
    let factor = 10i64.pow(digits);
    format!(
        "{}.{:0width$} {}",
        amount_minor / factor,
        (amount_minor % factor).abs(),
        currency.to_ascii_uppercase(),
        width = digits as usize
    )
}

fn format_data(mb: u64) -> String {
    if mb >= 1024 && mb % 1024 == 0 {
        format!("{} GB", mb / 1024)
    } else {
        format!("{} MB", mb)
    }
}

pub fn confirmation_message(order: &Order, esims: &[Esim]) -> EmailMessage {
    let item = &order.item;
    let total = format_amount(order.amount, &order.currency);

    let mut text = format!(
        "Thank you for your purchase!\n\n\
         Order: {}\nPlan: {}\nData: {}\nValidity: {} days\nQuantity: {}\nTotal: {}\n",
        order.id,
        item.name,
        format_data(item.data_amount_mb),
        item.days,
        item.quantity,
        total
    );

    let mut html = format!(
        "<h2>Thank you for your purchase!</h2>\
         <p>Order <strong>{}</strong></p>\
         <ul><li>Plan: {}</li><li>Data: {}</li><li>Validity: {} days</li>\
         <li>Quantity: {}</li><li>Total: {}</li></ul>",
        escape_html(&order.id),
        escape_html(&item.name),
        format_data(item.data_amount_mb),
        item.days,
        item.quantity,
        total
    );

    if esims.is_empty() {
        text.push_str(
            "\nYour eSIM is being prepared. We will email the activation details shortly.\n",
        );
        html.push_str(
            "<p>Your eSIM is being prepared. We will email the activation details shortly.</p>",
        );
    }

    for (idx, esim) in esims.iter().enumerate() {
        let _ = write!(text, "\neSIM {}\nICCID: {}\n", idx + 1, esim.iccid);
        let _ = write!(
            html,
            "<h3>eSIM {}</h3><p>ICCID: {}</p>",
            idx + 1,
            escape_html(&esim.iccid)
        );

        if let Some(url) = &esim.qr_code_url {
            let _ = writeln!(text, "QR code: {}", url);
            let _ = write!(
                html,
                "<p><a href=\"{0}\">Open your QR code</a></p>",
                escape_html(url)
            );
        }

        if let Some(code) = &esim.activation_code {
            let _ = writeln!(text, "Activation code: {}", code);
            let _ = write!(
                html,
                "<p>Activation code: <code>{}</code></p>",
                escape_html(code)
            );
            match generate_qr_base64(code) {
                Ok(png) => {
                    let _ = write!(
                        html,
                        "<img alt=\"eSIM QR code\" src=\"data:image/png;base64,{}\"/>",
                        png
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        order_id = %order.id,
                        error = %e,
                        "Failed to render QR code"
                    );
                }
            }
        }
    }

    text.push_str(
        "\nScan the QR code from your phone's mobile network settings to install the eSIM.\n",
    );

    EmailMessage {
        to: order.customer_email.clone(),
        subject: format!("Your SIMRYO eSIM order {}", order.id),
        body_text: text,
        body_html: Some(html),
    }
}

pub fn admin_alert_message(admin_email: &str, order: &Order, reason: &str) -> EmailMessage {
    let payment_intent = order.payment_intent_id.as_deref().unwrap_or("-");
    let provider_order = order.provider_order_no.as_deref().unwrap_or("-");

    let text = format!(
        "Manual processing required.\n\n\
         Order: {}\nCustomer: {}\nPlan: {} ({})\nQuantity: {}\nAmount: {}\n\
         Payment intent: {}\nProvider order: {}\nAttempts: {}\nReason: {}\n",
        order.id,
        order.customer_email,
        order.item.name,
        order.item.plan_id,
        order.item.quantity,
        format_amount(order.amount, &order.currency),
        payment_intent,
        provider_order,
        order.provisioning_attempts,
        reason
    );

    EmailMessage {
        to: admin_email.to_string(),
        subject: format!("[SIMRYO] Manual processing required: order {}", order.id),
        body_text: text,
        body_html: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EsimStatus, OrderItem};
    use crate::services::email::MockEmailProvider;
    use chrono::Utc;

    fn order() -> Order {
        let mut order = Order::new(
            "user-1".to_string(),
            "traveller@example.com".to_string(),
            OrderItem {
                plan_id: "esimaccess:JP1".to_string(),
                provider_id: "esimaccess".to_string(),
                package_code: "JP1".to_string(),
                name: "Japan <1GB>".to_string(),
                country_code: "JP".to_string(),
                data_amount_mb: 1024,
                days: 7,
                unit_price: 4.99,
                unit_cost: 3.0,
                quantity: 1,
            },
            499,
            "USD".to_string(),
        );
        order.payment_intent_id = Some("pi_123".to_string());
        order
    }

    fn esim() -> Esim {
        Esim {
            id: "esim-1".to_string(),
            order_id: "o".to_string(),
            user_id: "u".to_string(),
            provider_id: "esimaccess".to_string(),
            iccid: "8988000000000000001".to_string(),
            qr_code_url: Some("https://p.qrsim.net/abc.png".to_string()),
            activation_code: Some("LPA:1$rsp.example.com$ABC".to_string()),
            status: EsimStatus::Pending,
            data_limit_mb: 1024,
            data_used_mb: 0,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(499, "usd"), "4.99 USD");
        assert_eq!(format_amount(1005, "EUR"), "10.05 EUR");
        assert_eq!(format_amount(1200, "JPY"), "1200 JPY");
    }

    #[test]
    fn test_confirmation_contains_activation_details() {
        let message = confirmation_message(&order(), &[esim()]);
        assert_eq!(message.to, "traveller@example.com");
        assert!(message.body_text.contains("8988000000000000001"));
        assert!(message.body_text.contains("https://p.qrsim.net/abc.png"));
        assert!(message.body_text.contains("LPA:1$rsp.example.com$ABC"));
        assert!(message.body_text.contains("4.99 USD"));

        let html = message.body_html.unwrap();
        assert!(html.contains("Japan &lt;1GB&gt;"));
        assert!(html.contains("data:image/png;base64,"));
    }

    #[test]
    fn test_admin_alert_names_order_and_reason() {
        let message = admin_alert_message("ops@simryo.com", &order(), "provider timeout");
        assert_eq!(message.to, "ops@simryo.com");
        assert!(message.subject.contains("Manual processing required"));
        assert!(message.body_text.contains("pi_123"));
        assert!(message.body_text.contains("provider timeout"));
    }

    #[tokio::test]
    async fn test_disabled_provider_skips_without_error() {
        let mock = Arc::new(MockEmailProvider::new(false));
        let notifier = Notifier::new(mock.clone(), None);
        notifier.send_order_confirmation(&order(), &[]).await.unwrap();
        notifier.send_admin_alert(&order(), "x").await.unwrap();
        assert_eq!(mock.send_count(), 0);
    }

    #[tokio::test]
    async fn test_alert_goes_to_admin() {
        let mock = Arc::new(MockEmailProvider::new(true));
        let notifier = Notifier::new(mock.clone(), Some("ops@simryo.com".to_string()));
        notifier.send_admin_alert(&order(), "boom").await.unwrap();
        assert_eq!(mock.sent()[0].to, "ops@simryo.com");
    }
}
