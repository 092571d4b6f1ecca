//! Notification transports: SMTP via async lettre, or log-only.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use pulse_core::config::MailConfig;
use pulse_core::error::{PulseError, Result};
use pulse_core::traits::Mailer;
use pulse_core::types::NotificationMessage;

/// Sends through an SMTP relay with STARTTLS.
pub struct SmtpMailer {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e| PulseError::Config(format!("Invalid from: {e}")))?;
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| PulseError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();
        Ok(Self { from, transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        let to = message
            .recipient_email
            .as_deref()
            .ok_or_else(|| PulseError::Delivery(format!("user {} has no email address", message.recipient_user_id)))?;
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| PulseError::Delivery(format!("Invalid to: {e}")))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| PulseError::Delivery(format!("Build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| PulseError::Delivery(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent to: {to}");
        Ok(())
    }
}

/// Logs instead of sending. Used when mail is disabled.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        tracing::info!(
            "📨 [mail disabled] to user {} <{}>: {}",
            message.recipient_user_id,
            message.recipient_email.as_deref().unwrap_or("-"),
            message.subject
        );
        Ok(())
    }
}

/// SMTP when mail is enabled, otherwise log-only.
pub fn mailer_from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    if config.enabled {
        Ok(Arc::new(SmtpMailer::new(config)?))
    } else {
        Ok(Arc::new(LogMailer))
    }
}

/// Substitute `{{name}}` placeholders. Unknown placeholders are left as-is.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(email: Option<&str>) -> NotificationMessage {
        NotificationMessage {
            instance_id: 1,
            course_id: 3,
            recipient_user_id: 20,
            recipient_email: email.map(String::from),
            related_user_id: None,
            subject: "Hello".into(),
            body: "Body".into(),
        }
    }

    #[test]
    fn test_render_template() {
        let vars = BTreeMap::from([("course_name", "Rust 101".to_string()), ("user_email", "a@b.c".to_string())]);
        assert_eq!(render_template("Welcome to {{course_name}}!", &vars), "Welcome to Rust 101!");
        assert_eq!(render_template("{{ user_email }} / {{unknown}}", &vars), "a@b.c / {{unknown}}");
        assert_eq!(render_template("open {{course_name", &vars), "open {{course_name");
        assert_eq!(render_template("plain", &vars), "plain");
    }

    #[test]
    fn test_factory_picks_log_mailer_when_disabled() {
        let mailer = mailer_from_config(&MailConfig::default()).unwrap();
        assert_eq!(mailer.name(), "log");
    }

    #[tokio::test]
    async fn test_log_mailer_accepts_anything() {
        assert!(LogMailer.send(&message(None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_smtp_requires_recipient_address() {
        let config = MailConfig {
            enabled: true,
            smtp_host: "localhost".into(),
            from_address: "pulse@example.com".into(),
            ..Default::default()
        };
        let mailer = SmtpMailer::new(&config).unwrap();
        assert_eq!(mailer.name(), "smtp");
        assert!(matches!(mailer.send(&message(None)).await, Err(PulseError::Delivery(_))));
        assert!(matches!(mailer.send(&message(Some("not an address"))).await, Err(PulseError::Delivery(_))));
    }
}
