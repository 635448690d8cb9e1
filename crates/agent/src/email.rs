//! Outbound email transport behind a narrow trait: the orchestrator only
//! ever needs `send(to, subject, body)`.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use thiserror::Error;

use leadline_core::config::EmailConfig;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email transport is not configured")]
    Disabled,
    #[error("invalid email address: {0}")]
    Address(String),
    #[error("smtp delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError>;
}

pub struct SmtpEmailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailTransport {
    pub fn from_config(config: &EmailConfig) -> Result<Self, EmailError> {
        if !config.enabled {
            return Err(EmailError::Disabled);
        }

        let from = config
            .from_address
            .parse::<Mailbox>()
            .map_err(|_| EmailError::Address(config.from_address.clone()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|error| EmailError::Delivery(error.to_string()))?
            .port(config.smtp_port);

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder
                .credentials(Credentials::new(username.clone(), password.expose_secret().to_string()));
        }

        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        let recipient = to.parse::<Mailbox>().map_err(|_| EmailError::Address(to.to_string()))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .body(body.to_string())
            .map_err(|error| EmailError::Delivery(error.to_string()))?;

        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|error| EmailError::Delivery(error.to_string()))
    }
}

/// Stand-in transport for deployments without SMTP configured. Every send
/// reports [`EmailError::Disabled`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledEmailTransport;

#[async_trait]
impl EmailTransport for DisabledEmailTransport {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), EmailError> {
        Err(EmailError::Disabled)
    }
}

/// Records outbound mail instead of delivering it; optionally fails every
/// send so transport-failure paths can be exercised.
#[derive(Default)]
pub struct RecordingEmailTransport {
    sent: tokio::sync::Mutex<Vec<SentEmail>>,
    fail_sends: std::sync::atomic::AtomicBool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl RecordingEmailTransport {
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EmailError::Delivery("simulated transport failure".to_string()));
        }
        let mut sent = self.sent.lock().await;
        sent.push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EmailError, EmailTransport, RecordingEmailTransport, SmtpEmailTransport};
    use leadline_core::config::EmailConfig;

    #[tokio::test]
    async fn recording_transport_captures_messages() {
        let transport = RecordingEmailTransport::default();
        transport.send("asha@example.com", "Following up", "Hello Asha").await.expect("send");

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "asha@example.com");
        assert_eq!(sent[0].subject, "Following up");
    }

    #[tokio::test]
    async fn failing_transport_surfaces_delivery_errors() {
        let transport = RecordingEmailTransport::default();
        transport.set_fail_sends(true);

        let error = transport.send("a@example.com", "s", "b").await.expect_err("must fail");
        assert!(matches!(error, EmailError::Delivery(_)));
        assert!(transport.sent().await.is_empty());
    }

    #[test]
    fn disabled_config_is_rejected_at_construction() {
        let config = EmailConfig {
            enabled: false,
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            from_address: "assistant@example.com".to_string(),
        };

        assert!(matches!(SmtpEmailTransport::from_config(&config), Err(EmailError::Disabled)));
    }
}
