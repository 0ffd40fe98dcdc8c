//! Sends the rendered digest.
//!
//! `SmtpMailer` is the real transport; `PreviewMailer` prints instead, for
//! dry runs.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::EmailConfig;
use crate::error::DigestError;
use crate::layers::digest::Digest;

/// A fully rendered message, ready for any transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl OutgoingMail {
    pub fn from_digest(digest: &Digest) -> Self {
        Self {
            subject: digest.subject(),
            text: digest.render_text(),
            html: digest.render_html(),
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), DigestError>;
}

pub struct SmtpMailer {
    host: String,
    port: u16,
    from: String,
    to: String,
    username: String,
    password: String,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            from: config.from_email.clone(),
            to: config.to_email.clone(),
            username: config.from_email.clone(),
            password: config.password.clone(),
        }
    }

    fn build_message(&self, mail: &OutgoingMail) -> Result<Message, DigestError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| DigestError::DeliveryFailed(format!("invalid from address: {}", e)))?;
        let to: Mailbox = self
            .to
            .parse()
            .map_err(|e| DigestError::DeliveryFailed(format!("invalid to address: {}", e)))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(mail.subject.clone())
            .multipart(MultiPart::alternative_plain_html(mail.text.clone(), mail.html.clone()))
            .map_err(|e| DigestError::DeliveryFailed(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), DigestError> {
        let message = self.build_message(mail)?;
        let creds = Credentials::new(self.username.clone(), self.password.clone());

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| DigestError::DeliveryFailed(format!("SMTP relay error: {}", e)))?
            .port(self.port)
            .credentials(creds)
            .build();

        tracing::info!("Sending '{}' to {} via {}:{}", mail.subject, self.to, self.host, self.port);
        let response = mailer
            .send(message)
            .await
            .map_err(|e| DigestError::DeliveryFailed(format!("SMTP send error: {}", e)))?;
        tracing::debug!("SMTP server answered {}", response.code());
        Ok(())
    }
}

/// Writes the digest to stdout instead of mailing it.
pub struct PreviewMailer;

#[async_trait]
impl Mailer for PreviewMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), DigestError> {
        println!("Subject: {}\n\n{}", mail.subject, mail.text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::digest::DigestConfig;
    use chrono::NaiveDate;

    fn config() -> EmailConfig {
        EmailConfig {
            from_email: "digest@example.com".into(),
            password: "secret".into(),
            to_email: "Reader <reader@example.com>".into(),
            ..Default::default()
        }
    }

    fn empty_mail() -> OutgoingMail {
        let digest = Digest::assemble(
            vec![],
            &DigestConfig { threshold: 7.0, max_papers: 10 },
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
        );
        OutgoingMail::from_digest(&digest)
    }

    #[test]
    fn test_outgoing_mail_from_empty_digest() {
        let mail = empty_mail();
        assert_eq!(mail.subject, "arXiv digest 2024-01-16: no matches");
        assert!(mail.text.contains("nothing to report"));
        assert!(mail.html.starts_with("<html>"));
    }

    #[test]
    fn test_build_message_has_both_parts() {
        let mailer = SmtpMailer::new(&config());
        let message = mailer.build_message(&empty_mail()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: arXiv digest 2024-01-16: no matches"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_bad_address_is_delivery_failure() {
        let mut cfg = config();
        cfg.to_email = "not an address".into();
        let err = SmtpMailer::new(&cfg).build_message(&empty_mail()).unwrap_err();
        assert!(matches!(err, DigestError::DeliveryFailed(ref m) if m.contains("to address")));
    }

    #[tokio::test]
    async fn test_preview_mailer_always_succeeds() {
        assert!(PreviewMailer.send(&empty_mail()).await.is_ok());
    }
}
