//! RFC 5322 composition and SMTP submission. One outbound message per send
//! job; the transport is built per call from the user's settings so
//! credential changes take effect immediately.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;
use uuid::Uuid;

use crate::crypto::CredentialCipher;
use crate::error::{Error, Result};
use crate::store::UserSettings;

/// A composed message ready for submission and Sent-folder append.
pub struct OutboundEmail {
    pub message_id: String,
    pub rfc5322_bytes: Vec<u8>,
    message: Message,
}

/// What a send job wants on the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
}

/// Compose an RFC 5322 message from the user identity and request.
/// The Message-ID is generated here so callers can locate the message on the
/// server afterwards.
pub fn compose(from_email: &str, request: &OutboundRequest) -> Result<OutboundEmail> {
    let from_mailbox: Mailbox = from_email
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid from address {}: {}", from_email, e)))?;

    let message_id = format!("<{}@v-mail>", Uuid::new_v4());

    let mut builder = Message::builder()
        .from(from_mailbox)
        .subject(&request.subject)
        .message_id(Some(message_id.clone()));

    if request.to.is_empty() {
        return Err(Error::InvalidInput("no recipients".to_string()));
    }
    for to in &request.to {
        builder = builder.to(to
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid to address {}: {}", to, e)))?);
    }
    for cc in &request.cc {
        builder = builder.cc(cc
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid cc address {}: {}", cc, e)))?);
    }
    if let Some(in_reply_to) = &request.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }

    let message = builder
        .header(ContentType::TEXT_PLAIN)
        .body(request.body.clone())
        .map_err(|e| Error::InvalidInput(format!("message build failed: {}", e)))?;

    Ok(OutboundEmail {
        message_id,
        rfc5322_bytes: message.formatted(),
        message,
    })
}

pub struct SmtpService {
    cipher: std::sync::Arc<CredentialCipher>,
    /// Implicit TLS vs STARTTLS submission, from deployment configuration.
    use_tls: bool,
}

impl SmtpService {
    pub fn new(cipher: std::sync::Arc<CredentialCipher>, use_tls: bool) -> Self {
        Self { cipher, use_tls }
    }

    /// Submit one composed message. The decrypted SMTP password lives only
    /// for the duration of this call.
    pub async fn send(&self, settings: &UserSettings, email: &OutboundEmail) -> Result<()> {
        let password = self.cipher.decrypt(&settings.encrypted_smtp_password)?;
        let creds = Credentials::new(settings.mail_username.clone(), password);

        let mailer: AsyncSmtpTransport<Tokio1Executor> = if self.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
                .map_err(|e| Error::ConnectFailed(format!("SMTP relay error: {}", e)))?
                .port(settings.smtp_port)
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.smtp_host)
                .port(settings.smtp_port)
                .credentials(creds)
                .build()
        };

        mailer
            .send(email.message.clone())
            .await
            .map_err(|e| classify_smtp_error(&e))?;

        info!("submitted message {} via {}", email.message_id, settings.smtp_host);
        Ok(())
    }
}

fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> Error {
    let rendered = err.to_string();
    if rendered.to_lowercase().contains("auth") {
        Error::AuthFailed(rendered)
    } else {
        Error::ConnectFailed(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OutboundRequest {
        OutboundRequest {
            to: vec!["bob@example.com".to_string()],
            cc: vec![],
            subject: "budget Q3".to_string(),
            body: "numbers attached next week".to_string(),
            in_reply_to: None,
        }
    }

    #[test]
    fn compose_sets_generated_message_id() {
        let email = compose("alice@example.com", &request()).unwrap();
        assert!(email.message_id.starts_with('<'));
        assert!(email.message_id.ends_with('>'));

        let rendered = String::from_utf8_lossy(&email.rfc5322_bytes);
        assert!(rendered.contains("Subject: budget Q3"));
        assert!(rendered.contains("To: bob@example.com"));
        assert!(rendered.contains(&email.message_id));
    }

    #[test]
    fn compose_rejects_empty_recipients() {
        let mut req = request();
        req.to.clear();
        assert!(matches!(
            compose("alice@example.com", &req),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn compose_rejects_bad_address() {
        let mut req = request();
        req.to = vec!["not an address".to_string()];
        assert!(matches!(
            compose("alice@example.com", &req),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn compose_threads_replies() {
        let mut req = request();
        req.in_reply_to = Some("<parent@x>".to_string());
        let email = compose("alice@example.com", &req).unwrap();
        let rendered = String::from_utf8_lossy(&email.rfc5322_bytes);
        assert!(rendered.contains("In-Reply-To: <parent@x>"));
    }
}
