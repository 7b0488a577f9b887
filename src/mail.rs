use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::fmt;
use tracing::{debug, instrument};

const DEFAULT_SMTP_PORT: u16 = 25;

/// A rendered HTML email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}

/// Plain SMTP relay, no authentication or TLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// `relay` is `host` or `host:port`.
    pub fn new(relay: &str) -> Result<Self> {
        let (host, port) = parse_relay(relay)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
            .port(port)
            .build();
        Ok(Self {
            transport,
            host,
            port,
        })
    }
}

fn parse_relay(relay: &str) -> Result<(String, u16)> {
    match relay.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("invalid SMTP port in {relay}"))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(anyhow!("invalid SMTP relay {relay}")),
        None => Ok((relay.to_string(), DEFAULT_SMTP_PORT)),
    }
}

/// Build the MIME message; every recipient goes on the `To` line.
pub fn build_message(email: &Email) -> Result<Message> {
    let from: Mailbox = email
        .from
        .parse()
        .with_context(|| format!("invalid sender address {}", email.from))?;
    let mut builder = Message::builder().from(from).subject(email.subject.clone());
    if email.to.is_empty() {
        return Err(anyhow!("email has no recipients"));
    }
    for to in &email.to {
        let mailbox: Mailbox = to
            .parse()
            .with_context(|| format!("invalid recipient address {to}"))?;
        builder = builder.to(mailbox);
    }
    builder
        .header(ContentType::TEXT_HTML)
        .body(email.html_body.clone())
        .context("failed to build email")
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(skip_all, fields(subject = %email.subject))]
    async fn send(&self, email: &Email) -> Result<()> {
        let message = build_message(email)?;
        debug!(host = %self.host, recipients = email.to.len(), "sending email");
        self.transport
            .send(message)
            .await
            .with_context(|| format!("SMTP relay {} rejected message", self.host))?;
        Ok(())
    }
}
