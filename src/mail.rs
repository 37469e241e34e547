use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::observability::MAIL_TOTAL;

/// Placeholder a named template carries for the message body.
const BODY_PLACEHOLDER: &str = "[%body%]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailData {
    pub to: String,
    pub from: String,
    pub subject: String,
    /// HTML body, or the fragment substituted into `template`.
    pub content: String,
    pub template: Option<String>,
}

#[derive(Debug)]
pub enum MailError {
    Template { name: String, source: std::io::Error },
    Delivery(String),
}

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailError::Template { name, source } => {
                write!(f, "cannot load mail template {name}: {source}")
            }
            MailError::Delivery(e) => write!(f, "mail delivery failed: {e}"),
        }
    }
}

impl std::error::Error for MailError {}

/// Outbound transport. Implementations receive the fully rendered body.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &MailData, body: &str) -> Result<(), MailError>;
}

/// Transport that records each message as a structured log line.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, message: &MailData, body: &str) -> Result<(), MailError> {
        tracing::info!(
            to = %message.to,
            from = %message.from,
            subject = %message.subject,
            bytes = body.len(),
            "mail sent"
        );
        Ok(())
    }
}

/// Producer side of the bounded mail queue. Cloneable; the worker exits
/// once every clone is dropped.
#[derive(Clone)]
pub struct MailQueue {
    tx: mpsc::Sender<MailData>,
}

impl MailQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MailData>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue without waiting. Returns false if the message was dropped.
    pub fn enqueue(&self, message: MailData) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                metrics::counter!(MAIL_TOTAL, "status" => "queued").increment(1);
                true
            }
            Err(TrySendError::Full(m)) => {
                metrics::counter!(MAIL_TOTAL, "status" => "dropped").increment(1);
                tracing::warn!(
                    to = %m.to,
                    subject = %m.subject,
                    "mail queue full, message dropped"
                );
                false
            }
            Err(TrySendError::Closed(m)) => {
                metrics::counter!(MAIL_TOTAL, "status" => "dropped").increment(1);
                tracing::warn!(
                    to = %m.to,
                    subject = %m.subject,
                    "mail worker gone, message dropped"
                );
                false
            }
        }
    }
}

/// Body to hand the transport: the raw content, or the named template with
/// its first placeholder replaced by the content.
pub async fn render_body(template_dir: &Path, message: &MailData) -> Result<String, MailError> {
    let Some(name) = &message.template else {
        return Ok(message.content.clone());
    };
    let template = tokio::fs::read_to_string(template_dir.join(name))
        .await
        .map_err(|source| MailError::Template {
            name: name.clone(),
            source,
        })?;
    Ok(template.replacen(BODY_PLACEHOLDER, &message.content, 1))
}

/// Drain the queue until every producer is gone. Failures are logged and
/// never reach the code that queued the message.
pub async fn run_mail_worker(
    mut rx: mpsc::Receiver<MailData>,
    mailer: Arc<dyn Mailer>,
    template_dir: PathBuf,
) {
    while let Some(message) = rx.recv().await {
        let body = match render_body(&template_dir, &message).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(subject = %message.subject, "{e}; sending raw body");
                message.content.clone()
            }
        };
        match mailer.deliver(&message, &body).await {
            Ok(()) => metrics::counter!(MAIL_TOTAL, "status" => "sent").increment(1),
            Err(e) => {
                metrics::counter!(MAIL_TOTAL, "status" => "failed").increment(1);
                tracing::error!(to = %message.to, subject = %message.subject, "{e}");
            }
        }
    }
    tracing::info!("mail worker stopped");
}
