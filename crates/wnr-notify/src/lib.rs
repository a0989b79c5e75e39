//! Queue + mail transports and the drain-and-email mode for the work-note
//! relay.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wnr-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("queue io at {}: {source}", path.display())]
    QueueIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("queue message {} is not valid JSON: {source}", path.display())]
    QueueDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("building mail message: {0}")]
    MailBuild(#[from] lettre::error::Error),
    #[error("invalid mail address {address}: {source}")]
    MailAddress {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("smtp send failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Queue the dispatcher hands label+body messages to. Implementations must
/// never block indefinitely on `receive`.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn send(&self, label: &str, body: &str) -> Result<(), NotifyError>;

    /// Oldest pending message, or `None` when the queue is empty.
    async fn receive(&self) -> Result<Option<(String, String)>, NotifyError>;

    /// Removes the oldest pending message carrying `label`.
    async fn delete(&self, label: &str) -> Result<(), NotifyError>;
}

/// Directory-backed queue: one JSON file per message, named by a zero-padded
/// sequence so lexical order is FIFO order. `receive` returns immediately
/// when the spool is empty.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct SpoolMessage {
    label: String,
    body: String,
}

impl SpoolQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn entries(&self) -> Result<Vec<PathBuf>, NotifyError> {
        let io_err = |source| NotifyError::QueueIo {
            path: self.dir.clone(),
            source,
        };

        let mut reader = match fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(err)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn next_sequence(paths: &[PathBuf]) -> u64 {
        paths
            .iter()
            .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()))
            .filter_map(|stem| stem.split('_').next())
            .filter_map(|head| head.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1)
    }

    async fn read_message(&self, path: &Path) -> Result<SpoolMessage, NotifyError> {
        let bytes = fs::read(path).await.map_err(|source| NotifyError::QueueIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| NotifyError::QueueDecode {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
impl QueueTransport for SpoolQueue {
    async fn send(&self, label: &str, body: &str) -> Result<(), NotifyError> {
        let io_err = |path: &Path, source| NotifyError::QueueIo {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;
        let sequence = Self::next_sequence(&self.entries().await?);
        let name = format!("{sequence:020}_{}.json", Uuid::new_v4());
        let target = self.dir.join(name);

        let payload = serde_json::to_vec_pretty(&SpoolMessage {
            label: label.to_string(),
            body: body.to_string(),
        })
        .expect("spool message serializes");

        // Temp file + rename so a concurrent receive never sees a partial
        // message.
        let temp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &payload)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        fs::rename(&temp_path, &target)
            .await
            .map_err(|e| io_err(&target, e))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<(String, String)>, NotifyError> {
        match self.entries().await?.first() {
            Some(path) => {
                let message = self.read_message(path).await?;
                Ok(Some((message.label, message.body)))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, label: &str) -> Result<(), NotifyError> {
        for path in self.entries().await? {
            let message = self.read_message(&path).await?;
            if message.label == label {
                return fs::remove_file(&path).await.map_err(|source| NotifyError::QueueIo {
                    path: path.clone(),
                    source,
                });
            }
        }
        Ok(())
    }
}

/// Outbound mail contract for the drain mode.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        to: &[String],
        attachments: &[PathBuf],
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub password: String,
}

/// STARTTLS SMTP implementation of [`MailTransport`].
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|source| NotifyError::MailAddress {
                address: config.from.clone(),
                source,
            })?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(config.from.clone(), config.password.clone()))
            .build();
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        subject: &str,
        body: &str,
        to: &[String],
        attachments: &[PathBuf],
    ) -> Result<(), NotifyError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for address in to {
            let mailbox = address
                .parse::<Mailbox>()
                .map_err(|source| NotifyError::MailAddress {
                    address: address.clone(),
                    source,
                })?;
            builder = builder.to(mailbox);
        }

        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
        for path in attachments {
            match fs::read(path).await {
                Ok(bytes) => {
                    let filename = path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_else(|| "attachment".to_string());
                    multipart = multipart.singlepart(
                        Attachment::new(filename).body(
                            bytes,
                            ContentType::parse("application/octet-stream")
                                .expect("static content type"),
                        ),
                    );
                }
                Err(err) => {
                    warn!(path = %path.display(), "skipping unreadable attachment: {err}");
                }
            }
        }

        let message = builder.multipart(multipart)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub default_recipient: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub drained: usize,
    pub mailed: usize,
}

/// Drains every queued message into one email each. Recipients are the
/// default address plus any addresses embedded in the body; attachments are
/// the resolved paths embedded in the body. A mail failure leaves the
/// message queued for the next drain.
pub async fn drain_queue_to_mail(
    queue: &dyn QueueTransport,
    mailer: &dyn MailTransport,
    options: &DrainOptions,
) -> Result<DrainSummary, NotifyError> {
    let mut summary = DrainSummary::default();

    while let Some((label, body)) = queue.receive().await? {
        summary.drained += 1;
        let (recipients, attachments, filtered_body) =
            prepare_mail(&body, &options.default_recipient);

        match mailer
            .send(&label, &filtered_body, &recipients, &attachments)
            .await
        {
            Ok(()) => {
                summary.mailed += 1;
                info!(label = %label, "mailed queued message");
                queue.delete(&label).await?;
            }
            Err(err) => {
                warn!(label = %label, "mail send failed, leaving message queued: {err}");
                break;
            }
        }
    }

    Ok(summary)
}

/// Splits a queued JSON body into recipients (default plus any `email`-keyed
/// values, deduplicated), attachment paths (`Attachments Path`-keyed
/// values), and the body with attachment keys filtered out. Non-JSON bodies
/// pass through untouched.
pub fn prepare_mail(body: &str, default_recipient: &str) -> (Vec<String>, Vec<PathBuf>, String) {
    let mut recipients = vec![default_recipient.to_string()];
    let Ok(Value::Object(record)) = serde_json::from_str::<Value>(body) else {
        return (recipients, Vec::new(), body.to_string());
    };

    let mut attachments = Vec::new();
    let mut filtered = serde_json::Map::new();
    for (key, value) in record {
        if key.contains("Attachments Path") {
            if let Value::Array(paths) = &value {
                attachments.extend(paths.iter().filter_map(Value::as_str).map(PathBuf::from));
            }
            continue;
        }
        if key.to_lowercase().contains("email") {
            if let Some(address) = value.as_str() {
                if !address.is_empty() && !recipients.iter().any(|existing| existing == address) {
                    recipients.push(address.to_string());
                }
            }
        }
        filtered.insert(key, value);
    }

    let body = serde_json::to_string_pretty(&filtered).expect("filtered body serializes");
    (recipients, attachments, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, Vec<String>, Vec<PathBuf>)>>,
    }

    #[async_trait]
    impl MailTransport for RecordingMailer {
        async fn send(
            &self,
            subject: &str,
            _body: &str,
            to: &[String],
            attachments: &[PathBuf],
        ) -> Result<(), NotifyError> {
            self.sent.lock().expect("lock").push((
                subject.to_string(),
                to.to_vec(),
                attachments.to_vec(),
            ));
            Ok(())
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl MailTransport for FailingMailer {
        async fn send(
            &self,
            _subject: &str,
            _body: &str,
            _to: &[String],
            _attachments: &[PathBuf],
        ) -> Result<(), NotifyError> {
            Err(NotifyError::MailBuild(
                Message::builder()
                    .body(String::new())
                    .expect_err("message without sender cannot build"),
            ))
        }
    }

    #[tokio::test]
    async fn spool_round_trips_in_fifo_order() {
        let dir = tempdir().expect("tempdir");
        let queue = SpoolQueue::new(dir.path());

        queue.send("first", "body-1").await.expect("send");
        queue.send("second", "body-2").await.expect("send");

        let (label, body) = queue.receive().await.expect("receive").expect("message");
        assert_eq!(label, "first");
        assert_eq!(body, "body-1");

        queue.delete("first").await.expect("delete");
        let (label, _) = queue.receive().await.expect("receive").expect("message");
        assert_eq!(label, "second");

        queue.delete("second").await.expect("delete");
        assert!(queue.receive().await.expect("receive").is_none());
    }

    #[tokio::test]
    async fn delete_removes_only_the_oldest_with_that_label() {
        let dir = tempdir().expect("tempdir");
        let queue = SpoolQueue::new(dir.path());

        queue.send("dup", "older").await.expect("send");
        queue.send("dup", "newer").await.expect("send");
        queue.delete("dup").await.expect("delete");

        let (_, body) = queue.receive().await.expect("receive").expect("message");
        assert_eq!(body, "newer");
    }

    #[tokio::test]
    async fn receive_on_a_missing_directory_is_empty_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let queue = SpoolQueue::new(dir.path().join("never-created"));
        assert!(queue.receive().await.expect("receive").is_none());
    }

    #[test]
    fn prepare_mail_collects_recipients_and_attachments() {
        let body = serde_json::json!({
            "Issue Id": 42,
            "Work Note Reporter.email": "alice@example.test",
            "Work Note Attachments Path": ["/data/bug_42/note_1/a.png"],
            "Work Note Text": "see attachment"
        })
        .to_string();

        let (recipients, attachments, filtered) = prepare_mail(&body, "oncall@example.test");
        assert_eq!(recipients, ["oncall@example.test", "alice@example.test"]);
        assert_eq!(attachments, [PathBuf::from("/data/bug_42/note_1/a.png")]);
        assert!(!filtered.contains("Attachments Path"));
        assert!(filtered.contains("Work Note Text"));
    }

    #[test]
    fn prepare_mail_deduplicates_the_default_recipient() {
        let body = serde_json::json!({"Issue Assignee": "oncall@example.test"}).to_string();
        let (recipients, _, _) = prepare_mail(&body, "oncall@example.test");
        assert_eq!(recipients, ["oncall@example.test"]);
    }

    #[test]
    fn prepare_mail_passes_non_json_bodies_through() {
        let (recipients, attachments, body) = prepare_mail("plain text", "oncall@example.test");
        assert_eq!(recipients, ["oncall@example.test"]);
        assert!(attachments.is_empty());
        assert_eq!(body, "plain text");
    }

    #[tokio::test]
    async fn drain_mails_and_deletes_each_message() {
        let dir = tempdir().expect("tempdir");
        let queue = SpoolQueue::new(dir.path());
        queue
            .send("Issue Id - 1 :: crash", "{\"Issue Id\": 1}")
            .await
            .expect("send");
        queue
            .send("Issue Id - 2 :: hang", "{\"Issue Id\": 2}")
            .await
            .expect("send");

        let mailer = RecordingMailer::default();
        let summary = drain_queue_to_mail(
            &queue,
            &mailer,
            &DrainOptions {
                default_recipient: "oncall@example.test".to_string(),
            },
        )
        .await
        .expect("drain");

        assert_eq!(summary, DrainSummary { drained: 2, mailed: 2 });
        assert!(queue.receive().await.expect("receive").is_none());
        let sent = mailer.sent.lock().expect("lock");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "Issue Id - 1 :: crash");
    }

    #[tokio::test]
    async fn drain_leaves_the_message_queued_when_mail_fails() {
        let dir = tempdir().expect("tempdir");
        let queue = SpoolQueue::new(dir.path());
        queue.send("stuck", "{}").await.expect("send");

        let summary = drain_queue_to_mail(
            &queue,
            &FailingMailer,
            &DrainOptions {
                default_recipient: "oncall@example.test".to_string(),
            },
        )
        .await
        .expect("drain");

        assert_eq!(summary, DrainSummary { drained: 1, mailed: 0 });
        assert!(queue.receive().await.expect("receive").is_some());
    }
}
