//! Attachment materialization + per-issue note logs for the work-note relay.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use wnr_core::NoteRecord;

pub const CRATE_NAME: &str = "wnr-storage";

/// Raised when the relational store or the filesystem fails while resolving
/// attachments. Callers treat the entity as attachment-less and continue the
/// cycle.
#[derive(Debug, Error)]
pub enum AttachmentFetchError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("writing attachment {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves zero or more binary attachments for an issue or one of its notes
/// into files on disk.
#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    /// Returns the resolved absolute paths; empty when there are none.
    async fn fetch_attachments(
        &self,
        issue_id: u64,
        note_id: Option<u64>,
    ) -> Result<Vec<PathBuf>, AttachmentFetchError>;
}

/// One materialized attachment file.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Directory an attachment lands in: `bug_<id>`, or `bug_<id>/note_<id>` for
/// note-level attachments.
pub fn attachment_dir(base_dir: &Path, issue_id: u64, note_id: Option<u64>) -> PathBuf {
    let issue_dir = base_dir.join(format!("bug_{issue_id}"));
    match note_id {
        Some(note_id) => issue_dir.join(format!("note_{note_id}")),
        None => issue_dir,
    }
}

/// Writes attachment bytes under `dir` via a temp file + atomic rename.
/// Rewrites are skipped when the target already holds identical bytes.
pub async fn materialize(
    dir: &Path,
    filename: &str,
    bytes: &[u8],
) -> Result<StoredAttachment, AttachmentFetchError> {
    let io_err = |path: &Path, source: std::io::Error| AttachmentFetchError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).await.map_err(|e| io_err(dir, e))?;
    let target = dir.join(filename);

    if let Ok(existing) = fs::read(&target).await {
        if sha256_hex(&existing) == sha256_hex(bytes) {
            debug!(path = %target.display(), "attachment already materialized");
            let path = fs::canonicalize(&target).await.unwrap_or(target);
            return Ok(StoredAttachment {
                path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }
    }

    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    file.flush().await.map_err(|e| io_err(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, &target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(&target, err));
    }

    let path = fs::canonicalize(&target).await.unwrap_or(target);
    Ok(StoredAttachment {
        path,
        byte_size: bytes.len(),
        deduplicated: false,
    })
}

/// Attachment store backed by the tracker's relational database.
pub struct DbAttachmentStore {
    pool: MySqlPool,
    base_dir: PathBuf,
}

impl DbAttachmentStore {
    pub async fn connect(
        database_url: &str,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self, AttachmentFetchError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool, base_dir))
    }

    pub fn with_pool(pool: MySqlPool, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            base_dir: base_dir.into(),
        }
    }

    /// Issue ids touched between `start` and `end` according to the store's
    /// `GetUpdatedIssues` procedure. An alternative discovery path to the
    /// full REST snapshot.
    pub async fn updated_issue_ids(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<u64>, AttachmentFetchError> {
        let rows = sqlx::query("CALL GetUpdatedIssues(?, ?)")
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                row.try_get::<i64, _>("id")
                    .ok()
                    .and_then(|id| u64::try_from(id).ok())
            })
            .collect())
    }

    async fn attachment_rows(
        &self,
        issue_id: u64,
        note_id: Option<u64>,
    ) -> Result<Vec<(String, Vec<u8>)>, sqlx::Error> {
        let rows = match note_id {
            Some(note_id) => {
                sqlx::query("SELECT filename, content FROM bug_file WHERE bug_id = ? AND bugnote_id = ?")
                    .bind(issue_id)
                    .bind(note_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "SELECT filename, content FROM bug_file WHERE bug_id = ? AND bugnote_id IS NULL",
                )
                .bind(issue_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let filename: String = row.try_get("filename")?;
            let content: Vec<u8> = row.try_get("content")?;
            out.push((filename, content));
        }
        Ok(out)
    }
}

#[async_trait]
impl AttachmentResolver for DbAttachmentStore {
    async fn fetch_attachments(
        &self,
        issue_id: u64,
        note_id: Option<u64>,
    ) -> Result<Vec<PathBuf>, AttachmentFetchError> {
        let rows = self.attachment_rows(issue_id, note_id).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let dir = attachment_dir(&self.base_dir, issue_id, note_id);
        let mut paths = Vec::with_capacity(rows.len());
        for (filename, content) in rows {
            let stored = materialize(&dir, &filename, &content).await?;
            paths.push(stored.path);
        }
        Ok(paths)
    }
}

/// Writes newly detected notes to one text log per issue, newest first.
#[derive(Debug, Clone)]
pub struct NoteLogWriter {
    dir: PathBuf,
}

impl NoteLogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn log_path(&self, issue_id: u64) -> PathBuf {
        self.dir.join(format!("ticket_{issue_id}_notes.txt"))
    }

    /// Prepends `notes` (most recent first, equal stamps in input order) to
    /// the issue's log, keeping any previously written content below them.
    /// The rewrite goes through a temp file + rename so existing content
    /// survives an interrupted write.
    pub async fn append(&self, issue_id: u64, notes: &[NoteRecord]) -> std::io::Result<PathBuf> {
        let path = self.log_path(issue_id);
        if notes.is_empty() {
            return Ok(path);
        }

        fs::create_dir_all(&self.dir).await?;
        let existing = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };

        let mut ordered: Vec<&NoteRecord> = notes.iter().collect();
        ordered.sort_by_key(|note| std::cmp::Reverse(note.submitted_at));

        let mut content = String::new();
        for note in ordered {
            content.push_str(&format_block(note));
        }
        content.push_str(&existing);

        let temp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, content.as_bytes()).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(path)
    }
}

fn format_block(note: &NoteRecord) -> String {
    let email = note.reporter_email.as_deref().unwrap_or("");
    let mut block = format!(
        "- {} ({}) ({}): {}\n",
        note.reporter_name, email, note.submitted_at, note.text
    );
    if !note.attachments.is_empty() {
        block.push_str("  Attachments:\n");
        for path in &note.attachments {
            block.push_str(&format!("  - {}\n", path.display()));
        }
    }
    block
}
