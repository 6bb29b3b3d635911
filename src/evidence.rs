// src/evidence.rs
//
// Receipt files uploaded with self-attested payments, and the owner-only
// read path in front of them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use crate::error::{AppError, AppResult};
use crate::models::{Channel, Role};
use crate::store::PaymentStore;

pub const MAX_EVIDENCE_BYTES: usize = 10 * 1024 * 1024;

/// Sniffable types accepted as payment evidence, with the extension stored.
const ACCEPTED: [(&str, &str); 5] = [
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("application/pdf", "pdf"),
];

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("invalid evidence file name")]
    InvalidName,

    #[error("evidence file not found")]
    Missing,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object storage error: {0}")]
    Backend(String),
}

/// Detects the MIME type from the leading bytes. Returns `(mime, extension)`
/// only for accepted receipt formats.
pub fn sniff(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    let kind = infer::get(bytes)?;
    ACCEPTED
        .iter()
        .find(|(mime, _)| *mime == kind.mime_type())
        .copied()
}

/// Content type served for a stored evidence file.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Reduces a requested name to its basename and rejects anything outside
/// `[A-Za-z0-9._-]` or starting with a dot.
pub fn sanitize_filename(raw: &str) -> Result<&str, EvidenceError> {
    let base = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    let valid_chars = base
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if base.is_empty() || base.len() > 255 || base.starts_with('.') || !valid_chars {
        return Err(EvidenceError::InvalidName);
    }
    Ok(base)
}

/// Random, unguessable storage name for a new receipt.
pub fn generate_name(extension: &str) -> String {
    let bytes: [u8; 16] = rand::random();
    format!("{}.{extension}", hex::encode(bytes))
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn put(&self, channel: Channel, name: &str, bytes: &[u8], mime: &str)
        -> Result<(), EvidenceError>;
    async fn get(&self, channel: Channel, name: &str) -> Result<Vec<u8>, EvidenceError>;
    async fn delete(&self, channel: Channel, name: &str) -> Result<(), EvidenceError>;
}

/// Receipts on local disk, one directory per channel.
pub struct FsEvidenceStore {
    root: PathBuf,
}

impl FsEvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, channel: Channel, name: &str) -> PathBuf {
        self.root.join(channel.evidence_dir()).join(name)
    }
}

#[async_trait]
impl EvidenceStore for FsEvidenceStore {
    async fn put(
        &self,
        channel: Channel,
        name: &str,
        bytes: &[u8],
        _mime: &str,
    ) -> Result<(), EvidenceError> {
        let dir = self.root.join(channel.evidence_dir());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(name), bytes).await?;
        Ok(())
    }

    async fn get(&self, channel: Channel, name: &str) -> Result<Vec<u8>, EvidenceError> {
        match tokio::fs::read(self.path(channel, name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EvidenceError::Missing),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, channel: Channel, name: &str) -> Result<(), EvidenceError> {
        match tokio::fs::remove_file(self.path(channel, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Receipts in an S3-compatible bucket under `<channel dir>/<name>`.
pub struct S3EvidenceStore {
    client: S3Client,
    bucket: String,
}

impl S3EvidenceStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    fn key(channel: Channel, name: &str) -> String {
        format!("{}/{}", channel.evidence_dir(), name)
    }
}

#[async_trait]
impl EvidenceStore for S3EvidenceStore {
    async fn put(
        &self,
        channel: Channel,
        name: &str,
        bytes: &[u8],
        mime: &str,
    ) -> Result<(), EvidenceError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::key(channel, name))
            .content_type(mime)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| EvidenceError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, channel: Channel, name: &str) -> Result<Vec<u8>, EvidenceError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::key(channel, name))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    EvidenceError::Missing
                } else {
                    EvidenceError::Backend(e.to_string())
                }
            })?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| EvidenceError::Backend(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, channel: Channel, name: &str) -> Result<(), EvidenceError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(Self::key(channel, name))
            .send()
            .await
            .map_err(|e| EvidenceError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// A receipt ready to be served.
#[derive(Debug)]
pub struct EvidenceFile {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Serves receipts to the payment owner or an admin.
pub struct Gatekeeper {
    store: Arc<dyn PaymentStore>,
    evidence: Arc<dyn EvidenceStore>,
}

impl Gatekeeper {
    pub fn new(store: Arc<dyn PaymentStore>, evidence: Arc<dyn EvidenceStore>) -> Self {
        Self { store, evidence }
    }

    pub async fn read(&self, requested: &str, viewer_id: i32, role: Role) -> AppResult<EvidenceFile> {
        let filename = sanitize_filename(requested)?;

        let payment = self
            .store
            .find_payment_by_evidence(filename)
            .await?
            .ok_or(AppError::NotFound("evidence"))?;

        if payment.principal_id != viewer_id && role != Role::Admin {
            log::warn!(
                "evidence {filename} requested by principal {viewer_id}, owned by {}",
                payment.principal_id
            );
            return Err(AppError::Authorization);
        }

        let bytes = self.evidence.get(payment.channel, filename).await?;
        Ok(EvidenceFile {
            filename: filename.to_string(),
            content_type: content_type_for(filename),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 16] = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, 0x49, 0x48, 0x44, 0x52,
    ];

    #[test]
    fn sniffs_accepted_types_only() {
        assert_eq!(sniff(&PNG_HEADER), Some(("image/png", "png")));
        assert_eq!(sniff(b"%PDF-1.7\n%..."), Some(("application/pdf", "pdf")));
        assert_eq!(sniff(b"plain text is not a receipt"), None);
        // zip archives are recognised by infer but not accepted
        assert_eq!(sniff(&[0x50, 0x4B, 0x03, 0x04, 0, 0, 0, 0]), None);
    }

    #[test]
    fn sanitize_keeps_basename_only() {
        assert_eq!(sanitize_filename("abc123.png").unwrap(), "abc123.png");
        assert_eq!(sanitize_filename("../../etc/abc.png").unwrap(), "abc.png");
        assert_eq!(sanitize_filename("..\\secret\\r.pdf").unwrap(), "r.pdf");
        assert!(sanitize_filename("../").is_err());
        assert!(sanitize_filename(".env").is_err());
        assert!(sanitize_filename("a b.png").is_err());
        assert!(sanitize_filename("").is_err());
    }

    #[test]
    fn content_type_table() {
        assert_eq!(content_type_for("x.JPG"), "image/jpeg");
        assert_eq!(content_type_for("x.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("x.pdf"), "application/pdf");
        assert_eq!(content_type_for("x.exe"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn generated_names_are_hex_with_extension() {
        let name = generate_name("png");
        assert_eq!(name.len(), 32 + 4);
        assert!(name.ends_with(".png"));
        assert!(sanitize_filename(&name).is_ok());
        assert_ne!(name, generate_name("png"));
    }

    #[tokio::test]
    async fn fs_store_round_trip_and_idempotent_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEvidenceStore::new(dir.path());
        store
            .put(Channel::BankTransfer, "r.png", &PNG_HEADER, "image/png")
            .await
            .unwrap();
        assert!(dir.path().join("bank-transfer").join("r.png").exists());
        assert_eq!(store.get(Channel::BankTransfer, "r.png").await.unwrap(), PNG_HEADER);
        assert!(matches!(
            store.get(Channel::MobileWallet, "r.png").await,
            Err(EvidenceError::Missing)
        ));
        store.delete(Channel::BankTransfer, "r.png").await.unwrap();
        store.delete(Channel::BankTransfer, "r.png").await.unwrap();
    }
}
