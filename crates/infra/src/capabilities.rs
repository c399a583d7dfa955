//! Capabilities the contact sync job needs from the rest of the client.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use contactsync_core::LocalIdentifiers;

use crate::jobs::PayloadDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),
    /// The payload cannot be produced from this descriptor.
    #[error("attachment unavailable: {0}")]
    Unavailable(String),
    #[error("attachment read failed: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    /// Whether retrying the same descriptor later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Unavailable(_) => false,
            DownloadError::Io(e) => e.kind() != io::ErrorKind::NotFound,
        }
    }
}

/// Produces the plaintext contact stream a job descriptor points at.
#[async_trait]
pub trait AttachmentDownloader: Send + Sync {
    async fn download_and_decrypt(
        &self,
        descriptor: &PayloadDescriptor,
    ) -> Result<Bytes, DownloadError>;
}

/// Reads payloads from local disk.
///
/// `Downloaded` paths are used as given (relative paths resolve against the
/// attachments directory); a `LegacyAttachment` id names a file in the
/// attachments directory. Remote pointers need a network client and are
/// reported as unavailable.
#[derive(Debug, Clone)]
pub struct FileAttachmentDownloader {
    attachments_dir: PathBuf,
}

impl FileAttachmentDownloader {
    pub fn new(attachments_dir: impl Into<PathBuf>) -> Self {
        Self {
            attachments_dir: attachments_dir.into(),
        }
    }

    fn resolve(&self, descriptor: &PayloadDescriptor) -> Result<PathBuf, DownloadError> {
        match descriptor {
            PayloadDescriptor::Downloaded { path } if path.is_absolute() => Ok(path.clone()),
            PayloadDescriptor::Downloaded { path } => Ok(self.attachments_dir.join(path)),
            PayloadDescriptor::LegacyAttachment { attachment_id } => {
                let mut components = Path::new(attachment_id).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(name)), None) => Ok(self.attachments_dir.join(name)),
                    _ => Err(DownloadError::Unavailable(format!(
                        "invalid attachment id {attachment_id:?}"
                    ))),
                }
            }
            PayloadDescriptor::Transient { pointer } => Err(DownloadError::Unavailable(format!(
                "remote attachment {} needs a network downloader",
                pointer.cdn_key
            ))),
            PayloadDescriptor::Invalid => Err(DownloadError::Unavailable(
                "descriptor references no attachment".to_string(),
            )),
        }
    }
}

#[async_trait]
impl AttachmentDownloader for FileAttachmentDownloader {
    async fn download_and_decrypt(
        &self,
        descriptor: &PayloadDescriptor,
    ) -> Result<Bytes, DownloadError> {
        let path = self.resolve(descriptor)?;
        let bytes = tokio::fs::read(&path).await?;
        tracing::debug!(path = %path.display(), len = bytes.len(), "read contact sync payload");
        Ok(Bytes::from(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("local account is not registered")]
pub struct NotRegistered;

/// Source of the local user's own identifiers.
pub trait LocalIdentityProvider: Send + Sync {
    fn local_identifiers(&self) -> Result<LocalIdentifiers, NotRegistered>;
}

/// Fixed identity, for tools and tests. `None` means not registered.
#[derive(Debug, Clone, Default)]
pub struct StaticLocalIdentity(Option<LocalIdentifiers>);

impl StaticLocalIdentity {
    pub fn registered(identifiers: LocalIdentifiers) -> Self {
        Self(Some(identifiers))
    }

    pub fn unregistered() -> Self {
        Self(None)
    }
}

impl LocalIdentityProvider for StaticLocalIdentity {
    fn local_identifiers(&self) -> Result<LocalIdentifiers, NotRegistered> {
        self.0.clone().ok_or(NotRegistered)
    }
}
