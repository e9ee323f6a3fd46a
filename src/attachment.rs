//! Attachments, compression and scoped temporary storage.

use crate::error::As4Error;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Domain part of generated content and message ids.
pub const ID_DOMAIN: &str = "as4-envelope";

/// Generate a fresh `{uuid}@as4-envelope` identifier.
pub fn generate_id() -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), ID_DOMAIN)
}

/// Supported payload compression modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    Gzip,
}

impl CompressionMode {
    /// MIME type announced in the `CompressionType` part property.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Gzip => "application/gzip",
        }
    }

    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let mime_type = mime_type.trim();
        [Self::Gzip]
            .into_iter()
            .find(|m| m.mime_type().eq_ignore_ascii_case(mime_type))
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, As4Error> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress at most `limit` bytes of output; larger output is malformed.
    pub fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, As4Error> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit as usize));
        match self {
            Self::Gzip => {
                GzDecoder::new(data).take(limit.saturating_add(1)).read_to_end(&mut out)?;
            }
        }
        if out.len() as u64 > limit {
            return Err(As4Error::malformed(format!(
                "decompressed content exceeds {} bytes",
                limit
            )));
        }
        Ok(out)
    }
}

/// Where the bytes of an attachment live.
#[derive(Debug, Clone)]
pub enum ByteSource {
    Memory(Arc<[u8]>),
    /// File read on demand; temp files are owned by a [`ResourceManager`]
    File(PathBuf),
}

/// A payload carried outside the SOAP body.
#[derive(Debug, Clone)]
pub struct Attachment {
    content_id: String,
    mime_type: String,
    compression: Option<CompressionMode>,
    source: ByteSource,
    size: u64,
    headers: Vec<(String, String)>,
}

impl Attachment {
    /// In-memory attachment with an explicit content id.
    pub fn from_bytes(
        content_id: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        Self {
            content_id: content_id.into(),
            mime_type: mime_type.into(),
            compression: None,
            size: bytes.len() as u64,
            source: ByteSource::Memory(bytes),
            headers: Vec::new(),
        }
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn compression(&self) -> Option<CompressionMode> {
        self.compression
    }

    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    /// Size of the bytes as transported (after compression).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Additional MIME part headers.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_compression(mut self, compression: Option<CompressionMode>) -> Self {
        self.compression = compression;
        self
    }

    /// `cid:` reference used in PartInfo hrefs and signature references.
    pub fn href(&self) -> String {
        format!("{}{}", crate::model::CID_PREFIX, self.content_id)
    }

    /// Read the transported bytes.
    pub fn read_bytes(&self) -> Result<Vec<u8>, As4Error> {
        match &self.source {
            ByteSource::Memory(bytes) => Ok(bytes.to_vec()),
            ByteSource::File(path) => Ok(std::fs::read(path)?),
        }
    }

    /// Copy with the same identity but different content.
    pub fn with_content(&self, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        Self {
            content_id: self.content_id.clone(),
            mime_type: mime_type.into(),
            compression: self.compression,
            size: bytes.len() as u64,
            source: ByteSource::Memory(bytes),
            headers: self.headers.clone(),
        }
    }

    /// Uncompressed copy of a compressed attachment.
    pub fn decompressed(&self, mode: CompressionMode, limit: u64) -> Result<Self, As4Error> {
        let plain = mode.decompress(&self.read_bytes()?, limit)?;
        let mut copy = self.with_content(self.mime_type.clone(), plain);
        copy.compression = None;
        Ok(copy)
    }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Owns temporary resources of one build or send operation.
///
/// Registered disposers run exactly once, on [`close`](Self::close) or on drop,
/// whichever comes first.
pub struct ResourceManager {
    temp_dir: Option<TempDir>,
    disposers: Vec<Disposer>,
    closed: bool,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            temp_dir: None,
            disposers: Vec::new(),
            closed: false,
        }
    }

    /// Scratch directory, created on first use.
    pub fn temp_dir(&mut self) -> Result<&Path, As4Error> {
        if self.closed {
            return Err(As4Error::precondition("resource manager is already closed"));
        }
        if self.temp_dir.is_none() {
            self.temp_dir = Some(tempfile::Builder::new().prefix("as4-").tempdir()?);
        }
        match self.temp_dir {
            Some(ref dir) => Ok(dir.path()),
            None => Err(As4Error::precondition("temporary directory unavailable")),
        }
    }

    pub fn register(&mut self, disposer: impl FnOnce() + Send + 'static) {
        if self.closed {
            disposer();
        } else {
            self.disposers.push(Box::new(disposer));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release every registered resource. Later calls do nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let count = self.disposers.len();
        for disposer in self.disposers.drain(..).rev() {
            disposer();
        }
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary directory");
            }
        }
        debug!(resources = count, "Resources released");
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Collects outgoing attachments for one message.
#[derive(Default)]
pub struct AttachmentStore {
    resources: ResourceManager,
    attachments: Vec<Attachment>,
}

impl AttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. With compression the compressed bytes are spooled to a
    /// temporary file; otherwise the file is read on demand.
    pub fn add_outgoing_file(
        &mut self,
        path: impl AsRef<Path>,
        mime_type: &str,
        compression: Option<CompressionMode>,
    ) -> Result<Attachment, As4Error> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(As4Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            )));
        }

        let content_id = generate_id();
        let (source, size) = match compression {
            Some(mode) => {
                let compressed = mode.compress(&std::fs::read(path)?)?;
                let spooled = self.temp_dir()?.join(content_id.replace('@', "_"));
                std::fs::write(&spooled, &compressed)?;
                let disposable = spooled.clone();
                self.resources.register(move || {
                    if let Err(e) = std::fs::remove_file(&disposable) {
                        debug!(path = %disposable.display(), error = %e, "Spooled attachment already gone");
                    }
                });
                (ByteSource::File(spooled), compressed.len() as u64)
            }
            None => (ByteSource::File(path.to_path_buf()), metadata.len()),
        };

        let attachment = Attachment {
            content_id,
            mime_type: mime_type.to_string(),
            compression,
            source,
            size,
            headers: Vec::new(),
        };
        self.push(attachment.clone());
        Ok(attachment)
    }

    /// Add an in-memory payload.
    pub fn add_outgoing_bytes(
        &mut self,
        bytes: &[u8],
        mime_type: &str,
        compression: Option<CompressionMode>,
    ) -> Result<Attachment, As4Error> {
        let payload = match compression {
            Some(mode) => mode.compress(bytes)?,
            None => bytes.to_vec(),
        };
        let attachment =
            Attachment::from_bytes(generate_id(), mime_type, payload).with_compression(compression);
        self.push(attachment.clone());
        Ok(attachment)
    }

    fn push(&mut self, attachment: Attachment) {
        debug!(
            content_id = %attachment.content_id,
            mime_type = %attachment.mime_type,
            compression = ?attachment.compression,
            size = attachment.size,
            "Attachment added"
        );
        let content_id = attachment.content_id.clone();
        self.resources
            .register(move || debug!(content_id = %content_id, "Attachment released"));
        self.attachments.push(attachment);
    }

    fn temp_dir(&mut self) -> Result<PathBuf, As4Error> {
        self.resources.temp_dir().map(Path::to_path_buf)
    }

    /// Attachments in insertion order.
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }

    /// Release all temporary resources.
    pub fn close(&mut self) {
        self.resources.close();
    }
}

impl std::fmt::Debug for AttachmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentStore")
            .field("attachments", &self.attachments)
            .field("closed", &self.resources.is_closed())
            .finish()
    }
}
