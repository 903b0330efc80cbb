//! Minimal stand-in for the browser's `File`/`Blob` (§3 DATA MODEL), used by
//! the client's `sendFile` path and the server's auto-resolved stream body.
//! No MIME sniffing and no base64 transcoding: chunks are carried as UTF-8
//! text or raw bytes exactly as produced.

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct FileValue {
    pub bytes: Bytes,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl FileValue {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            file_name: None,
            mime_type: None,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Interprets the contents as UTF-8 text. Returns `None` if the bytes
    /// are not valid UTF-8, mirroring the text codec path this protocol
    /// uses for file streams (no base64 fallback).
    pub fn text(&self) -> Option<String> {
        std::str::from_utf8(&self.bytes).ok().map(str::to_string)
    }
}
