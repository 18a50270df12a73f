//! Response model, with a body sink that spills to disk past a threshold.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

#[cfg(test)]
use crate::error::ErrorKind;
use crate::error::ErrorResponse;
use crate::headers::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http11,
    H2,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http11 => "1.1",
            Version::H2 => "2.0",
        }
    }
}

enum Storage {
    Memory(Vec<u8>),
    /// Spilled to an unlinked temp file; `len` tracks total bytes written.
    File { file: File, len: u64 },
}

/// Byte sink for a response body. Accumulates in memory until
/// `threshold` bytes, then moves to a temp file.
pub struct ResponseBody {
    storage: Storage,
    threshold: usize,
}

impl ResponseBody {
    pub fn new(threshold: usize) -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            threshold,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.storage {
            Storage::Memory(buf) => {
                if buf.len() + bytes.len() > self.threshold {
                    let mut file = tempfile::tempfile()?;
                    file.write_all(buf)?;
                    file.write_all(bytes)?;
                    let len = (buf.len() + bytes.len()) as u64;
                    self.storage = Storage::File { file, len };
                } else {
                    buf.extend_from_slice(bytes);
                }
            }
            Storage::File { file, len } => {
                file.write_all(bytes)?;
                *len += bytes.len() as u64;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        match &self.storage {
            Storage::Memory(buf) => buf.len() as u64,
            Storage::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.storage, Storage::File { .. })
    }

    /// Stream the body into `sink`. Position-safe: further writes append.
    pub fn copy_to<W: Write>(&mut self, sink: &mut W) -> io::Result<u64> {
        match &mut self.storage {
            Storage::Memory(buf) => {
                sink.write_all(buf)?;
                Ok(buf.len() as u64)
            }
            Storage::File { file, len } => {
                file.seek(SeekFrom::Start(0))?;
                let copied = io::copy(file, sink)?;
                file.seek(SeekFrom::Start(*len))?;
                Ok(copied)
            }
        }
    }

    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.storage {
            Storage::Memory(buf) => Ok(buf.clone()),
            Storage::File { file, len } => {
                let mut out = Vec::with_capacity(*len as usize);
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut out)?;
                file.seek(SeekFrom::Start(*len))?;
                Ok(out)
            }
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("len", &self.len())
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}

/// An HTTP response. Headers arrive first; the body fills in as the engine
/// delivers data, and `complete` flips once end-of-stream is signalled.
#[derive(Debug)]
pub struct Response {
    status: u16,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
    complete: bool,
}

impl Response {
    pub fn new(status: u16, version: Version, headers: HeaderMap, body_threshold: usize) -> Self {
        Self {
            status,
            version,
            headers,
            body: ResponseBody::new(body_threshold),
            complete: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Body as a UTF-8 string (lossy).
    pub fn text(&mut self) -> io::Result<String> {
        let bytes = self.body.to_vec()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Statuses >= 400 become an [`ErrorKind::Http`] error; anything lower
    /// passes through untouched.
    pub fn raise_for_status(&self) -> Result<(), ErrorResponse> {
        if self.status >= 400 {
            return Err(ErrorResponse::http(self.status));
        }
        Ok(())
    }
}
