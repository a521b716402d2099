//! # Deferred and Self-Cleaning Streams
//!
//! Two `io::Read` adaptors the puller threads through the volume backend:
//!
//! - [`LazyReader`] defers a stream factory until the first `read`, so a
//!   backend that already has a layer cached never triggers the download.
//! - [`BlobReader`] reads a verified temp file and removes it on drop, so
//!   downloaded blobs never outlive their unpack.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

type StreamFactory<'a> = Box<dyn FnOnce() -> Result<Box<dyn Read + 'a>> + 'a>;

enum LazyState<'a> {
    Pending(StreamFactory<'a>),
    Active(Box<dyn Read + 'a>),
    Failed(String),
}

/// `io::Read` that materializes its inner stream on first read.
///
/// The factory runs at most once. A factory failure is remembered and every
/// subsequent read reports the same error. Dropping an unread `LazyReader`
/// never invokes the factory.
pub struct LazyReader<'a> {
    state: LazyState<'a>,
}

impl<'a> LazyReader<'a> {
    pub fn new<F>(factory: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Read + 'a>> + 'a,
    {
        Self {
            state: LazyState::Pending(Box::new(factory)),
        }
    }
}

impl Read for LazyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let LazyState::Pending(_) = self.state {
            let factory = match std::mem::replace(
                &mut self.state,
                LazyState::Failed("stream factory already taken".to_string()),
            ) {
                LazyState::Pending(f) => f,
                _ => unreachable!(),
            };
            match factory() {
                Ok(inner) => self.state = LazyState::Active(inner),
                Err(e) => self.state = LazyState::Failed(e.to_string()),
            }
        }
        match &mut self.state {
            LazyState::Active(inner) => inner.read(buf),
            LazyState::Failed(msg) => Err(io::Error::new(io::ErrorKind::Other, msg.clone())),
            LazyState::Pending(_) => unreachable!(),
        }
    }
}

/// Reads a downloaded blob file and deletes it when dropped.
pub struct BlobReader {
    file: File,
    path: PathBuf,
}

impl BlobReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "removing downloaded blob");
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::{Cursor, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lazy_reader_defers_factory_until_first_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let mut reader = LazyReader::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(b"hello".to_vec())) as Box<dyn Read>)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_reader_invokes_factory_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let mut reader = LazyReader::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(b"ab".to_vec())) as Box<dyn Read>)
        });
        let mut buf = [0u8; 1];
        reader.read(&mut buf).unwrap();
        reader.read(&mut buf).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_reader_drop_without_read_skips_factory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        {
            let _reader = LazyReader::new(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Cursor::new(Vec::new())) as Box<dyn Read>)
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lazy_reader_remembers_factory_failure() {
        let mut reader = LazyReader::new(|| {
            Err(Error::LocalImageNotFound {
                path: "/tmp/missing.tar".to_string(),
            })
        });
        let mut buf = [0u8; 4];
        let first = reader.read(&mut buf).unwrap_err();
        assert!(first.to_string().contains("local image not found"));
        let second = reader.read(&mut buf).unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_blob_reader_removes_file_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"layer bytes")
            .unwrap();

        {
            let mut reader = BlobReader::open(&path).unwrap();
            let mut out = String::new();
            reader.read_to_string(&mut out).unwrap();
            assert_eq!(out, "layer bytes");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_blob_reader_open_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(BlobReader::open(dir.path().join("nope")).is_err());
    }
}
