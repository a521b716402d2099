//! # Local Tar Fetcher
//!
//! Treats a plain rootfs tar on disk as a single-layer image. The layer's
//! identity is derived from the tar's path and modification time, so an
//! edited tar produces a fresh volume while an untouched one keeps hitting
//! the cache. No digest material exists for local tars, so no verification
//! pipeline runs; the backend unpacks the file as-is.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layer::{ImageInfo, LayerInfo, LocalIdGenerator};
use crate::puller::Fetcher;

/// [`Fetcher`] over a local rootfs tar.
pub struct FileFetcher {
    path: PathBuf,
    id_generator: LocalIdGenerator,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            id_generator: LocalIdGenerator::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_id_generator(path: impl Into<PathBuf>, gen: LocalIdGenerator) -> Self {
        Self {
            path: path.into(),
            id_generator: gen,
        }
    }

    fn check_source(&self) -> Result<std::fs::Metadata> {
        let meta = std::fs::metadata(&self.path).map_err(|_| Error::LocalImageNotFound {
            path: self.path.display().to_string(),
        })?;
        if meta.is_dir() {
            return Err(Error::DirectoryProvided);
        }
        Ok(meta)
    }
}

impl Fetcher for FileFetcher {
    fn image_info(&mut self) -> Result<ImageInfo> {
        let meta = self.check_source()?;
        let layer_id = self.id_generator.generate_layer_id(&self.path)?;
        debug!(path = %self.path.display(), layer_id = %layer_id, "resolved local tar");

        Ok(ImageInfo {
            layer_infos: vec![LayerInfo {
                blob_id: self.path.display().to_string(),
                diff_id: String::new(),
                chain_id: layer_id,
                parent_chain_id: String::new(),
                media_type: String::new(),
                size: meta.len() as i64,
            }],
            config: json!({}),
        })
    }

    fn stream_blob(&mut self, _layer: &LayerInfo) -> Result<(Box<dyn Read>, i64)> {
        let meta = self.check_source()?;
        let file = File::open(&self.path)?;
        Ok((Box::new(file), meta.len() as i64))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::ModTime;
    use std::io::Write;
    use std::path::Path;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    struct FixedModTime(SystemTime);

    impl ModTime for FixedModTime {
        fn mod_time(&self, _path: &Path) -> Result<SystemTime> {
            Ok(self.0)
        }
    }

    fn write_tar(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents)
            .unwrap();
        path
    }

    #[test]
    fn test_image_info_is_single_layer_with_path_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_tar(&dir, "rootfs.tar", b"tar bytes");

        let t = UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        let gen = LocalIdGenerator::new(Box::new(FixedModTime(t)));
        let mut fetcher = FileFetcher::with_id_generator(&path, gen);

        let info = fetcher.image_info().unwrap();
        assert_eq!(info.layer_infos.len(), 1);
        let layer = &info.layer_infos[0];
        assert_eq!(layer.chain_id.len(), 64);
        assert_eq!(layer.parent_chain_id, "");
        assert_eq!(layer.size, 9);
        assert_eq!(layer.blob_id, path.display().to_string());
    }

    #[test]
    fn test_stream_blob_reads_the_tar() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_tar(&dir, "rootfs.tar", b"tar bytes");
        let mut fetcher = FileFetcher::new(&path);

        let info = fetcher.image_info().unwrap();
        let (mut stream, size) = fetcher.stream_blob(&info.layer_infos[0]).unwrap();
        assert_eq!(size, 9);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tar bytes");
    }

    #[test]
    fn test_missing_tar_is_local_image_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut fetcher = FileFetcher::new(dir.path().join("missing.tar"));
        let err = fetcher.image_info().unwrap_err();
        assert!(err.to_string().contains("local image not found in"));
    }

    #[test]
    fn test_directory_source_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut fetcher = FileFetcher::new(dir.path());
        let err = fetcher.image_info().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid base image: directory provided instead of a tar file"
        );
    }
}
