//! # OCI Layout Source
//!
//! Reads images out of an OCI image-layout directory (`index.json` plus
//! `blobs/sha256/<hex>`), running blobs through the same verification
//! pipeline as the registry source. No network involved.

use std::fs::File;
use std::path::PathBuf;

use oci_spec::image::{ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::{DEFAULT_TAG, SCHEME_OCI};
use crate::error::{Error, Result};
use crate::fetcher::{split_digest, verify_blob, Source};
use crate::layer::{build_layer_infos, ImageInfo, LayerDescriptor, LayerInfo};

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// [`Source`] over an OCI image-layout directory.
pub struct OciDirSource {
    dir: PathBuf,
    tag: String,
    skip_layer_validation: bool,
    remaining_quota: Option<i64>,
}

impl OciDirSource {
    /// Builds a source from an `oci:///abs/path[:tag]` locator.
    pub fn new(
        locator: &str,
        skip_layer_validation: bool,
        remaining_quota: Option<i64>,
    ) -> Result<Self> {
        let (dir, tag) = parse_oci_locator(locator)?;
        Ok(Self {
            dir,
            tag,
            skip_layer_validation,
            remaining_quota,
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = split_digest(digest)?;
        Ok(self.dir.join("blobs").join("sha256").join(hex))
    }

    /// Reads a blob fully, checking its bytes hash to `digest`.
    fn read_verified_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        let bytes = std::fs::read(&path)?;
        let actual = hex::encode(Sha256::digest(&bytes));
        let expected = split_digest(digest)?;
        if actual != expected {
            return Err(Error::BlobDigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    fn resolve_manifest(&self) -> Result<ImageManifest> {
        let index_path = self.dir.join("index.json");
        let index_file = File::open(&index_path).map_err(|e| Error::ImageNotFound {
            reference: self.dir.display().to_string(),
            reason: format!("reading index.json: {e}"),
        })?;
        let index: ImageIndex =
            serde_json::from_reader(index_file).map_err(|e| Error::InvalidManifest {
                reason: format!("malformed index.json: {e}"),
            })?;

        let descriptor = index
            .manifests()
            .iter()
            .find(|d| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map(|name| name == &self.tag)
                    .unwrap_or(false)
            })
            .or_else(|| index.manifests().first())
            .ok_or_else(|| Error::ImageNotFound {
                reference: self.dir.display().to_string(),
                reason: format!("no manifest for tag '{}'", self.tag),
            })?;

        debug!(digest = %descriptor.digest(), tag = %self.tag, "resolved layout manifest");
        let bytes = self.read_verified_blob(&descriptor.digest().to_string())?;
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidManifest {
            reason: e.to_string(),
        })
    }
}

impl Source for OciDirSource {
    fn image_info(&mut self) -> Result<ImageInfo> {
        let manifest = self.resolve_manifest()?;

        let config_bytes = self
            .read_verified_blob(&manifest.config().digest().to_string())
            .map_err(|e| Error::ConfigFetch {
                reason: e.to_string(),
            })?;
        let config: serde_json::Value =
            serde_json::from_slice(&config_bytes).map_err(|e| Error::ConfigFetch {
                reason: e.to_string(),
            })?;

        let diff_ids: Vec<String> = config
            .pointer("/rootfs/diff_ids")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim_start_matches("sha256:").to_string())
                    .collect()
            })
            .unwrap_or_default();
        if diff_ids.len() != manifest.layers().len() {
            return Err(Error::InvalidManifest {
                reason: format!(
                    "manifest has {} layers but config lists {} diff ids",
                    manifest.layers().len(),
                    diff_ids.len()
                ),
            });
        }

        let descriptors: Vec<LayerDescriptor> = manifest
            .layers()
            .iter()
            .zip(diff_ids)
            .map(|(desc, diff_id)| LayerDescriptor {
                blob_id: desc.digest().to_string(),
                diff_id,
                media_type: desc.media_type().to_string(),
                size: i64::try_from(desc.size()).unwrap_or(-1),
            })
            .collect();

        Ok(ImageInfo {
            layer_infos: build_layer_infos(&descriptors),
            config,
        })
    }

    fn blob(&mut self, layer: &LayerInfo) -> Result<(PathBuf, i64)> {
        let path = self.blob_path(&layer.blob_id)?;
        let mut file = File::open(&path).map_err(|e| Error::ImageNotFound {
            reference: self.dir.display().to_string(),
            reason: format!("reading blob {}: {e}", layer.blob_id),
        })?;
        let mut quota = self.remaining_quota;
        let result = verify_blob(layer, &mut file, self.skip_layer_validation, &mut quota)?;
        self.remaining_quota = quota;
        Ok(result)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Parses `oci:///abs/path[:tag]` into a layout directory and tag.
pub fn parse_oci_locator(locator: &str) -> Result<(PathBuf, String)> {
    let rest = locator
        .strip_prefix(SCHEME_OCI)
        .ok_or_else(|| Error::InvalidImageReference {
            reference: locator.to_string(),
            reason: "expected oci:// scheme".to_string(),
        })?;
    if rest.is_empty() || rest == "/" {
        return Err(Error::InvalidImageReference {
            reference: locator.to_string(),
            reason: "empty layout path".to_string(),
        });
    }

    // A trailing `:tag` segment must not contain a path separator, so that
    // paths with colons elsewhere still parse.
    if let Some((path, tag)) = rest.rsplit_once(':') {
        if !tag.is_empty() && !tag.contains('/') {
            return Ok((PathBuf::from(path), tag.to_string()));
        }
    }
    Ok((PathBuf::from(rest), DEFAULT_TAG.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_oci_locator_with_tag() {
        let (dir, tag) = parse_oci_locator("oci:///var/lib/images/busybox:1.36").unwrap();
        assert_eq!(dir, Path::new("/var/lib/images/busybox"));
        assert_eq!(tag, "1.36");
    }

    #[test]
    fn test_parse_oci_locator_defaults_tag() {
        let (dir, tag) = parse_oci_locator("oci:///var/lib/images/busybox").unwrap();
        assert_eq!(dir, Path::new("/var/lib/images/busybox"));
        assert_eq!(tag, DEFAULT_TAG);
    }

    #[test]
    fn test_parse_oci_locator_rejects_empty_path() {
        assert!(parse_oci_locator("oci://").is_err());
        assert!(parse_oci_locator("oci:///").is_err());
    }

    #[test]
    fn test_missing_index_is_image_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let locator = format!("oci://{}", dir.path().display());
        let mut source = OciDirSource::new(&locator, false, None).unwrap();
        let err = source.image_info().unwrap_err();
        assert!(err.to_string().starts_with("fetching image reference"));
    }
}
