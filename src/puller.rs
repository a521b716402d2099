//! # Image Puller
//!
//! Orchestrates a pull: resolves the layer list through a [`Fetcher`],
//! enforces the declared-size quota up front, then walks the layers
//! root-first handing each one to the [`VolumeDriver`] as a lazy stream.
//!
//! ## Sequencing
//!
//! Layers are strictly sequential. Layer N's volume is created before layer
//! N+1's stream is opened, and the driver sees parent chain ids in order, so
//! a crash can only ever leave a prefix of the chain behind. A layer whose
//! volume already exists is skipped outright; for the rest the blob is only
//! downloaded once the driver actually reads the stream, courtesy of
//! [`LazyReader`].
//!
//! ## Quota
//!
//! When `disk_limit != 0` and the image counts against quota, the sum of
//! manifest-declared sizes must leave strictly positive headroom under the
//! limit before any byte is fetched. Unknown sizes (-1) are excluded from
//! the static sum; live enforcement inside the fetcher covers them.

use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::layer::{ImageInfo, LayerInfo};
use crate::stream::LazyReader;

/// What to pull and under which quota.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Source locator: `docker://...`, `oci:///...`, or a local tar path.
    pub image_src: String,
    /// Disk quota in bytes; 0 disables quota enforcement.
    pub disk_limit: i64,
    /// When set, the base image's size does not count against `disk_limit`.
    pub exclude_image_from_quota: bool,
}

/// Result of a pull: the volume chain plus image metadata.
#[derive(Debug, Clone)]
pub struct Image {
    /// Chain ids of the unpacked layers, root-first.
    pub chain_ids: Vec<String>,
    /// Total unpacked size in bytes, as reported by the volume backend.
    pub size: i64,
    /// Raw image configuration blob.
    pub config: serde_json::Value,
}

/// Opaque runtime bundle spec produced by the volume backend.
pub type BundleSpec = serde_json::Value;

/// Metadata persisted alongside a created bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub base_image_size: i64,
}

/// Disk accounting for one bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes_used: i64,
    pub exclusive_bytes_used: i64,
}

/// Stats reported by the volume backend for one bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub disk_usage: DiskUsage,
}

/// Source-side contract consumed by the puller.
pub trait Fetcher {
    /// Resolves the ordered layer list and configuration for the image.
    fn image_info(&mut self) -> Result<ImageInfo>;

    /// Opens a verified stream of the decompressed layer tar, returning the
    /// stream and the blob's size in bytes.
    fn stream_blob(&mut self, layer: &LayerInfo) -> Result<(Box<dyn Read>, i64)>;

    /// Releases any resources held by the fetcher.
    fn close(&mut self) -> Result<()>;
}

/// Volume backend contract. Implementations own layer storage, bundle
/// composition, and disk accounting; the puller only sequences them.
pub trait VolumeDriver {
    /// Creates the volume for `layer_id` on top of `parent_ids` (root-first)
    /// by unpacking `stream`. Returns the unpacked size in bytes. A driver
    /// that already has the volume may return without reading the stream.
    fn unpack(
        &self,
        layer_id: &str,
        parent_ids: &[String],
        stream: &mut dyn Read,
    ) -> Result<i64>;

    /// Whether the volume for `layer_id` already exists.
    fn exists(&self, layer_id: &str) -> bool;

    /// Composes a runtime bundle over the volume chain. `quota` is the
    /// exclusive write budget in bytes (0 = unlimited).
    fn bundle(&self, handle: &str, chain_ids: &[String], quota: i64) -> Result<BundleSpec>;

    /// Persists bundle metadata.
    fn write_metadata(&self, handle: &str, metadata: &VolumeMetadata) -> Result<()>;

    /// Destroys a bundle.
    fn delete(&self, handle: &str) -> Result<()>;

    /// Reports disk usage for a bundle.
    fn stats(&self, handle: &str) -> Result<VolumeStats>;
}

/// Sequences one image pull over a fetcher and a volume driver.
pub struct ImagePuller<'a> {
    fetcher: Box<dyn Fetcher + 'a>,
    driver: &'a dyn VolumeDriver,
}

impl<'a> ImagePuller<'a> {
    pub fn new(fetcher: Box<dyn Fetcher + 'a>, driver: &'a dyn VolumeDriver) -> Self {
        Self { fetcher, driver }
    }

    /// Pulls the image described by `spec` into the volume backend.
    pub fn pull(&mut self, spec: &ImageSpec) -> Result<Image> {
        let image_info = self
            .fetcher
            .image_info()
            .map_err(|e| Error::FetchingImageInfo {
                source: Box::new(e),
            })?;
        debug!(
            image = %spec.image_src,
            layers = image_info.layer_infos.len(),
            "resolved image"
        );

        check_declared_quota(&image_info.layer_infos, spec)?;

        let mut chain_ids: Vec<String> = Vec::with_capacity(image_info.layer_infos.len());
        let mut total_size: i64 = 0;

        for layer in &image_info.layer_infos {
            if self.driver.exists(&layer.chain_id) {
                debug!(chain_id = %layer.chain_id, "layer volume exists, skipping unpack");
                chain_ids.push(layer.chain_id.clone());
                continue;
            }

            let fetcher = &mut self.fetcher;
            let wanted = layer.clone();
            let mut stream = LazyReader::new(move || {
                let (reader, _size) = fetcher.stream_blob(&wanted)?;
                Ok(reader)
            });

            let size = self.driver.unpack(&layer.chain_id, &chain_ids, &mut stream)?;
            debug!(chain_id = %layer.chain_id, size, "unpacked layer");

            total_size += size;
            chain_ids.push(layer.chain_id.clone());
        }

        info!(image = %spec.image_src, size = total_size, "image pulled");
        Ok(Image {
            chain_ids,
            size: total_size,
            config: image_info.config,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.fetcher.close()
    }
}

/// Fails fast when the manifest-declared sizes cannot fit under the quota.
/// Requires strictly positive headroom: an image exactly at the limit would
/// leave no room to write, so it is rejected too.
fn check_declared_quota(layers: &[LayerInfo], spec: &ImageSpec) -> Result<()> {
    if spec.disk_limit == 0 || spec.exclude_image_from_quota {
        return Ok(());
    }
    let declared: i64 = layers.iter().map(|l| l.size.max(0)).sum();
    if declared >= spec.disk_limit {
        return Err(Error::LayersExceedQuota {
            used: declared,
            limit: spec.disk_limit,
        });
    }
    Ok(())
}
