//! # Engine
//!
//! Top-level operations over an injected [`VolumeDriver`]: `create`,
//! `pull`, `delete`, and `stats`. The engine picks the fetcher for a
//! locator, wires quota enforcement into it, and sequences the puller and
//! the volume backend.
//!
//! ## Quota accounting on create
//!
//! With a non-zero disk limit and the image counting against it, the write
//! budget handed to the backend's bundle is `disk_limit - image.size`,
//! which must stay strictly positive. An image exactly at the limit leaves
//! no room to write and is rejected.

use tracing::{debug, info};

use crate::config::Config;
use crate::constants::{SCHEME_DOCKER, SCHEME_OCI};
use crate::error::{Error, Result};
use crate::fetcher::file::FileFetcher;
use crate::fetcher::ocidir::OciDirSource;
use crate::fetcher::registry::{RegistryOptions, RegistrySource};
use crate::fetcher::LayerFetcher;
use crate::puller::{
    BundleSpec, Fetcher, Image, ImagePuller, ImageSpec, VolumeDriver, VolumeMetadata, VolumeStats,
};

/// Image pull and bundle lifecycle over a volume backend.
pub struct Engine<D: VolumeDriver> {
    driver: D,
    config: Config,
}

impl<D: VolumeDriver> Engine<D> {
    pub fn new(driver: D, config: Config) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn fetcher_for(&self, spec: &ImageSpec) -> Result<Box<dyn Fetcher>> {
        // Live quota enforcement draws decompressed bytes down while
        // streaming; it only applies when the image counts against quota.
        let quota = if spec.disk_limit > 0 && !spec.exclude_image_from_quota {
            Some(spec.disk_limit)
        } else {
            None
        };

        if spec.image_src.starts_with(SCHEME_DOCKER) {
            let options = RegistryOptions {
                username: self.config.registry_username.clone(),
                password: self.config.registry_password.clone(),
                insecure_registries: self.config.insecure_registries.clone(),
                skip_layer_validation: self.config.skip_layer_validation,
            };
            let source = RegistrySource::new(&spec.image_src, options, quota)?;
            Ok(Box::new(LayerFetcher::new(source)))
        } else if spec.image_src.starts_with(SCHEME_OCI) {
            let source =
                OciDirSource::new(&spec.image_src, self.config.skip_layer_validation, quota)?;
            Ok(Box::new(LayerFetcher::new(source)))
        } else {
            Ok(Box::new(FileFetcher::new(spec.image_src.as_str())))
        }
    }

    /// Pulls an image into the volume backend.
    pub fn pull(&self, spec: &ImageSpec) -> Result<Image> {
        debug!(image = %spec.image_src, "pull starting");
        let fetcher = self.fetcher_for(spec)?;
        let mut puller = ImagePuller::new(fetcher, &self.driver);
        let result = puller.pull(spec);
        puller.close()?;
        result.map_err(|e| Error::PullingImage {
            source: Box::new(e),
        })
    }

    /// Pulls an image and composes a runtime bundle over it.
    pub fn create(&self, handle: &str, spec: &ImageSpec) -> Result<BundleSpec> {
        debug!(handle, image = %spec.image_src, "create starting");
        if spec.disk_limit < 0 {
            return Err(Error::InvalidDiskLimit(spec.disk_limit));
        }

        let image = self.pull(spec)?;

        let mut quota = spec.disk_limit;
        if spec.disk_limit != 0 && !spec.exclude_image_from_quota {
            quota -= image.size;
            if quota <= 0 {
                return Err(Error::DiskLimitTooSmall {
                    limit: spec.disk_limit,
                    size: image.size,
                });
            }
        }

        let bundle = self
            .driver
            .bundle(handle, &image.chain_ids, quota)
            .map_err(|e| Error::CreatingBundle {
                source: Box::new(e),
            })?;

        self.driver.write_metadata(
            handle,
            &VolumeMetadata {
                base_image_size: image.size,
            },
        )?;

        info!(handle, size = image.size, "bundle created");
        Ok(bundle)
    }

    /// Destroys a bundle.
    pub fn delete(&self, handle: &str) -> Result<()> {
        debug!(handle, "delete");
        self.driver.delete(handle)
    }

    /// Reports disk usage for a bundle.
    pub fn stats(&self, handle: &str) -> Result<VolumeStats> {
        self.driver.stats(handle)
    }
}
