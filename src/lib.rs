//! # rootstock
//!
//! **Layered Container Image Pull Pipeline**
//!
//! This crate pulls container images from registries, OCI layout
//! directories, or plain rootfs tars into content-addressed layer volumes
//! managed by a pluggable backend. It owns resolution, verification, and
//! sequencing; the backend (injected as a [`VolumeDriver`]) owns layer
//! storage, bundle composition, and disk accounting.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           rootstock                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                        Engine                               │    │
//! │  │     create(handle, spec) │ pull(spec) │ delete │ stats      │    │
//! │  └──────────────────────────┬──────────────────────────────────┘    │
//! │                             │                                       │
//! │  ┌──────────────────────────┼──────────────────────────────────┐    │
//! │  │                     ImagePuller                             │    │
//! │  │  quota pre-check → per-layer lazy stream → driver.unpack    │    │
//! │  └──────────────────────────┼──────────────────────────────────┘    │
//! │                             │                                       │
//! │  ┌──────────────┐  ┌────────┴───────┐  ┌──────────────┐             │
//! │  │ RegistrySource│  │  OciDirSource │  │  FileFetcher │             │
//! │  │ manifests,    │  │  index.json,  │  │  path+mtime  │             │
//! │  │ auth, retry   │  │  blobs/sha256 │  │  identity    │             │
//! │  └──────┬───────┘  └───────┬────────┘  └──────────────┘             │
//! │         └─────────┬────────┘                                        │
//! │        shared verification: blob digest │ diff id │ size │ quota    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **Content-addressed chains**: every layer's volume is named by its
//!   chain id, so images sharing a layer prefix share volumes (see
//!   [`layer::chain_id`]).
//! - **Digest verification**: downloaded blobs are hashed against the
//!   manifest digest and, decompressed, against the config's diff id.
//!   Neither check is skippable.
//! - **Lazy streams**: a layer the backend already has is never
//!   downloaded (see [`stream::LazyReader`]).
//! - **Quota**: declared sizes are checked before the first byte moves;
//!   decompressed bytes are metered live against the remaining budget.
//! - **Sequential unpacking**: layers land root-first, one at a time, so
//!   an interrupted pull leaves only a usable prefix of the chain behind.
//!
//! # Example
//!
//! ```rust,ignore
//! use rootstock::{Config, Engine, ImageSpec};
//!
//! fn main() -> rootstock::Result<()> {
//!     let config = Config::from_file("/etc/rootstock.yml")?;
//!     let engine = Engine::new(MyVolumeDriver::new(), config);
//!     let bundle = engine.create("container-1", &ImageSpec {
//!         image_src: "docker:///library/alpine:3.18".to_string(),
//!         disk_limit: 1024 * 1024 * 1024,
//!         exclude_image_from_quota: false,
//!     })?;
//!     // hand the bundle spec to the runtime
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod layer;
pub mod puller;
pub mod stream;

// Re-exports
pub use config::Config;
pub use constants::*;
pub use engine::Engine;
pub use error::{Error, Result};
pub use fetcher::file::FileFetcher;
pub use fetcher::ocidir::OciDirSource;
pub use fetcher::registry::{RegistryOptions, RegistrySource};
pub use fetcher::{LayerFetcher, Source};
pub use layer::{
    chain_id, ImageInfo, LayerInfo, LocalIdGenerator, ModTime, StatModTime,
};
pub use puller::{
    BundleSpec, DiskUsage, Fetcher, Image, ImagePuller, ImageSpec, VolumeDriver, VolumeMetadata,
    VolumeStats,
};
pub use stream::{BlobReader, LazyReader};
