//! # Layer Identity
//!
//! Layer descriptors and the identity derivations the pull pipeline relies
//! on:
//!
//! - **Chain ids** name the filesystem produced by applying a layer on top
//!   of its parents. `chain_id = hex(sha256(parent_chain_id + " " + diff_id))`,
//!   with the base layer's chain id being its diff id verbatim. Two images
//!   sharing a layer prefix therefore share the corresponding volumes.
//! - **Local path identity** for plain rootfs tars:
//!   `hex(sha256("{path}-{mtime_unix_nanos}"))`, so editing the tar yields a
//!   fresh layer id while an untouched tar keeps hitting the volume cache.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Everything the puller needs to know about one layer, in root-first order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// Content digest of the blob as served, `sha256:<hex>` form for
    /// registry/OCI sources, the source path for local tars.
    pub blob_id: String,
    /// Digest of the decompressed layer tar, bare hex. Empty when unknown
    /// (legacy schema-1 manifests).
    pub diff_id: String,
    /// Identity of the filesystem up to and including this layer, bare hex.
    pub chain_id: String,
    /// Chain id of the parent layer; empty for the base layer.
    pub parent_chain_id: String,
    /// Media type as declared by the manifest; empty for local tars.
    pub media_type: String,
    /// Declared blob size in bytes; -1 when the manifest does not carry one.
    pub size: i64,
}

/// Resolved image: ordered layers plus the raw configuration blob.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub layer_infos: Vec<LayerInfo>,
    pub config: serde_json::Value,
}

/// Derives a chain id from a parent chain id and a layer diff id.
///
/// An empty parent means this is the base layer, whose chain id is the diff
/// id itself.
pub fn chain_id(parent_chain_id: &str, diff_id: &str) -> String {
    if parent_chain_id.is_empty() {
        return diff_id.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(parent_chain_id.as_bytes());
    hasher.update(b" ");
    hasher.update(diff_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Descriptor pair as read out of a manifest, before chain derivation.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub blob_id: String,
    pub diff_id: String,
    pub media_type: String,
    pub size: i64,
}

/// Walks manifest descriptors root-first, threading the chain id through.
///
/// A layer with an unknown diff id contributes its blob digest hex to the
/// chain instead, so legacy manifests still produce stable, distinct ids.
pub fn build_layer_infos(descriptors: &[LayerDescriptor]) -> Vec<LayerInfo> {
    let mut infos = Vec::with_capacity(descriptors.len());
    let mut parent = String::new();
    for desc in descriptors {
        let link_id = if desc.diff_id.is_empty() {
            desc.blob_id.trim_start_matches("sha256:")
        } else {
            desc.diff_id.as_str()
        };
        let chain = chain_id(&parent, link_id);
        infos.push(LayerInfo {
            blob_id: desc.blob_id.clone(),
            diff_id: desc.diff_id.clone(),
            chain_id: chain.clone(),
            parent_chain_id: parent.clone(),
            media_type: desc.media_type.clone(),
            size: desc.size,
        });
        parent = chain;
    }
    infos
}

/// Modification-time lookup, injectable so identity derivation is testable
/// without touching the filesystem clock.
pub trait ModTime {
    fn mod_time(&self, path: &Path) -> Result<SystemTime>;
}

/// [`ModTime`] backed by `fs::metadata`.
#[derive(Debug, Default)]
pub struct StatModTime;

impl ModTime for StatModTime {
    fn mod_time(&self, path: &Path) -> Result<SystemTime> {
        let meta = std::fs::metadata(path).map_err(|e| Error::Lookup {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        meta.modified().map_err(|e| Error::Lookup {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Derives layer ids for local rootfs tars from their path and mtime.
pub struct LocalIdGenerator {
    mod_time: Box<dyn ModTime + Send + Sync>,
}

impl Default for LocalIdGenerator {
    fn default() -> Self {
        Self::new(Box::new(StatModTime))
    }
}

impl LocalIdGenerator {
    pub fn new(mod_time: Box<dyn ModTime + Send + Sync>) -> Self {
        Self { mod_time }
    }

    /// `hex(sha256("{path}-{mtime_unix_nanos}"))`.
    pub fn generate_layer_id(&self, path: &Path) -> Result<String> {
        let mtime = self.mod_time.mod_time(path)?;
        let nanos = mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or_else(|e| -(e.duration().as_nanos() as i128));
        let seed = format!("{}-{}", path.display(), nanos);
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}
