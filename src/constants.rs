//! # Pull Pipeline Constants
//!
//! Defines retry policy, payload bounds, media types, and locator schemes
//! for the image pull pipeline. These constants are the **single source of
//! truth** for the bounds enforced throughout the codebase.
//!
//! ## Cross-References
//!
//! - [`crate::fetcher::registry`]: Uses retry policy, accept headers, and
//!   payload bounds for manifest and blob fetching
//! - [`crate::fetcher`]: Uses media type sets for layer validation
//! - [`crate::engine`]: Uses locator schemes for source selection

use std::time::Duration;

// =============================================================================
// Retry Policy
// =============================================================================

/// Number of attempts a transient registry fault is given before the fetch
/// fails for good. Covers transport errors and retriable HTTP statuses.
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Fixed delay between retry attempts.
///
/// Short on purpose: the pipeline is synchronous and a caller is blocked
/// for the whole pull.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

// =============================================================================
// Payload Bounds
// =============================================================================

/// Maximum manifest (or index) document size read from a registry (1 MiB).
///
/// A manifest larger than this is malformed or hostile; the body read is
/// truncated at this bound and parsing fails on the truncated document.
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// Maximum image configuration blob size read from a registry (1 MiB).
pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Chunk size for the blob verification copy loop (64 KiB).
pub const BLOB_COPY_CHUNK: usize = 64 * 1024;

// =============================================================================
// Locator Schemes
// =============================================================================

/// Locator scheme for registry-hosted images (`docker://host/repo:tag`).
pub const SCHEME_DOCKER: &str = "docker://";

/// Locator scheme for OCI image-layout directories (`oci:///path[:tag]`).
pub const SCHEME_OCI: &str = "oci://";

/// Tag assumed when a registry locator names none.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// Media Types
// =============================================================================

/// OCI gzip-compressed layer media type.
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI uncompressed layer media type.
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Docker gzip-compressed layer media type.
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Docker uncompressed layer media type.
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Layer media types streamed through the gzip decoder.
pub const GZIP_LAYER_MEDIA_TYPES: &[&str] =
    &[MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_DOCKER_LAYER_GZIP];

/// Layer media types streamed verbatim.
pub const PLAIN_LAYER_MEDIA_TYPES: &[&str] = &[MEDIA_TYPE_OCI_LAYER, MEDIA_TYPE_DOCKER_LAYER];

/// `Accept` header offered on manifest requests. Orders current formats
/// first, legacy schema-1 last.
pub const MANIFEST_ACCEPT_HEADER: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v1+prettyjws";
