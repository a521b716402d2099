//! Error types for the image pull pipeline.

use std::path::PathBuf;

/// Result type alias for image pull operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, fetching, or unpacking an image.
///
/// Display strings are part of the crate's contract: callers match on
/// literal substrings such as `"layers exceed disk quota"` or
/// `"layerID digest mismatch"`, so the wording of each variant is stable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Reference / Lookup Errors
    // =========================================================================
    /// Failed to parse an image source locator.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image could not be resolved at its source (missing or unauthorized).
    #[error("fetching image reference '{reference}': {reason}")]
    ImageNotFound { reference: String, reason: String },

    /// Local rootfs tar does not exist.
    #[error("local image not found in `{path}`")]
    LocalImageNotFound { path: String },

    /// Local rootfs source is a directory, not a tar file.
    #[error("invalid base image: directory provided instead of a tar file")]
    DirectoryProvided,

    /// Could not stat a local rootfs file to derive its layer id.
    #[error("fetching image timestamp for `{path}`: {reason}")]
    Lookup { path: String, reason: String },

    // =========================================================================
    // Auth / Transport Errors
    // =========================================================================
    /// Token exchange with the registry's auth endpoint failed.
    #[error("unable to retrieve auth token: {reason}")]
    AuthFailed { reason: String },

    /// A transient transport fault persisted through every retry attempt.
    #[error("{operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },

    /// The registry answered with a status the client does not retry.
    #[error("{operation}: unexpected status {status}")]
    UnexpectedStatus { operation: String, status: u16 },

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// A requested digest is not a well-formed sha256 digest.
    #[error("invalid checksum digest length: {digest}")]
    InvalidDigest { digest: String },

    /// Layer media type is not a known (un)compressed layer type.
    #[error("expected blob to be of type {expected}, got {actual}")]
    UnexpectedMediaType { expected: String, actual: String },

    /// Downloaded blob bytes do not hash to the requested blob id.
    #[error("layerID digest mismatch: expected {expected}, got {actual}")]
    BlobDigestMismatch { expected: String, actual: String },

    /// Decompressed layer bytes do not hash to the manifest's diff id.
    #[error("diffID digest mismatch: expected {expected}, got {actual}")]
    DiffIdMismatch { expected: String, actual: String },

    /// Downloaded byte count disagrees with the manifest-declared size.
    #[error("layer size is different from the value in the manifest: expected {expected}, got {actual}")]
    LayerSizeMismatch { expected: i64, actual: i64 },

    /// Manifest or index blob is malformed.
    #[error("invalid image manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Image configuration blob could not be fetched or parsed.
    #[error("fetching image config: {reason}")]
    ConfigFetch { reason: String },

    // =========================================================================
    // Quota Errors
    // =========================================================================
    /// Declared layer sizes already exceed the disk quota (pre-download check).
    #[error("layers exceed disk quota {used}/{limit} bytes")]
    LayersExceedQuota { used: i64, limit: i64 },

    /// Decompressed layer bytes overran the remaining quota budget mid-stream.
    #[error("uncompressed layer size exceeds quota")]
    QuotaExceeded,

    /// Caller passed a negative disk limit.
    #[error("invalid disk limit: {0}")]
    InvalidDiskLimit(i64),

    /// Disk limit leaves no headroom once the image itself is accounted for.
    #[error("disk limit {limit} must be larger than image size {size}")]
    DiskLimitTooSmall { limit: i64, size: i64 },

    // =========================================================================
    // Orchestration Context
    // =========================================================================
    /// Resolving the manifest-derived layer list failed.
    #[error("fetching image info: {source}")]
    FetchingImageInfo {
        #[source]
        source: Box<Error>,
    },

    /// Pull failed; wraps the layer-level error with top-level context.
    #[error("pulling image: {source}")]
    PullingImage {
        #[source]
        source: Box<Error>,
    },

    /// The volume backend failed to compose the runtime bundle.
    #[error("creating bundle: {source}")]
    CreatingBundle {
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Config file could not be read or parsed.
    #[error("reading config file {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Config file names an unknown log level.
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Network request error.
    #[error("network request error: {0}")]
    Network(#[from] reqwest::Error),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_not_found_message_prefix() {
        let err = Error::ImageNotFound {
            reference: "docker:///cfgarden/nope".to_string(),
            reason: "status 401".to_string(),
        };
        assert!(err.to_string().starts_with("fetching image reference"));
    }

    #[test]
    fn test_quota_messages() {
        let err = Error::LayersExceedQuota {
            used: 1201,
            limit: 1200,
        };
        assert_eq!(err.to_string(), "layers exceed disk quota 1201/1200 bytes");
        assert_eq!(
            Error::QuotaExceeded.to_string(),
            "uncompressed layer size exceeds quota"
        );
    }

    #[test]
    fn test_digest_mismatch_messages() {
        let blob = Error::BlobDigestMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(blob.to_string().contains("layerID digest mismatch"));

        let diff = Error::DiffIdMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(diff.to_string().contains("diffID digest mismatch"));
    }

    #[test]
    fn test_wrapping_preserves_deepest_message() {
        let wrapped = Error::PullingImage {
            source: Box::new(Error::FetchingImageInfo {
                source: Box::new(Error::QuotaExceeded),
            }),
        };
        let msg = wrapped.to_string();
        assert!(msg.starts_with("pulling image:"));
        assert!(msg.contains("uncompressed layer size exceeds quota"));
    }

    #[test]
    fn test_io_conversion_keeps_display() {
        let io: std::io::Error = Error::QuotaExceeded.into();
        assert!(io
            .to_string()
            .contains("uncompressed layer size exceeds quota"));
    }
}
