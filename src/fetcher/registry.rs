//! # Registry Source
//!
//! Pulls manifests and blobs from a Docker/OCI distribution registry over
//! the v2 HTTP API.
//!
//! ## Manifest normalization
//!
//! Registries serve four manifest shapes; all are normalized into the same
//! root-first layer list:
//!
//! | Shape | Handling |
//! |-------|----------|
//! | OCI / Docker v2 manifest | config blob fetched, diff ids zipped with layer descriptors |
//! | OCI / Docker manifest list | resolved to the `linux/amd64` entry, then fetched by digest |
//! | Docker schema 1 | `fsLayers` reversed to root-first, sizes unknown (-1), config from the newest `v1Compatibility` |
//!
//! ## Auth and transport
//!
//! Anonymous requests that bounce with 401 trigger a Bearer token exchange
//! against the endpoint named in the `WWW-Authenticate` challenge, reusing
//! the configured basic credentials if any. Transient faults (transport
//! errors, 408/418/429/5xx) are retried up to [`MAX_FETCH_ATTEMPTS`] times
//! with a fixed delay; 4xx statuses are permanent. Hosts on the insecure
//! allow-list are contacted over plain HTTP.

use std::io::Read;
use std::path::PathBuf;

use oci_spec::distribution::Reference;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_TAG, MANIFEST_ACCEPT_HEADER, MAX_CONFIG_SIZE, MAX_FETCH_ATTEMPTS, MAX_MANIFEST_SIZE,
    RETRY_DELAY, SCHEME_DOCKER,
};
use crate::error::{Error, Result};
use crate::fetcher::{split_digest, verify_blob, Source};
use crate::layer::{build_layer_infos, ImageInfo, LayerDescriptor, LayerInfo};

/// Options carried from the configuration into the registry client.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure_registries: Vec<String>,
    pub skip_layer_validation: bool,
}

/// Registry-backed [`Source`].
pub struct RegistrySource {
    client: reqwest::blocking::Client,
    reference: Reference,
    base_url: String,
    options: RegistryOptions,
    token: Option<String>,
    remaining_quota: Option<i64>,
}

impl RegistrySource {
    /// Builds a source from a `docker://[host]/repo[:tag]` locator.
    ///
    /// `remaining_quota` is the live decompressed-byte budget shared across
    /// all blobs of this pull; `None` disables live enforcement.
    pub fn new(
        locator: &str,
        options: RegistryOptions,
        remaining_quota: Option<i64>,
    ) -> Result<Self> {
        let reference = parse_docker_locator(locator)?;
        let registry = reference.resolve_registry().to_string();
        let scheme = if options
            .insecure_registries
            .iter()
            .any(|h| h == &registry || registry.starts_with(&format!("{h}:")))
        {
            "http"
        } else {
            "https"
        };
        let base_url = format!("{scheme}://{registry}/v2");

        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            reference,
            base_url,
            options,
            token: None,
            remaining_quota,
        })
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "{}/{}/manifests/{}",
            self.base_url,
            self.reference.repository(),
            reference
        )
    }

    fn blob_url(&self, digest: &str) -> String {
        format!(
            "{}/{}/blobs/{}",
            self.base_url,
            self.reference.repository(),
            digest
        )
    }

    fn apply_auth(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        if let Some(token) = &self.token {
            req.bearer_auth(token)
        } else if let Some(user) = &self.options.username {
            req.basic_auth(user, self.options.password.as_deref())
        } else {
            req
        }
    }

    /// GETs `url`, retrying transient faults and answering 401 challenges
    /// with a token exchange. Success means any status below 400.
    fn get_with_retry(
        &mut self,
        operation: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::blocking::Response> {
        let mut last_fault = String::new();
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            if attempt > 1 {
                std::thread::sleep(RETRY_DELAY);
            }
            debug!(operation, url, attempt, "registry request");

            let mut req = self.client.get(url);
            if let Some(accept) = accept {
                req = req.header(reqwest::header::ACCEPT, accept);
            }
            req = self.apply_auth(req);

            let response = match req.send() {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(operation, attempt, error = %e, "transport fault, will retry");
                    last_fault = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && self.token.is_none() {
                let challenge = response
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                self.token = Some(self.exchange_token(challenge.as_deref())?);
                debug!(operation, "acquired registry token, retrying request");
                // The authenticated retry gets the full attempt budget.
                return self.get_with_retry(operation, url, accept);
            }

            if status.is_success() {
                if attempt > 1 {
                    info!(operation, attempt, "registry request recovered");
                }
                return Ok(response);
            }

            if is_retriable(status) {
                warn!(operation, attempt, status = status.as_u16(), "retriable status");
                last_fault = format!("status {}", status.as_u16());
                continue;
            }

            return Err(Error::UnexpectedStatus {
                operation: operation.to_string(),
                status: status.as_u16(),
            });
        }

        Err(Error::RetriesExhausted {
            operation: operation.to_string(),
            attempts: MAX_FETCH_ATTEMPTS,
            reason: last_fault,
        })
    }

    /// Trades the `WWW-Authenticate: Bearer` challenge for a token.
    fn exchange_token(&self, challenge: Option<&str>) -> Result<String> {
        let challenge = challenge.ok_or_else(|| Error::AuthFailed {
            reason: "registry sent 401 without a WWW-Authenticate challenge".to_string(),
        })?;
        let params = parse_bearer_challenge(challenge).ok_or_else(|| Error::AuthFailed {
            reason: format!("unsupported auth challenge: {challenge}"),
        })?;

        let mut req = self.client.get(&params.realm).query(&params.query);
        if let Some(user) = &self.options.username {
            req = req.basic_auth(user, self.options.password.as_deref());
        }
        let response = req.send().map_err(|e| Error::AuthFailed {
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(Error::AuthFailed {
                reason: format!("token endpoint answered {}", response.status().as_u16()),
            });
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let body: TokenResponse = response.json().map_err(|e| Error::AuthFailed {
            reason: e.to_string(),
        })?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::AuthFailed {
                reason: "token endpoint answered without a token".to_string(),
            })
    }

    fn fetch_manifest_bytes(&mut self, reference: &str) -> Result<Vec<u8>> {
        let url = self.manifest_url(reference);
        let response = self
            .get_with_retry("fetching manifest", &url, Some(MANIFEST_ACCEPT_HEADER))
            .map_err(|e| self.as_image_not_found(e))?;
        let mut body = Vec::new();
        response
            .take(MAX_MANIFEST_SIZE)
            .read_to_end(&mut body)
            .map_err(Error::Io)?;
        Ok(body)
    }

    /// Permanent manifest statuses mean the image itself is unreachable.
    fn as_image_not_found(&self, err: Error) -> Error {
        match err {
            Error::UnexpectedStatus { status, .. }
                if matches!(status, 400 | 401 | 403 | 404) =>
            {
                Error::ImageNotFound {
                    reference: self.reference.whole(),
                    reason: format!("status {status}"),
                }
            }
            other => other,
        }
    }

    fn fetch_config(&mut self, digest: &str) -> Result<serde_json::Value> {
        let url = self.blob_url(digest);
        let response = self
            .get_with_retry("fetching config", &url, None)
            .map_err(|e| Error::ConfigFetch {
                reason: e.to_string(),
            })?;
        let mut body = Vec::new();
        response
            .take(MAX_CONFIG_SIZE)
            .read_to_end(&mut body)
            .map_err(Error::Io)?;
        serde_json::from_slice(&body).map_err(|e| Error::ConfigFetch {
            reason: e.to_string(),
        })
    }

    fn resolve_manifest(&mut self) -> Result<serde_json::Value> {
        let tag = self
            .reference
            .tag()
            .map(str::to_string)
            .or_else(|| self.reference.digest().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        let bytes = self.fetch_manifest_bytes(&tag)?;
        let doc: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| Error::InvalidManifest {
                reason: e.to_string(),
            })?;

        // Multi-arch index: chase the linux/amd64 entry by digest.
        if doc.get("manifests").is_some() {
            let digest = select_platform_manifest(&doc)?;
            debug!(digest = %digest, "resolved image index to platform manifest");
            let bytes = self.fetch_manifest_bytes(&digest)?;
            return serde_json::from_slice(&bytes).map_err(|e| Error::InvalidManifest {
                reason: e.to_string(),
            });
        }
        Ok(doc)
    }
}

impl Source for RegistrySource {
    fn image_info(&mut self) -> Result<ImageInfo> {
        let manifest = self.resolve_manifest()?;

        if manifest.get("fsLayers").is_some() {
            return schema1_image_info(&manifest);
        }

        let config_digest = manifest
            .pointer("/config/digest")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidManifest {
                reason: "manifest has no config descriptor".to_string(),
            })?
            .to_string();
        let layers = manifest
            .get("layers")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::InvalidManifest {
                reason: "manifest has no layers".to_string(),
            })?
            .clone();

        let config = self.fetch_config(&config_digest)?;
        let diff_ids = config_diff_ids(&config)?;
        if diff_ids.len() != layers.len() {
            return Err(Error::InvalidManifest {
                reason: format!(
                    "manifest has {} layers but config lists {} diff ids",
                    layers.len(),
                    diff_ids.len()
                ),
            });
        }

        let mut descriptors = Vec::with_capacity(layers.len());
        for (layer, diff_id) in layers.iter().zip(diff_ids) {
            let blob_id = layer
                .get("digest")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidManifest {
                    reason: "layer descriptor has no digest".to_string(),
                })?
                .to_string();
            descriptors.push(LayerDescriptor {
                blob_id,
                diff_id,
                media_type: layer
                    .get("mediaType")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                size: layer.get("size").and_then(|v| v.as_i64()).unwrap_or(-1),
            });
        }

        Ok(ImageInfo {
            layer_infos: build_layer_infos(&descriptors),
            config,
        })
    }

    fn blob(&mut self, layer: &LayerInfo) -> Result<(PathBuf, i64)> {
        split_digest(&layer.blob_id)?;
        let url = self.blob_url(&layer.blob_id);
        let mut response = self.get_with_retry("fetching blob", &url, None)?;
        let mut quota = self.remaining_quota;
        let result = verify_blob(
            layer,
            &mut response,
            self.options.skip_layer_validation,
            &mut quota,
        )?;
        self.remaining_quota = quota;
        Ok(result)
    }

    fn close(&mut self) -> Result<()> {
        self.token = None;
        Ok(())
    }
}

/// Parses `docker://host/repo:tag` (or `docker:///repo:tag` for the default
/// registry) into a distribution reference.
pub fn parse_docker_locator(locator: &str) -> Result<Reference> {
    let rest = locator
        .strip_prefix(SCHEME_DOCKER)
        .ok_or_else(|| Error::InvalidImageReference {
            reference: locator.to_string(),
            reason: "expected docker:// scheme".to_string(),
        })?;
    let name = rest.trim_start_matches('/');
    if name.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: locator.to_string(),
            reason: "empty repository".to_string(),
        });
    }
    Reference::try_from(name).map_err(|e| Error::InvalidImageReference {
        reference: locator.to_string(),
        reason: e.to_string(),
    })
}

fn is_retriable(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || matches!(status.as_u16(), 408 | 418 | 429)
}

struct BearerChallenge {
    realm: String,
    query: Vec<(String, String)>,
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut query = Vec::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" | "scope" => query.push((key.to_string(), value)),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        query,
    })
}

/// Picks the linux/amd64 manifest digest out of an image index.
fn select_platform_manifest(index: &serde_json::Value) -> Result<String> {
    let manifests = index
        .get("manifests")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::InvalidManifest {
            reason: "image index has no manifests".to_string(),
        })?;

    let mut seen = Vec::new();
    for entry in manifests {
        let os = entry.pointer("/platform/os").and_then(|v| v.as_str());
        let arch = entry
            .pointer("/platform/architecture")
            .and_then(|v| v.as_str());
        if os == Some("linux") && arch == Some("amd64") {
            return entry
                .get("digest")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidManifest {
                    reason: "platform manifest has no digest".to_string(),
                });
        }
        seen.push(format!("{}/{}", os.unwrap_or("?"), arch.unwrap_or("?")));
    }
    Err(Error::InvalidManifest {
        reason: format!(
            "no linux/amd64 manifest in image index (available: {})",
            seen.join(", ")
        ),
    })
}

/// Extracts `rootfs.diff_ids` from a v2/OCI image configuration.
fn config_diff_ids(config: &serde_json::Value) -> Result<Vec<String>> {
    let ids = config
        .pointer("/rootfs/diff_ids")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::InvalidManifest {
            reason: "image config has no rootfs.diff_ids".to_string(),
        })?;
    ids.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim_start_matches("sha256:").to_string())
                .ok_or_else(|| Error::InvalidManifest {
                    reason: "non-string diff id in image config".to_string(),
                })
        })
        .collect()
}

#[derive(Deserialize)]
struct Schema1Manifest {
    #[serde(rename = "fsLayers")]
    fs_layers: Vec<Schema1Layer>,
    #[serde(default)]
    history: Vec<Schema1History>,
}

#[derive(Deserialize)]
struct Schema1Layer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Deserialize)]
struct Schema1History {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

/// Legacy schema-1 manifests list layers newest-first with no sizes and no
/// diff ids; the image config is the newest history entry's embedded JSON.
fn schema1_image_info(manifest: &serde_json::Value) -> Result<ImageInfo> {
    let parsed: Schema1Manifest =
        serde_json::from_value(manifest.clone()).map_err(|e| Error::InvalidManifest {
            reason: e.to_string(),
        })?;

    // schema-1 layers are always tar+gzip even though the manifest does
    // not say so
    let descriptors: Vec<LayerDescriptor> = parsed
        .fs_layers
        .iter()
        .rev()
        .map(|l| LayerDescriptor {
            blob_id: l.blob_sum.clone(),
            diff_id: String::new(),
            media_type: crate::constants::MEDIA_TYPE_DOCKER_LAYER_GZIP.to_string(),
            size: -1,
        })
        .collect();

    let config = match parsed.history.first() {
        Some(entry) => {
            serde_json::from_str(&entry.v1_compatibility).map_err(|e| Error::InvalidManifest {
                reason: format!("malformed v1Compatibility: {e}"),
            })?
        }
        None => serde_json::Value::Object(Default::default()),
    };

    Ok(ImageInfo {
        layer_infos: build_layer_infos(&descriptors),
        config,
    })
}
