//! OCI registry client for pulling template base images.
//!
//! Based on the OCI Distribution Spec: https://github.com/opencontainers/distribution-spec

use crate::config::schema::RegistryConfig;
use crate::error::{RootsmithError, RootsmithResult};
use crate::registry::auth::{RegistryAuthProvider, RegistryCredentials};
use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, ImageData};
use oci_distribution::manifest::{
    ImageIndexEntry, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_LAYER_MEDIA_TYPE,
};
use oci_distribution::Reference;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const ACCEPTED_LAYER_TYPES: &[&str] = &[
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_LAYER_MEDIA_TYPE,
];

/// Target OS/architecture for multi-platform images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(&config.platform_os, &config.platform_arch)
    }

    pub fn matches(&self, os: &str, architecture: &str) -> bool {
        self.os == os && self.architecture == architecture
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Manifest entry of a single layer
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub digest: String,
    pub media_type: String,
    /// Compressed size as reported by the manifest
    pub size: i64,
}

/// Downloaded layer blob
#[derive(Debug, Clone)]
pub struct Layer {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// A fetched image: manifest metadata plus layer blobs in application order
#[derive(Debug, Clone)]
pub struct OciImage {
    pub reference: String,
    /// Manifest digest, when the registry reported one
    pub digest: Option<String>,
    /// Layer descriptors from the manifest, `None` if the manifest was unavailable
    pub descriptors: Option<Vec<LayerDescriptor>>,
    pub layers: Vec<Layer>,
}

impl OciImage {
    fn from_image_data(reference: &str, data: ImageData) -> Self {
        let descriptors = data.manifest.as_ref().map(|manifest| {
            manifest
                .layers
                .iter()
                .map(|d| LayerDescriptor {
                    digest: d.digest.clone(),
                    media_type: d.media_type.clone(),
                    size: d.size,
                })
                .collect()
        });

        let layers = data
            .layers
            .into_iter()
            .map(|layer| Layer {
                media_type: layer.media_type,
                data: layer.data.into(),
            })
            .collect();

        Self {
            reference: reference.to_string(),
            digest: data.digest,
            descriptors,
            layers,
        }
    }

    /// Stable identity of the image content.
    ///
    /// The manifest digest when known, otherwise a SHA-256 over the layer blobs.
    pub fn content_digest(&self) -> String {
        if let Some(digest) = &self.digest {
            return digest.clone();
        }
        let mut hasher = Sha256::new();
        for layer in &self.layers {
            hasher.update(&layer.data);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

/// Sum of the compressed sizes of every layer
pub fn image_size(image: &OciImage) -> RootsmithResult<u64> {
    let descriptors = image
        .descriptors
        .as_ref()
        .ok_or_else(|| RootsmithError::ImageSize {
            image: image.reference.clone(),
            reason: "image manifest unavailable".to_string(),
        })?;

    descriptors
        .iter()
        .enumerate()
        .try_fold(0u64, |total, (index, layer)| {
            let size = u64::try_from(layer.size).map_err(|_| RootsmithError::ImageSize {
                image: image.reference.clone(),
                reason: format!("error getting layer ({}) size", index),
            })?;
            Ok(total + size)
        })
}

/// Parse an image reference string into an OCI Reference.
///
/// Handles:
/// - Short names: "nginx" → "docker.io/library/nginx:latest"
/// - Tagged names: "nginx:1.25" → "docker.io/library/nginx:1.25"
/// - Registries with ports: "localhost:5000/app" → "localhost:5000/app:latest"
/// - Fully qualified: "123.dkr.ecr.us-east-1.amazonaws.com/repo:tag"
pub fn parse_reference(image: &str) -> RootsmithResult<Reference> {
    let invalid = |reason: String| RootsmithError::InvalidImageRef {
        image: image.to_string(),
        reason,
    };

    if image.is_empty() || image.chars().any(char::is_whitespace) {
        return Err(invalid("empty or contains whitespace".to_string()));
    }

    let normalized = match image.split_once('/') {
        None => format!("docker.io/library/{}", image),
        Some((first, _)) if looks_like_host(first) => image.to_string(),
        Some(_) => format!("docker.io/{}", image),
    };

    let last_component = normalized.rsplit('/').next().unwrap_or_default();
    let normalized = if last_component.contains(':') || normalized.contains('@') {
        normalized
    } else {
        format!("{}:latest", normalized)
    };

    Reference::try_from(normalized.as_str()).map_err(|e| invalid(e.to_string()))
}

fn looks_like_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

/// Source of images for the build pipeline
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Resolve `reference` for `platform` and download its layers.
    async fn fetch_image(
        &self,
        reference: &str,
        platform: &Platform,
        cancel: &CancellationToken,
    ) -> RootsmithResult<OciImage>;
}

/// Registry-backed image source
pub struct ImageSourceClient {
    auth: Arc<dyn RegistryAuthProvider>,
    timeout: Duration,
    /// Last credentials, kept while their validity window allows
    credentials: Mutex<Option<RegistryCredentials>>,
}

impl ImageSourceClient {
    pub fn new(auth: Arc<dyn RegistryAuthProvider>, timeout: Duration) -> Self {
        Self {
            auth,
            timeout,
            credentials: Mutex::new(None),
        }
    }

    /// Cached credentials if still valid, otherwise fresh ones from the provider
    async fn credentials(&self) -> RootsmithResult<RegistryCredentials> {
        let mut cached = self.credentials.lock().await;
        if let Some(credentials) = cached.as_ref().filter(|c| c.is_reusable()) {
            debug!(provider = self.auth.name(), "Reusing registry credentials");
            return Ok(credentials.clone());
        }

        let credentials = self.auth.authenticate().await?;
        debug!(provider = self.auth.name(), "Registry credentials obtained");
        *cached = credentials.is_reusable().then(|| credentials.clone());
        Ok(credentials)
    }

    fn client_for(&self, platform: &Platform) -> Client {
        let wanted = platform.clone();
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(vec!["localhost".to_string()]),
            platform_resolver: Some(Box::new(move |manifests: &[ImageIndexEntry]| {
                debug!("Looking for {} image variant", wanted);
                manifests
                    .iter()
                    .find(|entry| {
                        entry.platform.as_ref().is_some_and(|p| {
                            wanted.matches(&p.os.to_string(), &p.architecture.to_string())
                        })
                    })
                    .map(|entry| entry.digest.clone())
            })),
            ..Default::default()
        };
        Client::new(config)
    }

    async fn pull(&self, image: &str, platform: &Platform) -> RootsmithResult<OciImage> {
        let reference = parse_reference(image)?;
        debug!("Parsed reference: {:?}", reference);

        let credentials = self.credentials().await?;

        let data = self
            .client_for(platform)
            .pull(
                &reference,
                &credentials.to_registry_auth(),
                ACCEPTED_LAYER_TYPES.to_vec(),
            )
            .await
            .map_err(|e| RootsmithError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;

        Ok(OciImage::from_image_data(image, data))
    }
}

#[async_trait]
impl ImageSource for ImageSourceClient {
    #[instrument(skip(self, cancel), fields(platform = %platform))]
    async fn fetch_image(
        &self,
        reference: &str,
        platform: &Platform,
        cancel: &CancellationToken,
    ) -> RootsmithResult<OciImage> {
        info!("Pulling image from registry");

        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RootsmithError::Canceled(format!("pull of {} canceled", reference)));
            }
            pulled = tokio::time::timeout(self.timeout, self.pull(reference, platform)) => pulled,
        };

        let image = pulled.map_err(|_| RootsmithError::FetchTimeout {
            image: reference.to_string(),
            secs: self.timeout.as_secs(),
        })??;

        info!(layers = image.layers.len(), "Image fetched successfully");
        Ok(image)
    }
}
