//! Container registry access
//!
//! Credential providers and the OCI client that resolves and downloads
//! template base images.

pub mod auth;
pub mod client;

pub use auth::{
    decode_authorization_token, AnonymousAuth, Credentials, EcrAuthProvider,
    RegistryAuthProvider, RegistryCredentials, StaticAuth,
};
pub use client::{
    image_size, parse_reference, ImageSource, ImageSourceClient, Layer, LayerDescriptor,
    OciImage, Platform,
};

use crate::config::{AuthMode, Config};
use std::sync::Arc;

/// Create the credential provider selected by the configuration
pub fn create_auth_provider(config: &Config) -> Arc<dyn RegistryAuthProvider> {
    match config.registry.auth {
        AuthMode::Anonymous => Arc::new(AnonymousAuth),
        AuthMode::Ecr => {
            let provider = EcrAuthProvider::new(config.registry.region.clone());
            match &config.registry.profile {
                Some(profile) => Arc::new(provider.with_profile(profile)),
                None => Arc::new(provider),
            }
        }
    }
}
