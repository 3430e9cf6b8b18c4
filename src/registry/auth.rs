//! Registry credential providers
//!
//! ECR hands out a base64 `user:password` token through
//! `aws ecr get-authorization-token`. The token carries its own expiry, and
//! the image client reuses it until shortly before that.

use crate::error::{RootsmithError, RootsmithResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Basic-auth credentials for a registry
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,

    /// Validity window reported by the token issuer, if any
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            expires_at: None,
        }
    }

    /// Whether the credentials may be reused for another fetch.
    ///
    /// Without an explicit validity window they are single-use.
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            // 60 second buffer against almost-expired tokens
            Some(expires_at) => Utc::now() < expires_at - chrono::Duration::seconds(60),
            None => false,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credentials presented to the registry
#[derive(Debug, Clone)]
pub enum RegistryCredentials {
    Anonymous,
    Basic(Credentials),
}

impl RegistryCredentials {
    /// Whether these credentials may serve another fetch
    pub fn is_reusable(&self) -> bool {
        match self {
            Self::Anonymous => false,
            Self::Basic(creds) => creds.is_valid(),
        }
    }

    pub fn to_registry_auth(&self) -> RegistryAuth {
        match self {
            Self::Anonymous => RegistryAuth::Anonymous,
            Self::Basic(creds) => {
                RegistryAuth::Basic(creds.username.clone(), creds.password.clone())
            }
        }
    }
}

/// Exchanges a provider-specific identity for registry credentials
#[async_trait]
pub trait RegistryAuthProvider: Send + Sync {
    async fn authenticate(&self) -> RootsmithResult<RegistryCredentials>;

    /// Provider name for logs
    fn name(&self) -> &'static str;
}

/// No credentials, for public registries
pub struct AnonymousAuth;

#[async_trait]
impl RegistryAuthProvider for AnonymousAuth {
    async fn authenticate(&self) -> RootsmithResult<RegistryCredentials> {
        Ok(RegistryCredentials::Anonymous)
    }

    fn name(&self) -> &'static str {
        "anonymous"
    }
}

/// Fixed credentials
pub struct StaticAuth(pub Credentials);

#[async_trait]
impl RegistryAuthProvider for StaticAuth {
    async fn authenticate(&self) -> RootsmithResult<RegistryCredentials> {
        Ok(RegistryCredentials::Basic(self.0.clone()))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// AWS ECR provider backed by the AWS CLI
pub struct EcrAuthProvider {
    region: Option<String>,
    profile: Option<String>,
}

impl EcrAuthProvider {
    pub fn new(region: Option<String>) -> Self {
        Self {
            region,
            profile: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    async fn request_token(&self) -> RootsmithResult<EcrAuthorizationData> {
        debug!("Requesting ECR authorization token via CLI...");

        let mut cmd = Command::new("aws");
        cmd.args(["ecr", "get-authorization-token", "--output", "json"]);

        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }

        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| RootsmithError::command_failed("aws ecr get-authorization-token", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Unable to locate credentials") || stderr.contains("not configured")
            {
                return Err(RootsmithError::AwsNotConfigured);
            }
            return Err(RootsmithError::RegistryAuth(format!(
                "error getting ECR auth token: {}",
                stderr.trim()
            )));
        }

        parse_authorization_response(&output.stdout)
    }
}

#[async_trait]
impl RegistryAuthProvider for EcrAuthProvider {
    async fn authenticate(&self) -> RootsmithResult<RegistryCredentials> {
        let data = self.request_token().await?;
        let (username, password) = decode_authorization_token(&data.authorization_token)?;

        let expires_at = data
            .expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        debug!(
            proxy = data.proxy_endpoint.as_deref().unwrap_or("-"),
            "Obtained ECR credentials"
        );

        Ok(RegistryCredentials::Basic(Credentials {
            username,
            password,
            expires_at,
        }))
    }

    fn name(&self) -> &'static str {
        "ecr"
    }
}

/// Decode a base64 `username:password` token, splitting on the first colon
pub fn decode_authorization_token(token: &str) -> RootsmithResult<(String, String)> {
    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|e| RootsmithError::RegistryAuth(format!("error decoding auth token: {}", e)))?;

    let decoded = String::from_utf8(decoded).map_err(|_| {
        RootsmithError::RegistryAuth("auth token is not valid UTF-8".to_string())
    })?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| RootsmithError::RegistryAuth("invalid auth token format".to_string()))?;

    Ok((username.to_string(), password.to_string()))
}

fn parse_authorization_response(stdout: &[u8]) -> RootsmithResult<EcrAuthorizationData> {
    let response: EcrTokenResponse = serde_json::from_slice(stdout).map_err(|e| {
        RootsmithError::RegistryAuth(format!("Failed to parse response: {}", e))
    })?;

    response
        .authorization_data
        .into_iter()
        .next()
        .ok_or_else(|| RootsmithError::RegistryAuth("no authorization data returned".to_string()))
}

#[derive(Deserialize)]
struct EcrTokenResponse {
    #[serde(rename = "authorizationData", default)]
    authorization_data: Vec<EcrAuthorizationData>,
}

#[derive(Deserialize)]
struct EcrAuthorizationData {
    #[serde(rename = "authorizationToken")]
    authorization_token: String,
    #[serde(rename = "expiresAt")]
    expires_at: Option<String>,
    #[serde(rename = "proxyEndpoint")]
    proxy_endpoint: Option<String>,
}

impl std::fmt::Debug for EcrAuthorizationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcrAuthorizationData")
            .field("authorization_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("proxy_endpoint", &self.proxy_endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &str) -> String {
        STANDARD.encode(raw)
    }

    #[test]
    fn decode_splits_on_first_colon() {
        let (user, pass) = decode_authorization_token(&encode("AWS:secret:with:colons")).unwrap();
        assert_eq!(user, "AWS");
        assert_eq!(pass, "secret:with:colons");
    }

    #[test]
    fn decode_rejects_missing_separator() {
        let err = decode_authorization_token(&encode("AWSsecret")).unwrap_err();
        assert!(matches!(err, RootsmithError::RegistryAuth(ref m) if m.contains("invalid auth token format")));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let err = decode_authorization_token("not base64!!").unwrap_err();
        assert!(matches!(err, RootsmithError::RegistryAuth(_)));
    }

    #[test]
    fn parse_cli_response() {
        let json = format!(
            r#"{{
                "authorizationData": [{{
                    "authorizationToken": "{}",
                    "expiresAt": "2024-01-01T12:00:00+00:00",
                    "proxyEndpoint": "https://123456789012.dkr.ecr.us-east-1.amazonaws.com"
                }}]
            }}"#,
            encode("AWS:token")
        );

        let data = parse_authorization_response(json.as_bytes()).unwrap();
        assert_eq!(data.authorization_token, encode("AWS:token"));
        assert_eq!(data.expires_at.as_deref(), Some("2024-01-01T12:00:00+00:00"));
    }

    #[test]
    fn parse_empty_authorization_data() {
        let err = parse_authorization_response(br#"{"authorizationData": []}"#).unwrap_err();
        assert!(err.to_string().contains("no authorization data"));
    }

    #[test]
    fn credentials_without_window_are_single_use() {
        let creds = Credentials::new("AWS", "pw");
        assert!(!creds.is_valid());

        let mut creds = creds;
        creds.expires_at = Some(Utc::now() + chrono::Duration::hours(12));
        assert!(creds.is_valid());

        creds.expires_at = Some(Utc::now() + chrono::Duration::seconds(30));
        assert!(!creds.is_valid());
    }

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials::new("AWS", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));

        let data = parse_authorization_response(
            br#"{"authorizationData": [{"authorizationToken": "QVdTOmh1bnRlcjI="}]}"#,
        )
        .unwrap();
        assert!(!format!("{:?}", data).contains("QVdTOmh1bnRlcjI="));
    }

    #[test]
    fn only_basic_credentials_with_a_window_are_reusable() {
        assert!(!RegistryCredentials::Anonymous.is_reusable());

        let mut creds = Credentials::new("AWS", "pw");
        assert!(!RegistryCredentials::Basic(creds.clone()).is_reusable());

        creds.expires_at = Some(Utc::now() + chrono::Duration::hours(12));
        assert!(RegistryCredentials::Basic(creds).is_reusable());
    }

    #[test]
    fn profile_is_kept() {
        let provider = EcrAuthProvider::new(Some("us-east-1".to_string())).with_profile("builder");
        assert_eq!(provider.profile.as_deref(), Some("builder"));
    }

    #[tokio::test]
    async fn static_provider_yields_basic_auth() {
        let provider = StaticAuth(Credentials::new("user", "pass"));
        match provider.authenticate().await.unwrap().to_registry_auth() {
            RegistryAuth::Basic(user, pass) => {
                assert_eq!(user, "user");
                assert_eq!(pass, "pass");
            }
            _ => panic!("expected basic auth"),
        }
    }
}
