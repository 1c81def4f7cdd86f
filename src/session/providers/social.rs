//! Verification of access tokens issued by social identity providers.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

/// What the core needs from a verified social identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocialProfile {
    pub external_id: String,
    pub name: String,
    pub email: String,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait SocialVerifier: Send + Sync {
    /// # Errors
    /// Returns an error when the token cannot be verified.
    async fn verify(&self, token: &str) -> Result<SocialProfile>;
}

fn required(info: &Value, field: &str) -> Result<String> {
    match info.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        _ => bail!("missing {field} in social profile"),
    }
}

async fn get_json(request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
    request
        .send()
        .await
        .with_context(|| format!("{what} request failed"))?
        .error_for_status()
        .with_context(|| format!("{what} returned an error status"))?
        .json()
        .await
        .with_context(|| format!("failed to parse {what} response"))
}

#[derive(Clone, Debug)]
pub struct GoogleVerifier {
    client: reqwest::Client,
    discovery_url: String,
    tokeninfo_url: String,
    client_id: Option<String>,
}

impl GoogleVerifier {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        discovery_url: &str,
        tokeninfo_url: &str,
        client_id: Option<String>,
    ) -> Self {
        Self {
            client,
            discovery_url: discovery_url.to_string(),
            tokeninfo_url: tokeninfo_url.to_string(),
            client_id,
        }
    }

    async fn userinfo(&self, token: &str) -> Result<Value> {
        let configuration = get_json(
            self.client.get(&self.discovery_url),
            "openid configuration",
        )
        .await?;
        let endpoint = configuration
            .get("userinfo_endpoint")
            .and_then(Value::as_str)
            .context("openid configuration has no userinfo_endpoint")?;
        get_json(
            self.client
                .get(endpoint)
                .query(&[("alt", "json")])
                .bearer_auth(token),
            "userinfo",
        )
        .await
    }

    async fn tokeninfo(&self, token: &str) -> Result<Value> {
        let info = get_json(
            self.client
                .get(&self.tokeninfo_url)
                .query(&[("id_token", token)]),
            "tokeninfo",
        )
        .await?;
        if let Some(client_id) = &self.client_id {
            if info.get("aud").and_then(Value::as_str) != Some(client_id.as_str()) {
                bail!("id token audience does not match the configured client id");
            }
        }
        Ok(info)
    }
}

#[async_trait]
impl SocialVerifier for GoogleVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, token: &str) -> Result<SocialProfile> {
        let info = match self.userinfo(token).await {
            Ok(info) => info,
            Err(err) => {
                debug!("userinfo lookup failed, trying tokeninfo: {err:#}");
                self.tokeninfo(token).await?
            }
        };
        Ok(SocialProfile {
            external_id: required(&info, "sub")?,
            name: required(&info, "name")?,
            email: required(&info, "email")?,
            avatar_url: info
                .get("picture")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        })
    }
}

#[derive(Clone, Debug)]
pub struct FacebookVerifier {
    client: reqwest::Client,
    graph_url: String,
}

impl FacebookVerifier {
    #[must_use]
    pub fn new(client: reqwest::Client, graph_url: &str) -> Self {
        Self {
            client,
            graph_url: graph_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SocialVerifier for FacebookVerifier {
    #[instrument(skip_all)]
    async fn verify(&self, token: &str) -> Result<SocialProfile> {
        let info = get_json(
            self.client
                .get(format!("{}/me", self.graph_url))
                .query(&[("fields", "id,email,name,picture"), ("access_token", token)]),
            "graph",
        )
        .await?;
        Ok(SocialProfile {
            external_id: required(&info, "id")?,
            name: required(&info, "name")?,
            email: required(&info, "email")?,
            avatar_url: info
                .pointer("/picture/data/url")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        })
    }
}
