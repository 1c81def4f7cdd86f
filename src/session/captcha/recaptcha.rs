use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Client for the reCAPTCHA `siteverify` endpoint.
#[derive(Clone, Debug)]
pub struct RecaptchaVerifier {
    client: reqwest::Client,
    verify_url: String,
}

impl RecaptchaVerifier {
    #[must_use]
    pub fn new(client: reqwest::Client, verify_url: &str) -> Self {
        Self {
            client,
            verify_url: verify_url.to_string(),
        }
    }

    /// # Errors
    /// Returns an error on transport failures or an unreadable response.
    #[instrument(skip_all)]
    pub async fn verify(&self, secret: &SecretString, response_token: &str) -> Result<bool> {
        let response: SiteVerifyResponse = self
            .client
            .post(&self.verify_url)
            .form(&[
                ("secret", secret.expose_secret()),
                ("response", response_token),
            ])
            .send()
            .await
            .context("reCAPTCHA request failed")?
            .error_for_status()
            .context("reCAPTCHA returned an error status")?
            .json()
            .await
            .context("failed to parse reCAPTCHA response")?;

        if !response.success {
            debug!("reCAPTCHA rejected token: {:?}", response.error_codes);
        }
        Ok(response.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    #[tokio::test]
    async fn verify_trusts_success_flag() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .and(body_string_contains("response=good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .and(body_string_contains("response=bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error-codes": ["invalid-input-response"]
            })))
            .mount(&server)
            .await;

        let verifier = RecaptchaVerifier::new(
            reqwest::Client::new(),
            &format!("{}/siteverify", server.uri()),
        );
        let secret = SecretString::from("secret");
        assert!(verifier.verify(&secret, "good").await?);
        assert!(!verifier.verify(&secret, "bad").await?);
        Ok(())
    }

    #[tokio::test]
    async fn verify_fails_on_server_error() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let verifier = RecaptchaVerifier::new(reqwest::Client::new(), &server.uri());
        assert!(verifier
            .verify(&SecretString::from("secret"), "token")
            .await
            .is_err());
        Ok(())
    }
}
