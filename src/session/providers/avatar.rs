//! Best-effort avatar download for provisioned accounts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Larger avatars are refused.
pub const MAX_AVATAR_BYTES: usize = 5 * 1024 * 1024;

/// Where downloaded avatars end up. Returns the reference stored on the user.
#[async_trait]
pub trait AvatarStore: Send + Sync {
    async fn save(&self, file_name: &str, bytes: &[u8]) -> Result<String>;
}

/// Writes avatars into a directory and references them by `prefix + file name`.
#[derive(Clone, Debug)]
pub struct FsAvatarStore {
    dir: PathBuf,
    prefix: String,
}

impl FsAvatarStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl AvatarStore for FsAvatarStore {
    async fn save(&self, file_name: &str, bytes: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(format!("{}{file_name}", self.prefix))
    }
}

#[derive(Clone)]
pub struct AvatarFetcher {
    client: reqwest::Client,
    store: Option<Arc<dyn AvatarStore>>,
    max_bytes: usize,
}

impl AvatarFetcher {
    #[must_use]
    pub fn new(client: reqwest::Client, store: Option<Arc<dyn AvatarStore>>) -> Self {
        Self {
            client,
            store,
            max_bytes: MAX_AVATAR_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Download `url` and store it under the SHA-256 of its bytes.
    ///
    /// # Errors
    /// Returns an error if the download or the write fails, or the body is
    /// larger than the size limit.
    #[instrument(skip(self))]
    pub async fn download(&self, url: &str) -> Result<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .context("avatar request failed")?
            .error_for_status()
            .context("avatar request returned an error status")?;

        if let Some(length) = response.content_length() {
            if usize::try_from(length).unwrap_or(usize::MAX) > self.max_bytes {
                anyhow::bail!("avatar of {length} bytes exceeds {} bytes", self.max_bytes);
            }
        }
        // The declared length can be missing or wrong.
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("failed to read avatar body")?
        {
            if bytes.len() + chunk.len() > self.max_bytes {
                anyhow::bail!("avatar exceeds {} bytes", self.max_bytes);
            }
            bytes.extend_from_slice(&chunk);
        }

        let file_name = format!("{:x}.jpg", Sha256::digest(&bytes));
        store.save(&file_name, &bytes).await.map(Some)
    }

    /// Like [`AvatarFetcher::download`] but never fails; problems are logged.
    pub async fn fetch(&self, url: Option<&str>) -> Option<String> {
        let url = url.map(str::trim).filter(|url| !url.is_empty())?;
        match self.download(url).await {
            Ok(reference) => reference,
            Err(err) => {
                warn!("Failed to fetch avatar: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn can_bind_localhost() -> bool {
        TcpListener::bind("127.0.0.1:0").is_ok()
    }

    #[tokio::test]
    async fn stores_under_content_hash() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"avatar".to_vec()))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("tessera-avatars-{}", ulid::Ulid::new()));
        let fetcher = AvatarFetcher::new(
            reqwest::Client::new(),
            Some(Arc::new(FsAvatarStore::new(&dir, "avatars/"))),
        );
        let url = format!("{}/a.jpg", server.uri());
        let reference = fetcher.fetch(Some(&url)).await;

        let expected = format!("{:x}.jpg", Sha256::digest(b"avatar"));
        assert_eq!(reference, Some(format!("avatars/{expected}")));
        assert_eq!(tokio::fs::read(dir.join(&expected)).await?, b"avatar");
        let _ = tokio::fs::remove_dir_all(&dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_avatars_are_refused() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF; 64]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/small.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF; 16]))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("tessera-avatars-{}", ulid::Ulid::new()));
        let fetcher = AvatarFetcher::new(
            reqwest::Client::new(),
            Some(Arc::new(FsAvatarStore::new(&dir, ""))),
        )
        .with_max_bytes(32);

        let err = fetcher
            .download(&format!("{}/big.jpg", server.uri()))
            .await
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("exceeds 32 bytes"), "{err}");
        assert_eq!(fetcher.fetch(Some(&format!("{}/big.jpg", server.uri()))).await, None);
        assert!(!dir.exists());

        let small = fetcher
            .fetch(Some(&format!("{}/small.jpg", server.uri())))
            .await;
        assert!(small.is_some());
        let _ = tokio::fs::remove_dir_all(&dir).await;
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_swallowed() -> Result<()> {
        if !can_bind_localhost() {
            eprintln!("Skipping test: cannot bind localhost");
            return Ok(());
        }
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join("tessera-avatars-unused");
        let fetcher = AvatarFetcher::new(
            reqwest::Client::new(),
            Some(Arc::new(FsAvatarStore::new(dir, ""))),
        );
        assert_eq!(fetcher.fetch(Some(&server.uri())).await, None);
        assert_eq!(fetcher.fetch(Some("  ")).await, None);
        assert_eq!(fetcher.fetch(None).await, None);

        let disabled = AvatarFetcher::new(reqwest::Client::new(), None);
        assert_eq!(disabled.fetch(Some(&server.uri())).await, None);
        Ok(())
    }
}
