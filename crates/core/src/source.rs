//! Thumbnail retrieval
//!
//! The loader never generates thumbnails itself. It consumes an endpoint that
//! may be slow or failing, behind the [`ThumbnailSource`] trait so hosts and
//! tests can substitute their own transport.

use crate::config::LoaderConfig;
use crate::error::LoadError;
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use thumbgrid_cache::ThumbnailKey;
use thumbgrid_scheduler::CancellationToken;

/// A fetched thumbnail.
///
/// `url` is the canonical direct URL of the image; hosts that can display
/// server-cacheable URLs should prefer it over `bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub key: ThumbnailKey,
    pub url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Shared handle to a resolved thumbnail.
///
/// The cache and every cell displaying the image hold clones; the image is
/// released when the last clone is dropped.
pub type ThumbnailHandle = Arc<Thumbnail>;

/// Where thumbnails come from.
pub trait ThumbnailSource: Send + Sync {
    /// Fetch one thumbnail.
    ///
    /// Implementations that can abort a request in flight should poll
    /// `token` and return [`LoadError::Cancelled`] once it fires. A panic
    /// inside `fetch` fails the key with [`LoadError::InvalidResponse`].
    fn fetch(&self, key: &ThumbnailKey, token: &CancellationToken) -> Result<Thumbnail, LoadError>;

    /// Best-effort hint that `paths` will be requested soon at `size`.
    fn preload(&self, _paths: &[String], _size: u32) -> Result<(), LoadError> {
        Ok(())
    }
}

impl<T: ThumbnailSource + ?Sized> ThumbnailSource for Arc<T> {
    fn fetch(&self, key: &ThumbnailKey, token: &CancellationToken) -> Result<Thumbnail, LoadError> {
        (**self).fetch(key, token)
    }

    fn preload(&self, paths: &[String], size: u32) -> Result<(), LoadError> {
        (**self).preload(paths, size)
    }
}

#[derive(Debug, Serialize)]
struct PreloadRequest<'a> {
    paths: &'a [String],
    size: u32,
}

/// [`ThumbnailSource`] backed by `GET /thumbnail?path=..&size=..`.
#[derive(Debug, Clone)]
pub struct HttpThumbnailSource {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpThumbnailSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            agent: ureq::agent(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.server_url.as_str())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Direct URL of a thumbnail, with the path percent-encoded
    pub fn thumbnail_url(&self, key: &ThumbnailKey) -> String {
        format!(
            "{}/thumbnail?path={}&size={}",
            self.base_url,
            urlencoding::encode(&key.path),
            key.size
        )
    }

    fn preload_url(&self) -> String {
        format!("{}/thumbnail/preload", self.base_url)
    }
}

fn map_ureq_error(err: ureq::Error) -> LoadError {
    match err {
        ureq::Error::Status(status, _) => LoadError::from_status(status),
        ureq::Error::Transport(transport) => LoadError::TransientNetwork(transport.to_string()),
    }
}

impl ThumbnailSource for HttpThumbnailSource {
    fn fetch(&self, key: &ThumbnailKey, token: &CancellationToken) -> Result<Thumbnail, LoadError> {
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let url = self.thumbnail_url(key);
        let resp = self.agent.get(&url).call().map_err(map_ureq_error)?;
        let content_type = resp.header("Content-Type").map(str::to_string);

        let mut bytes = Vec::new();
        resp.into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| LoadError::TransientNetwork(e.to_string()))?;

        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if bytes.is_empty() {
            return Err(LoadError::InvalidResponse(format!("empty body for {key}")));
        }

        Ok(Thumbnail {
            key: key.clone(),
            url,
            content_type,
            bytes,
        })
    }

    fn preload(&self, paths: &[String], size: u32) -> Result<(), LoadError> {
        let body = serde_json::to_string(&PreloadRequest { paths, size })
            .map_err(|e| LoadError::InvalidResponse(e.to_string()))?;

        self.agent
            .post(&self.preload_url())
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(map_ureq_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_url_encodes_path() {
        let source = HttpThumbnailSource::new("http://127.0.0.1:8080/");
        let key = ThumbnailKey::new("lot 7/wafer#3&x.png", 256);
        assert_eq!(
            source.thumbnail_url(&key),
            "http://127.0.0.1:8080/thumbnail?path=lot%207%2Fwafer%233%26x.png&size=256"
        );
    }

    #[test]
    fn test_from_config() {
        let config = LoaderConfig::default().with_server_url("http://thumbs.local:9000");
        let source = HttpThumbnailSource::from_config(&config);
        assert_eq!(source.base_url(), "http://thumbs.local:9000");
        assert_eq!(source.preload_url(), "http://thumbs.local:9000/thumbnail/preload");
    }

    #[test]
    fn test_fetch_checks_token_first() {
        // Nothing listens on this address; a cancelled token must not even try
        let source = HttpThumbnailSource::new("http://127.0.0.1:9");
        let token = CancellationToken::new();
        token.cancel();
        let result = source.fetch(&ThumbnailKey::new("a.png", 64), &token);
        assert_eq!(result, Err(LoadError::Cancelled));
    }

    #[test]
    fn test_preload_body() {
        let paths = vec!["a.png".to_string(), "b/c.png".to_string()];
        let body = serde_json::to_string(&PreloadRequest {
            paths: &paths,
            size: 512,
        })
        .unwrap();
        assert_eq!(body, r#"{"paths":["a.png","b/c.png"],"size":512}"#);
    }
}
