// src/platforms/http.rs - reqwest-backed attachment downloads and image scoring

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

use crate::error::{RelayError, RelayResult};
use crate::platforms::{AttachmentFetcher, ImageClassifier};
use crate::types::{Attachment, ClassifierScore};

fn http_url(raw: &str) -> RelayResult<Url> {
    let url = Url::parse(raw).map_err(|e| RelayError::Infrastructure(format!("invalid url '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::Infrastructure(format!("unsupported url scheme '{}'", other))),
    }
}

fn check_status(status: StatusCode, what: &str) -> RelayResult<()> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::NOT_FOUND => Err(RelayError::NotFound(what.to_string())),
        other => Err(RelayError::Infrastructure(format!("{} returned {}", what, other))),
    }
}

/// Downloads attachments over HTTP(S)
#[derive(Clone)]
pub struct HttpAttachmentFetcher {
    client: Client,
}

impl HttpAttachmentFetcher {
    pub fn new(timeout: Duration) -> RelayResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AttachmentFetcher for HttpAttachmentFetcher {
    async fn fetch(&self, attachment: &Attachment) -> RelayResult<Vec<u8>> {
        let url = http_url(&attachment.url)?;
        let response = self.client.get(url).send().await?;
        check_status(response.status(), &attachment.url)?;

        let bytes = response.bytes().await?;
        debug!("Fetched {} ({} bytes)", attachment.filename, bytes.len());
        Ok(bytes.to_vec())
    }
}

/// Posts raw image bytes to a scoring endpoint that answers `{"nsfw": bool, "score": f32}`
#[derive(Clone)]
pub struct HttpClassifier {
    client: Client,
    endpoint: Url,
}

impl HttpClassifier {
    pub fn new(endpoint: &str, timeout: Duration) -> RelayResult<Self> {
        let endpoint = http_url(endpoint)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ImageClassifier for HttpClassifier {
    async fn classify(&self, bytes: &[u8]) -> RelayResult<ClassifierScore> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| RelayError::Classifier(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(RelayError::Classifier(format!("scoring endpoint returned {}", response.status())));
        }

        let score: ClassifierScore = response
            .json()
            .await
            .map_err(|e| RelayError::Classifier(format!("malformed score: {}", e)))?;
        if !(0.0..=1.0).contains(&score.score) {
            return Err(RelayError::Classifier(format!("score {} out of range", score.score)));
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_http_urls_are_fetched() {
        assert!(http_url("https://cdn.example.com/a.png").is_ok());
        assert!(http_url("http://localhost:8080/a.png").is_ok());
        assert!(http_url("file:///etc/passwd").is_err());
        assert!(http_url("not a url").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK, "x").is_ok());
        assert!(check_status(StatusCode::NOT_FOUND, "x").unwrap_err().is_not_found());
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR, "x"),
            Err(RelayError::Infrastructure(_))
        ));
    }

    #[test]
    fn test_classifier_rejects_bad_endpoint() {
        assert!(HttpClassifier::new("ftp://scores.local", Duration::from_secs(1)).is_err());
        assert!(HttpClassifier::new("http://127.0.0.1:9/score", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_score_payload_shape() {
        let score: ClassifierScore = serde_json::from_str(r#"{"nsfw": true, "score": 0.82}"#).unwrap();
        assert!(score.is_nsfw);
        assert!((score.score - 0.82).abs() < 1e-6);
    }
}
