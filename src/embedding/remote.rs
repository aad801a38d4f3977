//! Remote embedding provider for OpenAI-compatible APIs.
//!
//! Works with OpenAI, SiliconFlow, vLLM, text-embeddings-inference and other
//! endpoints exposing `POST /embeddings`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::provider::{EmbeddingInput, EmbeddingProvider, ProviderError, ProviderResult};
use crate::config::ApiSettings;
use crate::embedding::Embedding;

/// Embedding request body.
#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: serde_json::Value,
    encoding_format: &'static str,
}

/// Embedding response body.
#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// API error response.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<serde_json::Value>,
}

/// Provider that embeds through a remote HTTP API.
///
/// Every `embed` call issues one request bounded by the configured timeout;
/// an expired timeout surfaces as [`ProviderError::Transient`].
pub struct RemoteApiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    identity: String,
    multimodal: bool,
}

impl RemoteApiProvider {
    /// Builds a provider from API settings.
    pub fn new(settings: &ApiSettings) -> ProviderResult<Self> {
        if !settings.has_credentials() {
            return Err(ProviderError::Permanent(
                "api key and base url are required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| ProviderError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        tracing::info!(
            base_url = %settings.base_url,
            model = %settings.model,
            "Initialized remote embedding provider"
        );

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            identity: format!("api:{}", settings.model),
            multimodal: settings.multimodal,
        })
    }

    /// Overrides the HTTP client (useful for custom proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }

        headers
    }

    async fn build_input(&self, input: EmbeddingInput<'_>) -> ProviderResult<serde_json::Value> {
        match input {
            EmbeddingInput::Image(record) if self.multimodal => {
                let bytes = tokio::fs::read(&record.source).await.map_err(|e| {
                    ProviderError::Permanent(format!(
                        "cannot read image {}: {}",
                        record.source.display(),
                        e
                    ))
                })?;
                let data_url = format!(
                    "data:{};base64,{}",
                    mime_for(&record.source),
                    BASE64.encode(bytes)
                );
                Ok(serde_json::json!([{ "image": data_url }]))
            }
            other => Ok(serde_json::Value::String(other.text().to_string())),
        }
    }

    async fn handle_error_response(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let message = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.error.message,
            Err(_) => format!("HTTP {}", status),
        };
        classify_status(status, message)
    }
}

/// Maps an HTTP error status onto the retry taxonomy.
fn classify_status(status: u16, message: String) -> ProviderError {
    match status {
        429 | 500..=599 => ProviderError::Transient(format!("{} - {}", status, message)),
        401 | 403 => ProviderError::Permanent(format!("authentication failed: {}", message)),
        _ => ProviderError::Permanent(format!("{} - {}", status, message)),
    }
}

/// Maps a transport-level failure onto the retry taxonomy.
fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transient(format!("request timed out: {}", err))
    } else if err.is_decode() || err.is_builder() {
        ProviderError::Permanent(err.to_string())
    } else {
        ProviderError::Transient(err.to_string())
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteApiProvider {
    fn name(&self) -> &str {
        "remote"
    }

    fn model_id(&self) -> &str {
        &self.identity
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    async fn embed(&self, input: EmbeddingInput<'_>) -> ProviderResult<Embedding> {
        let url = format!("{}/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            input: self.build_input(input).await?,
            encoding_format: "float",
        };

        tracing::debug!(url = %url, model = %self.model, "Requesting remote embedding");

        let response = self
            .client
            .post(&url)
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(Self::handle_error_response(response).await);
        }

        // A stalled body is a transport failure; only bytes that arrived
        // and do not parse count as a malformed response.
        let bytes = response.bytes().await.map_err(classify_transport)?;
        let parsed: EmbeddingResponse = serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::Permanent(format!("failed to parse embedding response: {}", e))
        })?;

        let data = parsed
            .data
            .into_iter()
            .min_by_key(|d| d.index)
            .ok_or_else(|| ProviderError::Permanent("no embedding in response".to_string()))?;

        if data.embedding.is_empty() {
            return Err(ProviderError::Permanent("empty embedding in response".to_string()));
        }

        Ok(Embedding::new(data.embedding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ImageRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings(base_url: &str) -> ApiSettings {
        ApiSettings {
            api_key: "test-key".to_string(),
            base_url: base_url.to_string(),
            model: "BAAI/bge-m3".to_string(),
            timeout_secs: 1,
            multimodal: false,
        }
    }

    /// Serves a single HTTP response and returns the base URL.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}/v1", addr)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    #[test]
    fn requires_credentials() {
        let mut s = settings("http://localhost/v1");
        s.api_key = " ".to_string();
        assert!(matches!(
            RemoteApiProvider::new(&s),
            Err(ProviderError::Permanent(_))
        ));
    }

    #[test]
    fn identity_and_trailing_slash() {
        let provider = RemoteApiProvider::new(&settings("http://localhost:8080/v1/")).unwrap();
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
        assert_eq!(provider.model_id(), "api:BAAI/bge-m3");
        assert_eq!(provider.name(), "remote");
        assert!(provider.dimension().is_none());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(429, "slow down".into()).is_transient());
        assert!(classify_status(503, "unavailable".into()).is_transient());
        assert!(!classify_status(401, "bad key".into()).is_transient());
        assert!(!classify_status(400, "bad input".into()).is_transient());
    }

    #[test]
    fn request_serialization() {
        let body = EmbeddingRequest {
            model: "m",
            input: serde_json::Value::String("hello".into()),
            encoding_format: "float",
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"model":"m","input":"hello","encoding_format":"float"}"#);
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a")), "application/octet-stream");
    }

    #[tokio::test]
    async fn image_input_uses_description_unless_multimodal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let record = ImageRecord::new("cat.png", &path, "a cat");

        let provider = RemoteApiProvider::new(&settings("http://localhost/v1")).unwrap();
        let input = provider.build_input(EmbeddingInput::Image(&record)).await.unwrap();
        assert_eq!(input, serde_json::json!("a cat"));

        let mut s = settings("http://localhost/v1");
        s.multimodal = true;
        let provider = RemoteApiProvider::new(&s).unwrap();
        let input = provider.build_input(EmbeddingInput::Image(&record)).await.unwrap();
        assert_eq!(
            input,
            serde_json::json!([{ "image": "data:image/png;base64,AQID" }])
        );
    }

    #[tokio::test]
    async fn embed_parses_success_response() {
        let url = serve_once(
            "200 OK",
            r#"{"data":[{"embedding":[0.5,0.25],"index":0}],"model":"m"}"#,
        )
        .await;
        let provider = RemoteApiProvider::new(&settings(&url)).unwrap();

        let embedding = provider.embed(EmbeddingInput::Query("cat")).await.unwrap();
        assert_eq!(embedding.values, vec![0.5, 0.25]);
    }

    #[tokio::test]
    async fn unauthorized_is_permanent() {
        let url = serve_once(
            "401 Unauthorized",
            r#"{"error":{"message":"invalid api key","type":"auth"}}"#,
        )
        .await;
        let provider = RemoteApiProvider::new(&settings(&url)).unwrap();

        let err = provider.embed(EmbeddingInput::Query("cat")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("invalid api key"));
    }

    #[tokio::test]
    async fn malformed_body_is_permanent() {
        let url = serve_once("200 OK", r#"{"data": "nope"}"#).await;
        let provider = RemoteApiProvider::new(&settings(&url)).unwrap();

        let err = provider.embed(EmbeddingInput::Query("cat")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("failed to parse"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let url = serve_once("502 Bad Gateway", "upstream down").await;
        let provider = RemoteApiProvider::new(&settings(&url)).unwrap();

        let err = provider.embed(EmbeddingInput::Query("cat")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let provider = RemoteApiProvider::new(&settings(&format!("http://{}/v1", addr))).unwrap();
        let err = provider.embed(EmbeddingInput::Query("cat")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn stalled_body_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"data\":",
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let provider = RemoteApiProvider::new(&settings(&format!("http://{}/v1", addr))).unwrap();
        let err = provider.embed(EmbeddingInput::Query("cat")).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {}", err);
    }
}
