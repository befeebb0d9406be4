/// HTTP embedding adapter for an Ollama-compatible `/api/embeddings` endpoint.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{Embedder, EmbedderError};

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeds text by POSTing `{"model", "prompt"}` and reading `{"embedding": [...]}`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
}

impl HttpEmbedder {
    /// Create an adapter for `endpoint` (e.g. `http://localhost:11434`).
    ///
    /// # Errors
    ///
    /// Returns [`EmbedderError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: &str,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbedderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(concat!("coderag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EmbedderError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/api/embeddings", endpoint.trim_end_matches('/')),
            model: model.to_string(),
            dimensions,
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> EmbedderError {
        if err.is_timeout() {
            EmbedderError::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            EmbedderError::Unavailable(err.to_string())
        } else {
            EmbedderError::InvalidResponse(err.to_string())
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(EmbedderError::Unavailable(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(EmbedderError::Rejected(format!("server returned {status}")));
        }

        let body: EmbeddingResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                EmbedderError::Timeout(self.timeout)
            } else {
                EmbedderError::InvalidResponse(e.to_string())
            }
        })?;

        if body.embedding.len() != self.dimensions {
            return Err(EmbedderError::InvalidResponse(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawn a minimal HTTP server that answers each connection with the next
    /// canned response. Returns the base URL.
    async fn spawn_mock_server(responses: Vec<String>) -> String {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            for resp in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.split();
                    let mut buf_reader = BufReader::new(reader);
                    let mut content_length = 0usize;
                    let mut line = String::new();
                    loop {
                        line.clear();
                        buf_reader.read_line(&mut line).await.unwrap_or(0);
                        if line == "\r\n" || line == "\n" || line.is_empty() {
                            break;
                        }
                        let lower = line.to_ascii_lowercase();
                        if let Some(value) = lower.strip_prefix("content-length:") {
                            content_length = value.trim().parse().unwrap_or(0);
                        }
                    }
                    let mut body = vec![0u8; content_length];
                    buf_reader.read_exact(&mut body).await.ok();
                    writer.write_all(resp.as_bytes()).await.ok();
                });
            }
        });

        format!("http://127.0.0.1:{port}")
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn embedder(endpoint: &str, dimensions: usize) -> HttpEmbedder {
        HttpEmbedder::new(endpoint, "nomic-embed-text", dimensions, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_embed_success() {
        let url = spawn_mock_server(vec![json_response(
            "200 OK",
            r#"{"embedding":[0.1,0.2,0.3]}"#,
        )])
        .await;
        let vector = embedder(&url, 3).embed("def f(): pass").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let url = spawn_mock_server(vec![json_response("503 Service Unavailable", "{}")]).await;
        let err = embedder(&url, 3).embed("x").await.unwrap_err();
        assert!(matches!(err, EmbedderError::Unavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let url = spawn_mock_server(vec![json_response(
            "400 Bad Request",
            r#"{"error":"bad model"}"#,
        )])
        .await;
        let err = embedder(&url, 3).embed("x").await.unwrap_err();
        assert!(matches!(err, EmbedderError::Rejected(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_wrong_dimensions_is_invalid() {
        let url =
            spawn_mock_server(vec![json_response("200 OK", r#"{"embedding":[0.1,0.2]}"#)]).await;
        let err = embedder(&url, 3).embed("x").await.unwrap_err();
        assert!(matches!(err, EmbedderError::InvalidResponse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid() {
        let url = spawn_mock_server(vec![json_response("200 OK", r#"{"vectors":[]}"#)]).await;
        let err = embedder(&url, 3).embed("x").await.unwrap_err();
        assert!(matches!(err, EmbedderError::InvalidResponse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = embedder(&format!("http://127.0.0.1:{port}"), 3)
            .embed("x")
            .await
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let e = embedder("http://localhost:11434/", 768);
        assert_eq!(e.url, "http://localhost:11434/api/embeddings");
        assert_eq!(e.name(), "nomic-embed-text");
    }
}
