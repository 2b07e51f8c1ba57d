use super::{AiProvider, Completion, CompletionRequest, TokenStream};
use crate::config::ProviderConfig;
use crate::errors::GatewayError;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ollama generate request (native API, not OpenAI-compatible).
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

/// One generate response object; streaming sends one per line.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateChunk {
    model: String,
    response: String,
    done: bool,
    error: Option<String>,
}

/// Local model served by Ollama.
pub struct OllamaProvider {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let mut builder = self.client.post(&url).json(&body);
        if !stream {
            builder = builder.timeout(self.timeout);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::Provider(format!("ollama returned status {status}")).into());
        }
        Ok(resp)
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let resp = self.send(request, false).await?;
        let chunk: GenerateChunk = resp.json().await?;
        if let Some(error) = chunk.error {
            return Err(GatewayError::Provider(format!("ollama error: {error}")).into());
        }
        let text = chunk.response.trim().to_string();
        if text.is_empty() {
            return Err(GatewayError::Provider("ollama returned empty response".into()).into());
        }
        Ok(Completion {
            text,
            model: if chunk.model.is_empty() {
                request.model.clone()
            } else {
                chunk.model
            },
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<TokenStream> {
        let resp = self.send(request, true).await?;
        Ok(Box::pin(ndjson_tokens(Box::pin(resp.bytes_stream()))))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(
            self.client.get(&url).timeout(Duration::from_secs(5)).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

// ── NDJSON decoding ──────────────────────────────────────────────

struct NdjsonState<S> {
    body: S,
    buffer: String,
    finished: bool,
}

enum Line {
    Token(String),
    Skip,
    Done,
    Failed(anyhow::Error),
}

fn decode_line(line: &str) -> Line {
    let line = line.trim();
    if line.is_empty() {
        return Line::Skip;
    }
    match serde_json::from_str::<GenerateChunk>(line) {
        Ok(GenerateChunk {
            error: Some(error), ..
        }) => Line::Failed(GatewayError::Provider(format!("ollama error: {error}")).into()),
        Ok(chunk) if chunk.done && chunk.response.is_empty() => Line::Done,
        Ok(chunk) if chunk.done => Line::Token(chunk.response),
        Ok(chunk) if chunk.response.is_empty() => Line::Skip,
        Ok(chunk) => Line::Token(chunk.response),
        Err(e) => Line::Failed(
            GatewayError::Provider(format!("ollama stream decode error: {e}")).into(),
        ),
    }
}

/// Turn an NDJSON byte stream into response fragments. Lines may be split
/// across chunks; the stream ends at the first `done` object.
fn ndjson_tokens<S, B, E>(body: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = NdjsonState {
        body,
        buffer: String::new(),
        finished: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(pos) = st.buffer.find('\n') {
                let line: String = st.buffer.drain(..=pos).collect();
                match decode_line(&line) {
                    Line::Token(token) => return Some((Ok(token), st)),
                    Line::Skip => continue,
                    Line::Done => return None,
                    Line::Failed(err) => {
                        st.buffer.clear();
                        st.finished = true;
                        return Some((Err(err), st));
                    }
                }
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => st.buffer.push_str(&String::from_utf8_lossy(bytes.as_ref())),
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(anyhow::Error::new(e)), st));
                }
                None => {
                    // Flush a final line that arrived without a newline.
                    st.finished = true;
                    if !st.buffer.trim().is_empty() {
                        st.buffer.push('\n');
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "Explain the triage result.".into(),
            model: "llama3.2:3b".into(),
            temperature: 0.1,
            max_tokens: 300,
        }
    }

    #[tokio::test]
    async fn complete_posts_generate_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({
                "model": "llama3.2:3b",
                "stream": false,
                "options": {"temperature": 0.1, "num_predict": 300}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "llama3.2:3b",
                "response": "  The system flagged fast breathing.  ",
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(&server.uri(), Duration::from_secs(5));
        let completion = provider.complete(&request()).await.unwrap();
        assert_eq!(completion.text, "The system flagged fast breathing.");
        assert_eq!(completion.model, "llama3.2:3b");
    }

    #[tokio::test]
    async fn non_success_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(&server.uri(), Duration::from_secs(5));
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Provider(_))
        ));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn empty_response_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"response": "", "done": true})),
            )
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(&server.uri(), Duration::from_secs(5));
        assert!(provider.complete(&request()).await.is_err());
    }

    #[tokio::test]
    async fn stream_yields_tokens_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"response\":\"The \",\"done\":false}\n",
            "{\"response\":\"system \",\"done\":false}\n",
            "{\"response\":\"flagged.\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(&server.uri(), Duration::from_secs(5));
        let tokens: Vec<String> = provider
            .stream(&request())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens.concat(), "The system flagged.");
    }

    #[tokio::test]
    async fn ndjson_lines_split_across_chunks() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"{\"response\":\"Hel".to_vec()),
            Ok(b"lo\",\"done\":false}\n{\"respo".to_vec()),
            Ok(b"nse\":\" world\",\"done\":false}".to_vec()),
        ];
        let tokens: Vec<String> = ndjson_tokens(stream::iter(chunks))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens, ["Hello", " world"]);
    }

    #[tokio::test]
    async fn ndjson_error_line_ends_stream() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![Ok(
            b"{\"response\":\"a\",\"done\":false}\n{\"error\":\"model not found\"}\n{\"response\":\"b\"}\n"
                .to_vec(),
        )];
        let items: Vec<Result<String>> = ndjson_tokens(stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "a");
        assert!(items[1]
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("model not found"));
    }

    #[tokio::test]
    async fn health_check_uses_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
            .mount(&server)
            .await;
        let provider = OllamaProvider::new(&format!("{}/", server.uri()), Duration::from_secs(5));
        assert!(provider.health_check().await);
    }
}
