//! OpenAI-compatible chat completions backend.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use storage::{LogMessage, ModelCredentials};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CompletionRequest, Fragment, FragmentStream, ModelBackend, ToolCallDelta, ToolSpec};
use crate::BackendError;

/// Longest error body quoted in a [`BackendError`].
const ERROR_BODY_LIMIT: usize = 300;

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> ApiMessage<'a> {
    fn from_log(message: &'a LogMessage) -> Self {
        let content = if message.content.is_empty() && !message.tool_calls.is_empty() {
            None
        } else {
            Some(message.content.as_str())
        };
        Self {
            role: message.role.as_str(),
            content,
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| ApiToolCall {
                    id: &call.id,
                    call_type: "function",
                    function: ApiFunctionCall {
                        name: &call.name,
                        arguments: &call.arguments,
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: ApiFunctionCall<'a>,
}

#[derive(Debug, Serialize)]
struct ApiFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ApiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

impl<'a> From<&'a ToolSpec> for ApiTool<'a> {
    fn from(spec: &'a ToolSpec) -> Self {
        Self {
            tool_type: "function",
            function: ApiFunction {
                name: &spec.name,
                description: &spec.description,
                parameters: &spec.parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiChunk {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    delta: ApiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ApiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct ApiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Backend for any server speaking the OpenAI chat completions protocol.
///
/// Endpoint, key and sampling settings come with each request, so one
/// backend serves every configured model.
#[derive(Debug, Clone, Default)]
pub struct OpenAiBackend {
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client (proxies, timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn request_body<'a>(request: &CompletionRequest<'a>) -> ApiRequest<'a> {
    let credentials = request.credentials;
    ApiRequest {
        model: &credentials.model,
        messages: request.messages.iter().map(ApiMessage::from_log).collect(),
        stream: true,
        temperature: credentials.temperature,
        max_tokens: credentials.max_tokens,
        tools: request.tools.iter().map(ApiTool::from).collect(),
    }
}

fn completions_url(credentials: &ModelCredentials) -> String {
    format!("{}/chat/completions", credentials.endpoint.trim_end_matches('/'))
}

impl ModelBackend for OpenAiBackend {
    async fn stream_completion(
        &self,
        request: CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<FragmentStream, BackendError> {
        let credentials = request.credentials;
        let mut http = self
            .client
            .post(completions_url(credentials))
            .header("accept", "text/event-stream")
            .json(&request_body(&request));
        if !credentials.api_key.is_empty() {
            http = http.bearer_auth(&credentials.api_key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| BackendError::Other(format!("network error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        debug!(
            model = %credentials.model,
            tools = request.tools.len(),
            "Streaming completion"
        );
        Ok(sse_fragments(response.bytes_stream())
            .take_until(cancel.clone().cancelled_owned())
            .boxed())
    }
}

/// Map an unsuccessful HTTP response onto a [`BackendError`].
fn classify(status: StatusCode, body: &str) -> BackendError {
    let message = match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => body.trim().chars().take(ERROR_BODY_LIMIT).collect(),
    };
    match status.as_u16() {
        401 | 403 => BackendError::Auth(message),
        429 => BackendError::RateLimited(message),
        code @ 500..=599 => BackendError::Server {
            status: code,
            message,
        },
        code => BackendError::Other(format!("HTTP {code}: {message}")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Decode a server-sent-event byte stream into fragments.
///
/// Lines may be split across chunks at any byte. Ends at `[DONE]`, at the end
/// of the body, or after the first error.
fn sse_fragments<S, B, E>(bytes: S) -> impl Stream<Item = Result<Fragment, BackendError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    stream::unfold(
        (Box::pin(bytes), SseDecoder::default()),
        |(mut bytes, mut decoder)| async move {
            loop {
                if let Some(item) = decoder.queue.pop_front() {
                    return Some((item, (bytes, decoder)));
                }
                if decoder.done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                    Some(Err(e)) => {
                        decoder.done = true;
                        let error = BackendError::Other(format!("stream read error: {e}"));
                        return Some((Err(error), (bytes, decoder)));
                    }
                    None => decoder.finish(),
                }
            }
        },
    )
}

#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    queue: VecDeque<Result<Fragment, BackendError>>,
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.line(&line);
        }
    }

    fn finish(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        self.line(&rest);
        self.done = true;
    }

    fn line(&mut self, raw: &[u8]) {
        if self.done {
            return;
        }
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        // Comments, `event:` lines and blank separators carry nothing.
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        if data.is_empty() {
            return;
        }
        match serde_json::from_str::<ApiChunk>(data) {
            Ok(chunk) => self.chunk(chunk),
            Err(e) => warn!("Skipping unparseable stream chunk: {e}"),
        }
    }

    fn chunk(&mut self, chunk: ApiChunk) {
        if let Some(error) = chunk.error {
            self.queue.push_back(Err(BackendError::Other(error.message)));
            self.done = true;
            return;
        }
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.queue.push_back(Ok(Fragment::Text(text)));
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                self.queue.push_back(Ok(Fragment::ToolCall(ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                })));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storage::ToolCallRecord;

    fn credentials() -> ModelCredentials {
        ModelCredentials {
            endpoint: "http://localhost:8080/v1/".into(),
            api_key: String::new(),
            model: "local".into(),
            context_size: 8192,
            temperature: 0.2,
            max_tokens: None,
        }
    }

    async fn decode(chunks: &[&str]) -> Vec<Result<Fragment, BackendError>> {
        let owned: Vec<Result<Vec<u8>, std::io::Error>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        sse_fragments(stream::iter(owned)).collect().await
    }

    #[tokio::test]
    async fn text_and_done() {
        let items = decode(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data:{\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ])
        .await;
        assert_eq!(
            items,
            vec![
                Ok(Fragment::Text("Hel".into())),
                Ok(Fragment::Text("lo".into())),
            ]
        );
    }

    #[tokio::test]
    async fn lines_split_across_chunks() {
        let items = decode(&[
            ": keep-alive\n\ndata: {\"choices\":[{\"del",
            "ta\":{\"tool_calls\":[{\"index\":1,\"id\":\"call_9\",\"function\":{\"name\":\"list_dir\",\"arguments\":\"{\\\"pa\"}}]}}]}\r\n",
            "\r\ndata: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"function\":{\"arguments\":\"th\\\":1}\"}}]}}]}",
        ])
        .await;
        assert_eq!(
            items,
            vec![
                Ok(Fragment::ToolCall(ToolCallDelta {
                    index: 1,
                    id: Some("call_9".into()),
                    name: Some("list_dir".into()),
                    arguments: Some("{\"pa".into()),
                })),
                Ok(Fragment::ToolCall(ToolCallDelta {
                    index: 1,
                    id: None,
                    name: None,
                    arguments: Some("th\":1}".into()),
                })),
            ]
        );
    }

    #[tokio::test]
    async fn error_object_ends_the_stream() {
        let items = decode(&[
            "data: {\"error\":{\"message\":\"context length exceeded\"}}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        ])
        .await;
        assert_eq!(
            items,
            vec![Err(BackendError::Other("context length exceeded".into()))]
        );
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let items = decode(&[
            "data: {not json}\n",
            "event: ping\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\",\"tool_calls\":null}}]}\n",
        ])
        .await;
        assert_eq!(items, vec![Ok(Fragment::Text("ok".into()))]);
    }

    #[test]
    fn status_classification() {
        let body = r#"{"error":{"message":"bad key"}}"#;
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED, body),
            BackendError::Auth("bad key".into())
        );
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, ""),
            BackendError::Auth(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            BackendError::RateLimited(m) if m == "slow down"
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, ""),
            BackendError::Server { status: 502, .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, body),
            BackendError::Other(m) if m == "HTTP 400: bad key"
        ));
    }

    #[test]
    fn tools_omitted_when_empty() {
        let credentials = credentials();
        let messages = vec![LogMessage::system("be brief"), LogMessage::user("hi")];
        let request = CompletionRequest {
            credentials: &credentials,
            messages: &messages,
            tools: &[],
        };
        let body = serde_json::to_value(request_body(&request)).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(completions_url(&credentials), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn tool_round_trip_messages() {
        let credentials = credentials();
        let messages = vec![
            LogMessage::assistant_tool_calls(
                "",
                vec![ToolCallRecord {
                    id: "call_1".into(),
                    name: "list_dir".into(),
                    arguments: r#"{"path":"."}"#.into(),
                }],
            ),
            LogMessage::tool_result("call_1", "list_dir", "a.txt"),
        ];
        let tools = vec![ToolSpec {
            name: "list_dir".into(),
            description: "List a directory".into(),
            parameters: json!({"type": "object"}),
        }];
        let request = CompletionRequest {
            credentials: &credentials,
            messages: &messages,
            tools: &tools,
        };
        let body = serde_json::to_value(request_body(&request)).unwrap();

        assert_eq!(
            body["messages"][0],
            json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "list_dir", "arguments": "{\"path\":\".\"}"}
                }]
            })
        );
        assert_eq!(
            body["messages"][1],
            json!({"role": "tool", "content": "a.txt", "tool_call_id": "call_1"})
        );
        assert_eq!(body["tools"][0]["function"]["name"], json!("list_dir"));
    }
}
