use futures_util::{Stream, StreamExt};
use std::future::Future;
use once_cell::sync::Lazy;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

use crate::config::Settings;
use crate::error::TranslateError;

pub(crate) static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest silence tolerated while waiting for response headers or the next streamed chunk.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn idle_bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, TranslateError>
where
    TranslateError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(TranslateError::Timeout(limit)),
    }
}

/// Next body chunk, or `Timeout` when the server goes quiet for longer than `idle`.
pub(crate) async fn next_chunk<S, B>(stream: &mut S, idle: Duration) -> Result<Option<B>, TranslateError>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
{
    match tokio::time::timeout(idle, stream.next()).await {
        Err(_) => Err(TranslateError::Timeout(idle)),
        Ok(None) => Ok(None),
        Ok(Some(chunk)) => Ok(Some(chunk?)),
    }
}

/// One translation: built from a settings snapshot when the hotkey fires.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub stream: bool,
}

impl TranslationRequest {
    pub fn from_settings(text: &str, settings: &Settings) -> Self {
        let api_key = settings.api_key.trim();
        Self {
            text: text.to_string(),
            source_lang: settings.source_lang.clone(),
            target_lang: settings.target_lang.clone(),
            model: settings.model.clone(),
            base_url: settings.base_url.clone(),
            api_key: (!api_key.is_empty()).then(|| api_key.to_string()),
            stream: settings.stream,
        }
    }

    pub fn system_prompt(&self) -> String {
        let source = self.source_lang.trim();
        if source.is_empty() || source.eq_ignore_ascii_case("auto") {
            format!(
                "Translate the following segment into {}, without additional explanation.",
                self.target_lang.trim()
            )
        } else {
            format!(
                "Translate the following segment from {} into {}, without additional explanation.",
                source,
                self.target_lang.trim()
            )
        }
    }
}

pub fn chat_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(serde::Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(serde::Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(serde::Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(serde::Deserialize)]
struct Delta {
    content: Option<String>,
}

/// Splits a byte stream into lines; a line may arrive across several chunks.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left after the stream ended without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

#[derive(Debug, PartialEq)]
pub enum SseLine {
    Delta(String),
    Done,
    Skip,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|s| !s.is_empty())
            .map(SseLine::Delta)
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            log::debug!("Skipping unparsable stream line ({}): {}", e, data);
            SseLine::Skip
        }
    }
}

/// Recognizes `{"error": {"message": "model \"x\" not found ..."}}`.
pub fn is_model_not_found(body: &str, model: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|m| m.contains("not found") && m.contains(model))
        .unwrap_or(false)
}

fn content_of(parsed: ChatResponse) -> Result<String, TranslateError> {
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(TranslateError::EmptyResponse)
}

/// Sends one chat-completion request. Streamed text so far is passed to `on_partial`.
pub async fn translate<F>(req: &TranslationRequest, on_partial: F) -> Result<String, TranslateError>
where
    F: FnMut(&str),
{
    translate_with_idle(req, IDLE_TIMEOUT, on_partial).await
}

pub(crate) async fn translate_with_idle<F>(
    req: &TranslationRequest,
    idle: Duration,
    mut on_partial: F,
) -> Result<String, TranslateError>
where
    F: FnMut(&str),
{
    let url = chat_url(&req.base_url);
    let system = req.system_prompt();
    let body = ChatRequest {
        model: &req.model,
        messages: vec![
            ChatMessage { role: "system", content: &system },
            ChatMessage { role: "user", content: &req.text },
        ],
        temperature: 0.1,
        stream: req.stream,
    };

    log::info!("POST {} (model {}, stream {})", url, req.model, req.stream);
    log::debug!("Request payload: {}", serde_json::to_string(&body).unwrap_or_default());

    let mut builder = CLIENT.post(&url).json(&body);
    if let Some(key) = &req.api_key {
        builder = builder.bearer_auth(key);
    }
    if !req.stream {
        builder = builder.timeout(REQUEST_TIMEOUT);
    }
    let resp = idle_bounded(idle, builder.send()).await?;

    let status = resp.status();
    log::info!("Response status: {}", status);
    if !status.is_success() {
        let text = idle_bounded(idle, resp.text()).await.unwrap_or_default();
        log::debug!("Error body: {}", text);
        if is_model_not_found(&text, &req.model) {
            return Err(TranslateError::ModelNotFound(req.model.clone()));
        }
        return Err(TranslateError::Api { status: status.as_u16(), body: text });
    }

    let is_sse = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let out = if req.stream && is_sse {
        read_event_stream(resp, idle, &mut on_partial).await?
    } else {
        let text = idle_bounded(idle, resp.text()).await?;
        log::debug!("Response body: {}", text);
        let parsed: ChatResponse = serde_json::from_str(&text)?;
        content_of(parsed)?
    };

    log::info!("Translation result: {} chars", out.chars().count());
    Ok(out)
}

async fn read_event_stream<F>(
    resp: reqwest::Response,
    idle: Duration,
    on_partial: &mut F,
) -> Result<String, TranslateError>
where
    F: FnMut(&str),
{
    let mut stream = resp.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut out = String::new();
    let mut done = false;

    let mut handle = |line: &str, out: &mut String| -> bool {
        match parse_sse_line(line) {
            SseLine::Delta(piece) => {
                out.push_str(&piece);
                on_partial(out);
                false
            }
            SseLine::Done => true,
            SseLine::Skip => false,
        }
    };

    while let Some(chunk) = next_chunk(&mut stream, idle).await? {
        for line in lines.push(&chunk) {
            if handle(&line, &mut out) {
                done = true;
                break;
            }
        }
        if done {
            break;
        }
    }
    if !done {
        if let Some(line) = lines.finish() {
            handle(&line, &mut out);
        }
    }

    let out = out.trim().to_string();
    if out.is_empty() {
        return Err(TranslateError::EmptyResponse);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod test_server {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use std::time::Duration;

    /// Answers exactly one HTTP request, writing `chunks` one by one, then closes.
    /// The join handle yields the raw request text.
    pub async fn serve_once(
        status: &str,
        content_type: &str,
        chunks: Vec<String>,
    ) -> (String, JoinHandle<String>) {
        serve(Some((status, content_type)), chunks, false).await
    }

    /// Like `serve_once`, but keeps the connection open and silent after the last chunk.
    /// With `head == None` not even the status line is sent.
    pub async fn serve_and_hang(head: Option<(&str, &str)>, chunks: Vec<String>) -> String {
        serve(head, chunks, true).await.0
    }

    async fn serve(
        head: Option<(&str, &str)>,
        chunks: Vec<String>,
        hang: bool,
    ) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let head = head.map(|(status, content_type)| {
            format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
                status, content_type
            )
        });
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let request = read_request(&mut sock).await;
            if let Some(head) = head {
                sock.write_all(head.as_bytes()).await.unwrap();
            }
            for chunk in chunks {
                sock.write_all(chunk.as_bytes()).await.unwrap();
                sock.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            sock.shutdown().await.ok();
            request
        });
        (format!("http://{}", addr), handle)
    }

    async fn read_request(sock: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = sock.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn body_json(request: &str) -> serde_json::Value {
        let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
        serde_json::from_str(body).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::{body_json, serve_and_hang, serve_once};
    use super::*;

    fn request(base_url: &str, stream: bool) -> TranslationRequest {
        TranslationRequest {
            text: "Hello".to_string(),
            source_lang: "English".to_string(),
            target_lang: "French".to_string(),
            model: "test-model".to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            stream,
        }
    }

    fn sse(piece: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n", piece)
    }

    #[test]
    fn chat_url_trims_trailing_slash() {
        assert_eq!(chat_url("http://h:1/v1/"), "http://h:1/v1/chat/completions");
        assert_eq!(chat_url("http://h:1/v1"), "http://h:1/v1/chat/completions");
    }

    #[test]
    fn system_prompt_names_both_languages() {
        let mut req = request("http://x", false);
        assert_eq!(
            req.system_prompt(),
            "Translate the following segment from English into French, without additional explanation."
        );
        req.source_lang = "Auto".to_string();
        assert_eq!(
            req.system_prompt(),
            "Translate the following segment into French, without additional explanation."
        );
    }

    #[test]
    fn request_from_settings_drops_blank_key() {
        let mut settings = Settings::default();
        settings.api_key = "   ".to_string();
        let req = TranslationRequest::from_settings("Hi", &settings);
        assert_eq!(req.api_key, None);
        assert_eq!(req.model, settings.model);
        assert!(req.stream);

        settings.api_key = "sk-1".to_string();
        assert_eq!(TranslationRequest::from_settings("Hi", &settings).api_key.as_deref(), Some("sk-1"));
    }

    #[test]
    fn line_buffer_joins_split_lines() {
        let mut lb = LineBuffer::default();
        assert!(lb.push(b"data: {\"a\"").is_empty());
        assert_eq!(lb.push(b":1}\r\ndata: [DO"), vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(lb.push(b"NE]\n"), vec!["data: [DONE]".to_string()]);
        assert_eq!(lb.finish(), None);

        lb.push("tail é".as_bytes());
        assert_eq!(lb.finish().as_deref(), Some("tail é"));
    }

    #[test]
    fn sse_lines() {
        assert_eq!(parse_sse_line(sse("Bon").trim_end()), SseLine::Delta("Bon".to_string()));
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[test]
    fn model_not_found_detection() {
        let body = r#"{"error":{"message":"model \"llama3\" not found, try pulling it first"}}"#;
        assert!(is_model_not_found(body, "llama3"));
        assert!(!is_model_not_found(body, "qwen"));
        assert!(!is_model_not_found("not json", "llama3"));
    }

    #[tokio::test]
    async fn plain_response_is_trimmed() {
        let (base, server) = serve_once(
            "200 OK",
            "application/json",
            vec![r#"{"choices":[{"message":{"role":"assistant","content":"  Bonjour\n"}}]}"#.to_string()],
        )
        .await;
        let mut req = request(&format!("{}/v1/", base), false);
        req.api_key = Some("sk-test".to_string());

        let out = translate(&req, |_| panic!("no partials expected")).await.unwrap();
        assert_eq!(out, "Bonjour");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /v1/chat/completions "));
        assert!(raw.to_lowercase().contains("authorization: bearer sk-test"));
        let body = body_json(&raw);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "Hello");
    }

    #[tokio::test]
    async fn streamed_response_reports_partials() {
        let first = sse("Bon");
        let (head, rest) = first.split_at(17);
        let chunks = vec![
            head.to_string(),
            rest.to_string(),
            sse("jour"),
            "data: [DONE]\n\n".to_string(),
        ];
        let (base, server) = serve_once("200 OK", "text/event-stream", chunks).await;

        let mut partials = Vec::new();
        let out = translate(&request(&format!("{}/v1", base), true), |s| partials.push(s.to_string()))
            .await
            .unwrap();

        assert_eq!(out, "Bonjour");
        assert_eq!(partials, vec!["Bon".to_string(), "Bonjour".to_string()]);
        let raw = server.await.unwrap();
        assert_eq!(body_json(&raw)["stream"], true);
        assert!(!raw.to_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn streamed_request_accepts_plain_json() {
        let (base, _server) = serve_once(
            "200 OK",
            "application/json",
            vec![r#"{"choices":[{"message":{"content":"Hola"}}]}"#.to_string()],
        )
        .await;
        let out = translate(&request(&base, true), |_| {}).await.unwrap();
        assert_eq!(out, "Hola");
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let (base, _server) =
            serve_once("200 OK", "text/event-stream", vec!["data: [DONE]\n\n".to_string()]).await;
        let err = translate(&request(&base, true), |_| {}).await.unwrap_err();
        assert!(matches!(err, TranslateError::EmptyResponse));
    }

    #[tokio::test]
    async fn missing_model_is_recognized() {
        let (base, _server) = serve_once(
            "404 Not Found",
            "application/json",
            vec![r#"{"error":{"message":"model \"test-model\" not found, try pulling it first"}}"#.to_string()],
        )
        .await;
        let err = translate(&request(&base, false), |_| {}).await.unwrap_err();
        assert!(err.is_model_not_found());
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_body() {
        let (base, _server) =
            serve_once("500 Internal Server Error", "text/plain", vec!["boom".to_string()]).await;
        match translate(&request(&base, false), |_| {}).await.unwrap_err() {
            TranslateError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let base = serve_and_hang(None, Vec::new()).await;
        let req = TranslationRequest::from_settings("Hello", &Settings {
            base_url: format!("{}/v1", base),
            ..Settings::default()
        });
        assert!(req.stream);

        let idle = Duration::from_millis(300);
        let err = tokio::time::timeout(Duration::from_secs(10), translate_with_idle(&req, idle, |_| {}))
            .await
            .expect("translate must give up on its own")
            .unwrap_err();
        assert!(matches!(err, TranslateError::Timeout(d) if d == idle));
    }

    #[tokio::test]
    async fn stream_that_stalls_midway_times_out() {
        let base = serve_and_hang(Some(("200 OK", "text/event-stream")), vec![sse("Bon")]).await;
        let mut partials = Vec::new();

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            translate_with_idle(&request(&base, true), Duration::from_millis(300), |s| {
                partials.push(s.to_string())
            }),
        )
        .await
        .expect("translate must give up on its own")
        .unwrap_err();

        assert!(matches!(err, TranslateError::Timeout(_)));
        assert_eq!(partials, vec!["Bon".to_string()]);
    }

    #[tokio::test]
    async fn connection_refused_is_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = translate(&request(&format!("http://{}/v1", addr), false), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::Http(_)));
    }
}
