//! HTTP implementation of the chat service contract
//!
//! Endpoints:
//! - `POST /api/auth/login` with `{email, password}` returns `{auth_token}`
//! - `POST /api/auth/signup` with `{email, password}` creates an account
//! - `GET /api/user/me` with a Bearer token answers session liveness
//! - `POST /api/chat/stream` with a Bearer token streams SSE chat events
//!
//! The chat stream yields decoded events; in-band `error` events and read
//! failures surface as `Err` items so consumers see one failure path. The
//! shared `reqwest::Client` is built by the caller (connect and read
//! timeouts belong to service configuration).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use common::Secret;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Deserialize;
use tracing::debug;

use crate::api::{ChatApi, ChatRequest, ChatStream, StreamEvent};
use crate::error::{Result, UpstreamError};
use crate::sse::{SseDecoder, SseLine};

/// Client for the real upstream service.
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth_token: String,
}

impl HttpChatApi {
    /// Wrap a prebuilt client. A trailing slash on `base_url` is tolerated.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn login_call(&self, email: &str, password: &Secret<String>) -> Result<Secret<String>> {
        let response = self
            .client
            .post(self.endpoint("/api/auth/login"))
            .header(reqwest::header::ORIGIN, &self.base_url)
            .json(&serde_json::json!({"email": email, "password": password.expose()}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(UpstreamError::from_status(status.as_u16(), &body));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Transient(format!("invalid login response: {e}")))?;
        debug!(email, "login succeeded");
        Ok(Secret::new(body.auth_token))
    }

    async fn register_call(&self, email: &str, password: &Secret<String>) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("/api/auth/signup"))
            .header(reqwest::header::ORIGIN, &self.base_url)
            .json(&serde_json::json!({"email": email, "password": password.expose()}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(UpstreamError::from_status(status.as_u16(), &body));
        }
        debug!(email, "registration accepted");
        Ok(())
    }

    async fn check_session_call(&self, token: &Secret<String>) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("/api/user/me"))
            .bearer_auth(token.expose())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(UpstreamError::from_status(status.as_u16(), &body));
        }
        Ok(())
    }

    async fn chat_call(&self, token: &Secret<String>, request: &ChatRequest) -> Result<ChatStream> {
        let response = self
            .client
            .post(self.endpoint("/api/chat/stream"))
            .bearer_auth(token.expose())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(UpstreamError::from_status(status.as_u16(), &body));
        }
        Ok(event_stream(response))
    }
}

impl ChatApi for HttpChatApi {
    fn login<'a>(
        &'a self,
        email: &'a str,
        password: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Secret<String>>> + Send + 'a>> {
        Box::pin(self.login_call(email, password))
    }

    fn register<'a>(
        &'a self,
        email: &'a str,
        password: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.register_call(email, password))
    }

    fn check_session<'a>(
        &'a self,
        token: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.check_session_call(token))
    }

    fn chat<'a>(
        &'a self,
        token: &'a Secret<String>,
        request: &'a ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatStream>> + Send + 'a>> {
        Box::pin(self.chat_call(token, request))
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<SseLine>,
    finished: bool,
}

/// Turn a streaming response body into decoded chat events.
///
/// `[DONE]` ends the stream. A clean body EOF without the terminator also
/// ends it, matching upstream behavior on early client aborts. In-band
/// `error` events and transport failures end the stream with an `Err` item.
fn event_stream(response: reqwest::Response) -> ChatStream {
    let state = StreamState {
        body: response.bytes_stream().boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            if let Some(frame) = state.pending.pop_front() {
                match frame {
                    SseLine::Done => {
                        state.finished = true;
                        return None;
                    }
                    SseLine::Event(StreamEvent::Error { message }) => {
                        state.finished = true;
                        let err = UpstreamError::Transient(format!("upstream error event: {message}"));
                        return Some((Err(err), state));
                    }
                    SseLine::Event(event) => return Some((Ok(event), state)),
                }
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(&chunk);
                    state.pending.extend(frames);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    let err = UpstreamError::Transient(format!("stream read failed: {err}"));
                    return Some((Err(err), state));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
