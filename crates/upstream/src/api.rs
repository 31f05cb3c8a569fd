//! Chat service contract
//!
//! Defines the `ChatApi` trait that decouples pool logic from the concrete
//! upstream. `HttpChatApi` implements it over the real wire protocol; tests
//! implement it with scripted mocks to exercise failover and streaming
//! behavior without a network.

use common::Secret;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// One chat call as it goes upstream.
///
/// `conversation_id` continues an existing upstream conversation; the wire
/// field is camelCase. `thinking` asks for extended reasoning where the
/// model supports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub message: String,
    pub thinking: bool,
    #[serde(rename = "conversationId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// A decoded server-sent event from the upstream chat stream.
///
/// The wire tags events with a `type` field. Unknown types are skipped at
/// the decoding layer, so this enum only lists the kinds the system acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Stream opening, carrying the prompt's token count
    Start {
        #[serde(default)]
        input_tokens: u64,
    },
    /// Incremental response text
    Text { text: String },
    /// End of response with the assembled text and output token count
    Done {
        #[serde(default)]
        full_response: String,
        #[serde(default)]
        output_tokens: u64,
    },
    /// Upstream conversation handle for follow-up requests
    ConversationId { id: String },
    /// In-band upstream failure
    Error { message: String },
}

/// Chunked chat response. Items after the first may fail mid-stream; the
/// consumer decides whether that is retryable (nothing delivered yet) or a
/// truncation (partial output already sent).
pub type ChatStream = BoxStream<'static, Result<StreamEvent>>;

/// Abstraction over the upstream account and chat endpoints.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ChatApi>`), matching how the pool and gateway hold it.
pub trait ChatApi: Send + Sync {
    /// Authenticate with stored credentials and return a session token.
    fn login<'a>(
        &'a self,
        email: &'a str,
        password: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Secret<String>>> + Send + 'a>>;

    /// Create a new upstream account with the given credentials.
    fn register<'a>(
        &'a self,
        email: &'a str,
        password: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Lightweight liveness probe for an existing session.
    fn check_session<'a>(
        &'a self,
        token: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Start a chat call. The upstream always streams; callers that want a
    /// complete response collect the stream.
    fn chat<'a>(
        &'a self,
        token: &'a Secret<String>,
        request: &'a ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatStream>> + Send + 'a>>;
}
