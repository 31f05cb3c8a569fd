//! Upstream chat service client
//!
//! Everything the pool needs from the account-holding upstream: signup,
//! login, session liveness, and streamed chat. This crate is a standalone
//! library with no dependency on the gateway binary; the pool and its tests
//! consume it through the `ChatApi` trait.
//!
//! Request flow:
//! 1. `creds::generate_email()` + `creds::generate_password()` for new accounts
//! 2. `ChatApi::register()` creates the account upstream
//! 3. `ChatApi::login()` turns stored credentials into a session token
//! 4. `ChatApi::chat()` streams the response as decoded `StreamEvent`s
//! 5. `ChatApi::check_session()` probes liveness during health cycles
//!
//! Failures classify into `ErrorKind` (rate-limited / auth / transient /
//! fatal), which is what drives account state in the pool.

pub mod api;
pub mod creds;
pub mod error;
pub mod http;
pub mod sse;

pub use api::{ChatApi, ChatRequest, ChatStream, StreamEvent};
pub use error::{ErrorKind, Result, UpstreamError, classify_status};
pub use http::HttpChatApi;
pub use sse::{SseDecoder, SseLine};
