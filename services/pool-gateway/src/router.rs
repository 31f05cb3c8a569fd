//! Request routing across the account pool
//!
//! One inbound chat request walks the pool: select an account, ensure it has
//! a session, open the upstream stream, and await the first event. Failures
//! before that first event mark the account and move on to the next one;
//! once any output exists the attempt is committed and a mid-stream failure
//! ends the response as truncated instead of silently restarting it on
//! another account.
//!
//! The retry budget counts distinct accounts per request. Fatal upstream
//! rejections are surfaced immediately because they indict the request, not
//! the account.

use std::collections::HashSet;
use std::sync::Arc;

use account_pool::{InFlightGuard, Pool, SessionManager};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use upstream::{ChatRequest, ChatStream, ErrorKind, StreamEvent, UpstreamError};

use crate::error::{Error, Result};
use crate::metrics;

/// Backpressure window between the upstream reader and the response writer.
const RELAY_BUFFER: usize = 32;

/// Items delivered to the response writer after an attempt commits.
#[derive(Debug)]
pub enum RelayItem {
    Event(StreamEvent),
    /// The stream failed after delivering output; no further items follow.
    Truncated(String),
}

/// A committed attempt: the account that serves it and the relay channel.
pub struct CommittedStream {
    pub account_id: String,
    pub receiver: mpsc::Receiver<RelayItem>,
}

/// Collected non-streaming response.
#[derive(Debug)]
pub struct ChatReply {
    pub account_id: String,
    pub model: String,
    pub reply: String,
    pub conversation_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct ProxyRouter {
    manager: SessionManager,
    retry_budget: usize,
}

impl ProxyRouter {
    pub fn new(manager: SessionManager, retry_budget: usize) -> Self {
        Self {
            manager,
            retry_budget,
        }
    }

    /// Run the failover loop until an attempt commits or the pool gives out.
    ///
    /// Each iteration tries one account not tried before. The attempt counts
    /// as committed once the first stream event arrives; from then on the
    /// relay task owns the account's in-flight slot and its outcome report.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn dispatch(&self, request: &ChatRequest) -> Result<CommittedStream> {
        let pool = self.manager.pool();
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_failure = String::from("no account attempted");

        while tried.len() < self.retry_budget {
            let id = match pool.select(&tried).await {
                Ok(id) => id,
                Err(account_pool::Error::PoolExhausted(summary)) => {
                    metrics::record_attempt("exhausted");
                    let last_failure = if tried.is_empty() {
                        summary
                    } else {
                        format!("{summary}; last attempt: {last_failure}")
                    };
                    return Err(Error::NoHealthyAccounts { last_failure });
                }
                Err(err) => return Err(err.into()),
            };
            tried.insert(id.clone());

            let token = match self.manager.ensure_session(&id).await {
                Ok(token) => token,
                Err(err) => {
                    warn!(account_id = %id, error = %err, "session unavailable, trying next account");
                    metrics::record_attempt("retried");
                    last_failure = err.to_string();
                    continue;
                }
            };

            let guard = pool.begin_request(&id);
            match open_stream(&self.manager, &token, request).await {
                Ok((first, rest)) => {
                    metrics::record_attempt("committed");
                    let receiver = spawn_relay(Arc::clone(pool), id.clone(), guard, first, rest);
                    return Ok(CommittedStream {
                        account_id: id,
                        receiver,
                    });
                }
                Err(err) => {
                    drop(guard);
                    let kind = err.kind();
                    last_failure = err.to_string();
                    if let Err(report) = pool.record_failure(&id, kind).await {
                        debug!(account_id = %id, error = %report, "failure report discarded");
                    }
                    if kind == ErrorKind::Fatal {
                        metrics::record_attempt("fatal");
                        return Err(err.into());
                    }
                    warn!(
                        account_id = %id,
                        kind = kind.label(),
                        error = %err,
                        "attempt failed, trying next account"
                    );
                    metrics::record_attempt("retried");
                }
            }
        }

        metrics::record_attempt("exhausted");
        Err(Error::NoHealthyAccounts {
            last_failure: format!(
                "retry budget of {} spent: {last_failure}",
                self.retry_budget
            ),
        })
    }

    /// Non-streaming entry point: dispatch, then collect the relay into one
    /// assembled reply. A truncated relay surfaces as an error because the
    /// caller has not seen any partial output.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
        let mut committed = self.dispatch(request).await?;

        let mut reply = String::new();
        let mut conversation_id = None;
        let mut input_tokens = 0;
        let mut output_tokens = 0;

        while let Some(item) = committed.receiver.recv().await {
            match item {
                RelayItem::Event(StreamEvent::Start { input_tokens: count }) => {
                    input_tokens = count;
                }
                RelayItem::Event(StreamEvent::Text { text }) => reply.push_str(&text),
                RelayItem::Event(StreamEvent::Done {
                    full_response,
                    output_tokens: count,
                }) => {
                    if !full_response.is_empty() {
                        reply = full_response;
                    }
                    output_tokens = count;
                }
                RelayItem::Event(StreamEvent::ConversationId { id }) => {
                    conversation_id = Some(id);
                }
                RelayItem::Event(StreamEvent::Error { message }) => {
                    return Err(Error::TruncatedStream(message));
                }
                RelayItem::Truncated(detail) => return Err(Error::TruncatedStream(detail)),
            }
        }

        Ok(ChatReply {
            account_id: committed.account_id,
            model: request.model.clone(),
            reply,
            conversation_id,
            input_tokens,
            output_tokens,
        })
    }
}

/// Open the upstream stream and wait for its first event.
///
/// Everything here is still retryable: a rejection, an immediate stream
/// error, and a stream that ends empty all mean no output reached anyone.
async fn open_stream(
    manager: &SessionManager,
    token: &common::Secret<String>,
    request: &ChatRequest,
) -> std::result::Result<(StreamEvent, ChatStream), UpstreamError> {
    let mut stream = manager.api().chat(token, request).await?;
    match stream.next().await {
        Some(Ok(event)) => Ok((event, stream)),
        Some(Err(err)) => Err(err),
        None => Err(UpstreamError::Transient(
            "stream ended before any event".into(),
        )),
    }
}

/// Forward the committed stream into a channel from a detached task.
///
/// The task owns the in-flight guard, so the slot releases when the relay
/// ends, whether the stream completed, failed, or the receiver was dropped
/// by a departing client. Dropping the upstream stream aborts the read.
fn spawn_relay(
    pool: Arc<Pool>,
    id: String,
    guard: InFlightGuard,
    first: StreamEvent,
    mut rest: ChatStream,
) -> mpsc::Receiver<RelayItem> {
    let (tx, rx) = mpsc::channel(RELAY_BUFFER);

    tokio::spawn(async move {
        let _guard = guard;
        let mut failed = false;
        let mut next = Some(first);

        loop {
            let item = match next.take() {
                Some(event) => Some(Ok(event)),
                None => rest.next().await,
            };
            match item {
                Some(Ok(event)) => {
                    if tx.send(RelayItem::Event(event)).await.is_err() {
                        debug!(account_id = %id, "client went away, dropping upstream stream");
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(account_id = %id, error = %err, "stream failed after output was delivered");
                    if let Err(report) = pool.record_failure(&id, err.kind()).await {
                        debug!(account_id = %id, error = %report, "failure report discarded");
                    }
                    let _ = tx.send(RelayItem::Truncated(err.to_string())).await;
                    failed = true;
                    break;
                }
                None => break,
            }
        }

        if !failed {
            if let Err(report) = pool.record_success(&id).await {
                debug!(account_id = %id, error = %report, "success report discarded");
            }
        }
    });

    rx
}
