//! Server-sent event decoding for the chat stream
//!
//! The upstream frames events as `data: {json}` lines and closes with
//! `data: [DONE]`. Network chunks split lines at arbitrary byte offsets, so
//! the decoder buffers until a newline before parsing. Unparseable payloads
//! and unknown event types are skipped rather than failing the stream.

use bytes::BytesMut;
use tracing::debug;

use crate::api::StreamEvent;

/// One decoded frame from the SSE byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// A chat event
    Event(StreamEvent),
    /// The `[DONE]` terminator
    Done,
}

/// Incremental line decoder over raw response chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            if let Some(frame) = parse_line(text.trim()) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Parse a single trimmed SSE line. Returns None for blank lines, comments,
/// non-data fields, and payloads that don't decode to a known event.
pub fn parse_line(line: &str) -> Option<SseLine> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseLine::Done);
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => Some(SseLine::Event(event)),
        Err(err) => {
            debug!(error = %err, "skipping undecodable stream event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_line() {
        let frame = parse_line(r#"data: {"type":"text","text":"hi"}"#).unwrap();
        assert_eq!(frame, SseLine::Event(StreamEvent::Text { text: "hi".into() }));
    }

    #[test]
    fn parses_start_event() {
        let frame = parse_line(r#"data: {"type":"start","input_tokens":42}"#).unwrap();
        assert_eq!(
            frame,
            SseLine::Event(StreamEvent::Start { input_tokens: 42 })
        );
    }

    #[test]
    fn parses_done_terminator() {
        assert_eq!(parse_line("data: [DONE]"), Some(SseLine::Done));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line(": keepalive"), None);
        assert_eq!(parse_line("event: message"), None);
    }

    #[test]
    fn skips_unknown_event_type() {
        assert_eq!(parse_line(r#"data: {"type":"heartbeat"}"#), None);
    }

    #[test]
    fn skips_malformed_json() {
        assert_eq!(parse_line("data: {not json"), None);
    }

    #[test]
    fn decoder_handles_line_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"text\",").is_empty());
        let frames = decoder.push(b"\"text\":\"ok\"}\n");
        assert_eq!(
            frames,
            vec![SseLine::Event(StreamEvent::Text { text: "ok".into() })]
        );
    }

    #[test]
    fn decoder_handles_multiple_lines_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(
            b"data: {\"type\":\"text\",\"text\":\"a\"}\n\ndata: {\"type\":\"text\",\"text\":\"b\"}\n",
        );
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn decoder_keeps_start_ahead_of_text() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(
            b"data: {\"type\":\"start\",\"input_tokens\":42}\ndata: {\"type\":\"text\",\"text\":\"hi\"}\n",
        );
        assert_eq!(
            frames,
            vec![
                SseLine::Event(StreamEvent::Start { input_tokens: 42 }),
                SseLine::Event(StreamEvent::Text { text: "hi".into() }),
            ]
        );
    }

    #[test]
    fn decoder_handles_crlf_framing() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: [DONE]\r\n");
        assert_eq!(frames, vec![SseLine::Done]);
    }

    #[test]
    fn decoder_holds_trailing_partial_line() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"type\":\"text\",\"text\":\"a\"}\ndata: {\"ty");
        assert_eq!(frames.len(), 1);
        let rest = decoder.push(b"pe\":\"text\",\"text\":\"b\"}\n");
        assert_eq!(
            rest,
            vec![SseLine::Event(StreamEvent::Text { text: "b".into() })]
        );
    }

    #[test]
    fn decoder_survives_split_utf8_sequence() {
        // "é" is 0xC3 0xA9; byte 30 splits the pair across chunks
        let mut decoder = SseDecoder::new();
        let full = "data: {\"type\":\"text\",\"text\":\"é\"}\n".as_bytes();
        let (a, b) = full.split_at(30);
        assert!(decoder.push(a).is_empty());
        let frames = decoder.push(b);
        assert_eq!(
            frames,
            vec![SseLine::Event(StreamEvent::Text { text: "é".into() })]
        );
    }
}
