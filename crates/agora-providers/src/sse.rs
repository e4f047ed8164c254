//! Server-Sent Events line parser.
//!
//! Turns any byte stream (normally a `reqwest::Response` body) into a
//! `Stream<Item = SseEvent>`. Bytes are buffered until a full line is
//! available so multi-byte characters split across chunks survive.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

use crate::ProviderError;

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, ProviderError>> + Send {
    parse_sse_bytes(response.bytes_stream())
}

pub fn parse_sse_bytes<S, E>(bytes: S) -> impl Stream<Item = Result<SseEvent, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + 'static,
{
    let byte_stream: ByteStream = Box::pin(bytes.map(|r| r.map_err(|e| e.to_string())));
    futures::stream::unfold(
        SseState {
            byte_stream,
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if state.done {
                    return None;
                }

                if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }
                    if line.starts_with(':') {
                        continue;
                    }
                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(ProviderError::Transport(e)), state));
                    }
                    None => {
                        state.done = true;
                        // A trailing line without a newline still counts.
                        if !state.buffer.is_empty() {
                            let line = String::from_utf8_lossy(&state.buffer).into_owned();
                            state.buffer.clear();
                            if let Some(value) = line.trim_end().strip_prefix("data:") {
                                state.current_data.push(value.trim_start().to_string());
                            }
                        }
                        return state.dispatch().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

struct SseState {
    byte_stream: ByteStream,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    done: bool,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let data = self.current_data.join("\n");
        self.current_data.clear();
        Some(SseEvent {
            event: self.current_event.take(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, String>> + Send {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    async fn collect(parts: Vec<&'static [u8]>) -> Vec<SseEvent> {
        parse_sse_bytes(chunks(parts))
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let events = collect(vec![
            &b"event: content_block_delta\nda"[..],
            &b"ta: {\"a\":1}\n\n: keep-alive\n\ndata: [DONE]\n\n"[..],
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(events[1].data, "[DONE]");
    }

    #[tokio::test]
    async fn test_multibyte_char_split_between_chunks() {
        // "é" is 0xC3 0xA9
        let events = collect(vec![&b"data: caf\xC3"[..], &b"\xA9\n\n"[..]]).await;
        assert_eq!(events[0].data, "café");
    }

    #[tokio::test]
    async fn test_crlf_and_trailing_data_without_blank_line() {
        let events = collect(vec![&b"data: one\r\n\r\ndata: two"[..]]).await;
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: x\n\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: y\n\n")),
        ]);
        let items: Vec<_> = parse_sse_bytes(stream).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ProviderError::Transport(_))));
    }
}
