//! Server-Sent Events reader and writer.
//!
//! The reader turns a chunked byte stream into [`SseEvent`] records. Chunks may
//! split a record, a line, or even a line terminator anywhere. The writer
//! renders records with `id:`/`data:` fields and `retry:` hints.

use crate::jsonrpc::{DecodeError, Message};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

/// Why an event stream stopped without a clean end-of-stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    /// The underlying connection failed.
    #[error("connection dropped: {0}")]
    Dropped(String),
    /// The body ended in the middle of a record.
    #[error("stream ended mid-record")]
    Truncated,
    /// A record's data is not a JSON-RPC message.
    #[error("undecodable event: {0}")]
    Undecodable(String),
}

/// One dispatched SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// A record carrying one JSON-RPC message.
    pub fn message(id: impl Into<String>, message: &Message) -> Self {
        Self {
            id: Some(id.into()),
            event: None,
            data: String::from_utf8_lossy(&message.encode()).into_owned(),
            retry: None,
        }
    }

    /// A record with an id and no data, which makes a stream resumable
    /// before it has carried any message.
    pub fn priming(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// A bare reconnection-delay hint.
    pub fn retry(delay: Duration) -> Self {
        Self {
            retry: Some(delay.as_millis() as u64),
            ..Default::default()
        }
    }

    /// Whether the record carries a payload.
    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Decode the payload as a JSON-RPC message. `None` for empty records.
    pub fn decode(&self) -> Option<Result<Message, DecodeError>> {
        self.has_data().then(|| Message::decode(self.data.as_bytes()))
    }

    /// Server-provided reconnection delay.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry.map(Duration::from_millis)
    }

    /// Render the record in wire format, terminated by a blank line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str(&format!("event: {event}\n"));
        }
        if let Some(id) = &self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        if self.has_data() {
            for line in self.data.split('\n') {
                out.push_str(&format!("data: {line}\n"));
            }
        } else if self.id.is_some() {
            out.push_str("data:\n");
        }
        out.push('\n');
        out
    }
}

/// Assigns strictly increasing decimal ids to outgoing records.
#[derive(Debug)]
pub struct EventWriter {
    next_id: u64,
}

impl EventWriter {
    pub fn new(start: u64) -> Self {
        Self { next_id: start }
    }

    /// The id the next record will get.
    pub fn peek(&self) -> u64 {
        self.next_id
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Frame one message under the next id.
    pub fn message(&mut self, message: &Message) -> (u64, SseEvent) {
        let id = self.take_id();
        (id, SseEvent::message(id.to_string(), message))
    }

    /// Frame a priming record under the next id.
    pub fn priming(&mut self) -> (u64, SseEvent) {
        let id = self.take_id();
        (id, SseEvent::priming(id.to_string()))
    }
}

impl Default for EventWriter {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    skip_lf: bool,
    data: Vec<String>,
    id: Option<String>,
    event: Option<String>,
    retry: Option<u64>,
    has_fields: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.end_line(&mut events);
                    self.skip_lf = true;
                }
                _ => self.line.push(byte),
            }
        }
        events
    }

    /// Whether a partial line or an undispatched record is buffered.
    pub fn is_mid_record(&self) -> bool {
        !self.line.is_empty() || self.has_fields
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let raw = std::mem::take(&mut self.line);
        if raw.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }

        let line = String::from_utf8_lossy(&raw);
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "data" => {
                self.data.push(value.to_string());
                self.has_fields = true;
            }
            "id" if !value.contains('\0') => {
                self.id = Some(value.to_string());
                self.has_fields = true;
            }
            "event" => {
                self.event = Some(value.to_string());
                self.has_fields = true;
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                    self.has_fields = true;
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !std::mem::take(&mut self.has_fields) {
            return None;
        }
        Some(SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            retry: self.retry.take(),
        })
    }
}

/// Lazily reads [`SseEvent`]s from a chunked byte stream.
pub struct EventStream<S> {
    inner: S,
    parser: SseParser,
    ready: VecDeque<SseEvent>,
    last_event_id: Option<String>,
    finished: bool,
}

impl<S, B, E> EventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            ready: VecDeque::new(),
            last_event_id: None,
            finished: false,
        }
    }

    /// The id of the last record that carried one.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Next record. `Ok(None)` is a clean end-of-stream; an error means the
    /// connection dropped or the body stopped halfway through a record.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, SseError> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                if let Some(id) = &event.id {
                    self.last_event_id = Some(id.clone());
                }
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.parser.feed(chunk.as_ref())),
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(SseError::Dropped(e.to_string()));
                }
                None => {
                    self.finished = true;
                    if self.parser.is_mid_record() {
                        return Err(SseError::Truncated);
                    }
                }
            }
        }
    }
}
