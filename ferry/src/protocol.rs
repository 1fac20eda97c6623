//! Reader for the newline-delimited JSON protocol spoken by connectors.
//!
//! Every line is one message of the shape `{"type": "...", ...payload}`.
//! The reader turns raw bytes into [`ProtocolEvent`]s one line at a time and
//! never aborts on bad input: malformed lines become
//! [`ProtocolEvent::ParseError`], blank lines and unknown message types are
//! skipped, and lines longer than the configured limit are discarded without
//! being buffered.
//!
//! Events are handed to an [`EventSink`] one by one and the reader does not
//! read the next line until the sink has accepted the current event, so a
//! slow consumer slows the connector down instead of growing memory.

use std::fmt;
use std::io;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::job::Checkpoint;

/// Lines above this size are reported as parse errors and dropped.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const EXCERPT_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "FATAL" => LogLevel::Fatal,
            "ERROR" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(s)
    }
}

/// Payload of a TRACE message.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceEvent {
    /// The connector reports a failure. Fails the attempt.
    Error {
        message: String,
        failure_type: Option<String>,
        stack_trace: Option<String>,
    },
    Estimate(Value),
    StreamStatus(Value),
    Other { trace_type: String, payload: Value },
}

/// One typed message read from a connector's output.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    /// A data record. Opaque to the engine.
    Record(Value),
    /// A checkpoint the engine must persist before reading further.
    State(Checkpoint),
    Log { level: LogLevel, message: String },
    Trace(TraceEvent),
    ConnectionStatus {
        status: String,
        message: Option<String>,
    },
    ParseError {
        line_number: u64,
        error: String,
        excerpt: String,
    },
}

impl ProtocolEvent {
    pub fn is_error_trace(&self) -> bool {
        matches!(self, ProtocolEvent::Trace(TraceEvent::Error { .. }))
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum WireMessage {
    Record {
        record: Value,
    },
    State {
        state: Value,
    },
    Log {
        log: WireLog,
    },
    Trace {
        trace: WireTrace,
    },
    ConnectionStatus {
        #[serde(rename = "connectionStatus")]
        connection_status: WireConnectionStatus,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireLog {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct WireTrace {
    #[serde(rename = "type")]
    trace_type: String,
    #[serde(default)]
    error: Option<WireTraceError>,
    #[serde(default)]
    estimate: Option<Value>,
    #[serde(default)]
    stream_status: Option<Value>,
}

#[derive(Deserialize)]
struct WireTraceError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    failure_type: Option<String>,
    #[serde(default)]
    stack_trace: Option<String>,
}

#[derive(Deserialize)]
struct WireConnectionStatus {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl WireTrace {
    fn into_event(self) -> TraceEvent {
        match self.trace_type.as_str() {
            "ERROR" => {
                let error = self.error.unwrap_or(WireTraceError {
                    message: String::new(),
                    failure_type: None,
                    stack_trace: None,
                });
                TraceEvent::Error {
                    message: error.message,
                    failure_type: error.failure_type,
                    stack_trace: error.stack_trace,
                }
            }
            "ESTIMATE" => TraceEvent::Estimate(self.estimate.unwrap_or(Value::Null)),
            "STREAM_STATUS" => TraceEvent::StreamStatus(self.stream_status.unwrap_or(Value::Null)),
            _ => TraceEvent::Other {
                trace_type: self.trace_type,
                payload: self.estimate.or(self.stream_status).unwrap_or(Value::Null),
            },
        }
    }
}

/// Parse a single protocol line.
///
/// Returns `None` for blank lines and unknown message types.
pub fn parse_line(line: &str, line_number: u64) -> Option<ProtocolEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<WireMessage>(trimmed) {
        Ok(WireMessage::Record { record }) => Some(ProtocolEvent::Record(record)),
        Ok(WireMessage::State { state }) => Some(ProtocolEvent::State(Checkpoint::new(state))),
        Ok(WireMessage::Log { log }) => Some(ProtocolEvent::Log {
            level: log.level.as_deref().map_or(LogLevel::Info, LogLevel::parse),
            message: log.message,
        }),
        Ok(WireMessage::Trace { trace }) => Some(ProtocolEvent::Trace(trace.into_event())),
        Ok(WireMessage::ConnectionStatus { connection_status }) => {
            Some(ProtocolEvent::ConnectionStatus {
                status: connection_status.status,
                message: connection_status.message,
            })
        }
        Ok(WireMessage::Unknown) => None,
        Err(err) => Some(ProtocolEvent::ParseError {
            line_number,
            error: err.to_string(),
            excerpt: excerpt(trimmed),
        }),
    }
}

fn excerpt(line: &str) -> String {
    line.chars().take(EXCERPT_CHARS).collect()
}

/// Consumer of protocol events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Accept one event. Returning `Err` stops the reader.
    async fn accept(&self, event: ProtocolEvent) -> Result<(), SinkClosed>;
}

/// The consumer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

#[async_trait]
impl EventSink for mpsc::Sender<ProtocolEvent> {
    async fn accept(&self, event: ProtocolEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }
}

enum RawLine {
    Line(Vec<u8>),
    Oversized { bytes: usize, head: Vec<u8> },
}

/// Line-at-a-time protocol reader over any buffered async byte source.
pub struct ProtocolReader<R> {
    inner: R,
    max_line_bytes: usize,
    line_number: u64,
    finished: bool,
}

impl<R> fmt::Debug for ProtocolReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolReader")
            .field("max_line_bytes", &self.max_line_bytes)
            .field("line_number", &self.line_number)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncBufRead + Unpin + Send> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            line_number: 0,
            finished: false,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Read the next event. `Ok(None)` means end of stream.
    ///
    /// After an I/O error the reader is finished and returns `Ok(None)`.
    pub async fn next_event(&mut self) -> io::Result<Option<ProtocolEvent>> {
        while !self.finished {
            let raw = match self.read_raw_line().await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.finished = true;
                    return Ok(None);
                }
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            self.line_number += 1;

            match raw {
                RawLine::Line(bytes) => {
                    let line = String::from_utf8_lossy(&bytes);
                    if let Some(event) = parse_line(&line, self.line_number) {
                        return Ok(Some(event));
                    }
                }
                RawLine::Oversized { bytes, head } => {
                    return Ok(Some(ProtocolEvent::ParseError {
                        line_number: self.line_number,
                        error: format!(
                            "line of {bytes} bytes exceeds limit of {} bytes",
                            self.max_line_bytes
                        ),
                        excerpt: excerpt(&String::from_utf8_lossy(&head)),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Forward every event to `sink`, waiting for each to be accepted.
    ///
    /// Returns the number of events delivered. Stops early, without error,
    /// if the sink closes.
    pub async fn forward<S: EventSink + ?Sized>(mut self, sink: &S) -> io::Result<u64> {
        let mut delivered = 0;
        while let Some(event) = self.next_event().await? {
            if sink.accept(event).await.is_err() {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Adapt the reader into a lazy stream of events.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<ProtocolEvent>> + Send
    where
        R: 'static,
    {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_event().await {
                Ok(Some(event)) => Some((Ok(event), reader)),
                Ok(None) => None,
                Err(err) => Some((Err(err), reader)),
            }
        })
    }

    async fn read_raw_line(&mut self) -> io::Result<Option<RawLine>> {
        let mut line = Vec::new();
        let mut oversized_bytes: Option<usize> = None;
        let mut saw_any = false;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            saw_any = true;

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk_len = newline.unwrap_or(available.len());
            let chunk = &available[..chunk_len];

            if let Some(total) = oversized_bytes {
                oversized_bytes = Some(total + chunk.len());
            } else if line.len() + chunk.len() > self.max_line_bytes {
                let total = line.len() + chunk.len();
                let keep = EXCERPT_CHARS.saturating_sub(line.len()).min(chunk.len());
                line.extend_from_slice(&chunk[..keep]);
                line.truncate(EXCERPT_CHARS);
                oversized_bytes = Some(total);
            } else {
                line.extend_from_slice(chunk);
            }

            let consumed = chunk_len + usize::from(newline.is_some());
            self.inner.consume(consumed);
            if newline.is_some() {
                break;
            }
        }

        if !saw_any {
            return Ok(None);
        }
        Ok(Some(match oversized_bytes {
            Some(bytes) => RawLine::Oversized { bytes, head: line },
            None => RawLine::Line(line),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::BufReader;

    fn reader(input: &str) -> ProtocolReader<BufReader<&[u8]>> {
        ProtocolReader::new(BufReader::new(input.as_bytes()))
    }

    async fn collect(input: &str) -> Vec<ProtocolEvent> {
        let mut reader = reader(input);
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn parses_every_message_type() {
        let input = concat!(
            r#"{"type":"RECORD","record":{"stream":"users","data":{"id":1}}}"#, "\n",
            r#"{"type":"STATE","state":{"cursor":100}}"#, "\n",
            r#"{"type":"LOG","log":{"level":"WARN","message":"slow api"}}"#, "\n",
            r#"{"type":"TRACE","trace":{"type":"ERROR","error":{"message":"boom","failure_type":"config_error"}}}"#, "\n",
            r#"{"type":"CONNECTION_STATUS","connectionStatus":{"status":"SUCCEEDED"}}"#, "\n",
        );
        let events = collect(input).await;

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            ProtocolEvent::Record(json!({"stream":"users","data":{"id":1}}))
        );
        assert_eq!(
            events[1],
            ProtocolEvent::State(Checkpoint::new(json!({"cursor":100})))
        );
        assert_eq!(
            events[2],
            ProtocolEvent::Log {
                level: LogLevel::Warn,
                message: "slow api".into()
            }
        );
        assert!(events[3].is_error_trace());
        assert_eq!(
            events[4],
            ProtocolEvent::ConnectionStatus {
                status: "SUCCEEDED".into(),
                message: None
            }
        );
    }

    #[tokio::test]
    async fn malformed_lines_do_not_abort_the_stream() {
        let input = "not json\n{\"type\":\"STATE\",\"state\":{\"cursor\":1}}\n{\"type\":\"STATE\"}\n";
        let events = collect(input).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            ProtocolEvent::ParseError { line_number: 1, excerpt, .. } if excerpt == "not json"
        ));
        assert!(matches!(events[1], ProtocolEvent::State(_)));
        assert!(matches!(
            events[2],
            ProtocolEvent::ParseError { line_number: 3, .. }
        ));
    }

    #[tokio::test]
    async fn blank_lines_and_unknown_types_are_skipped() {
        let input = "\n   \n{\"type\":\"SPEC\",\"spec\":{}}\n{\"type\":\"RECORD\",\"record\":{}}";
        let events = collect(input).await;
        assert_eq!(events, vec![ProtocolEvent::Record(json!({}))]);
    }

    #[tokio::test]
    async fn oversized_lines_are_discarded() {
        let big = format!("{{\"type\":\"RECORD\",\"record\":\"{}\"}}", "x".repeat(4096));
        let input = format!("{big}\n{{\"type\":\"STATE\",\"state\":1}}\n");
        let mut reader = ProtocolReader::new(BufReader::with_capacity(64, input.as_bytes()))
            .with_max_line_bytes(1024);

        let first = reader.next_event().await.unwrap().unwrap();
        match first {
            ProtocolEvent::ParseError {
                line_number,
                error,
                excerpt,
            } => {
                assert_eq!(line_number, 1);
                assert!(error.contains("exceeds limit"), "got: {error}");
                assert!(excerpt.starts_with("{\"type\":\"RECORD\""));
                assert!(excerpt.len() <= EXCERPT_CHARS);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        let second = reader.next_event().await.unwrap().unwrap();
        assert_eq!(second, ProtocolEvent::State(Checkpoint::new(json!(1))));
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_is_tolerated() {
        let mut bytes = b"{\"type\":\"LOG\",\"log\":{\"message\":\"caf".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b"\"}}\n");
        let mut reader = ProtocolReader::new(BufReader::new(bytes.as_slice()));

        match reader.next_event().await.unwrap() {
            Some(ProtocolEvent::Log { message, level }) => {
                assert!(message.starts_with("caf"));
                assert_eq!(level, LogLevel::Info);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_waits_for_the_consumer() {
        let input: String = (1..=20)
            .map(|i| format!("{{\"type\":\"STATE\",\"state\":{{\"cursor\":{i}}}}}\n"))
            .collect();
        let (tx, mut rx) = mpsc::channel(1);

        let forward = tokio::spawn(async move {
            let reader = ProtocolReader::new(BufReader::new(input.as_bytes()));
            reader.forward(&tx).await
        });

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if let ProtocolEvent::State(checkpoint) = event {
                seen.push(checkpoint.as_value()["cursor"].as_u64().unwrap());
            }
        }

        assert_eq!(forward.await.unwrap().unwrap(), 20);
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn forward_stops_when_sink_closes() {
        let input = "{\"type\":\"RECORD\",\"record\":1}\n".repeat(10);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let reader = ProtocolReader::new(BufReader::new(input.as_bytes()));
        assert_eq!(reader.forward(&tx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_adapter_yields_events_lazily() {
        let input = "{\"type\":\"RECORD\",\"record\":1}\n{\"type\":\"RECORD\",\"record\":2}\n".to_string();
        let reader = ProtocolReader::new(BufReader::new(std::io::Cursor::new(input.into_bytes())));
        let events: Vec<_> = reader
            .into_stream()
            .map(|event| event.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![ProtocolEvent::Record(json!(1)), ProtocolEvent::Record(json!(2))]
        );
    }
}
