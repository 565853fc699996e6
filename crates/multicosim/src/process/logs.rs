//! Process output capture.
//!
//! Every line a managed process writes is re-emitted as a tracing event under
//! the `multicosim::process` target and kept in a bounded tail so launch
//! failures can carry the last few lines without anyone digging through host
//! logs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Role;

/// Default number of output lines retained per process.
pub const DEFAULT_TAIL_LINES: usize = 64;

/// Bounded, shared ring of recent output lines.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Copy out the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

/// Render a tail for inclusion in an error message.
pub(crate) fn fmt_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n--- last output ---");
    for line in lines {
        out.push('\n');
        out.push_str(line);
    }
    out
}

/// Shared readiness flag flipped when a log-line probe matches.
pub(crate) type ReadySender = Arc<watch::Sender<bool>>;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Where pumped lines go.
#[derive(Clone)]
pub(crate) struct LineSink {
    pub role: Role,
    pub process_id: String,
    pub tail: LogTail,
    /// Substring that marks the process ready, with the flag to set.
    pub ready: Option<(String, ReadySender)>,
}

impl LineSink {
    fn accept(&self, stream: Stream, line: String) {
        tracing::info!(
            target: "multicosim::process",
            role = %self.role,
            process_id = %self.process_id,
            stream = stream.as_str(),
            "{}",
            line
        );
        let matched = match &self.ready {
            Some((pattern, flag)) => !*flag.borrow() && line.contains(pattern.as_str()),
            None => false,
        };
        // Tail first, so a waiter woken by the flag sees the marker line.
        self.tail.push(line);
        if matched && let Some((_, flag)) = &self.ready {
            tracing::debug!(role = %self.role, process_id = %self.process_id, "Readiness line observed");
            flag.send_replace(true);
        }
    }
}

/// Read `reader` line by line into `sink` until EOF.
///
/// Bytes that are not UTF-8 are replaced rather than ending the read; the
/// pipe must stay drained or the child blocks or dies of SIGPIPE.
pub(crate) fn pump<R>(reader: R, stream: Stream, sink: LineSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => sink.accept(stream, decode_line(&buf)),
                Err(e) => {
                    tracing::debug!(
                        role = %sink.role,
                        process_id = %sink.process_id,
                        error = %e,
                        "Output stream read failed"
                    );
                    break;
                }
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let tail = LogTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {i}"));
        }
        assert_eq!(tail.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let tail = LogTail::new(0);
        tail.push("ignored");
        assert!(tail.snapshot().is_empty());
    }

    #[test]
    fn fmt_tail_empty_is_blank() {
        assert_eq!(fmt_tail(&[]), "");
        assert_eq!(
            fmt_tail(&["a".to_string(), "b".to_string()]),
            "\n--- last output ---\na\nb"
        );
    }

    #[tokio::test]
    async fn pump_sets_ready_on_match() {
        let (tx, mut rx) = watch::channel(false);
        let sink = LineSink {
            role: Role::Controller,
            process_id: "test".to_string(),
            tail: LogTail::new(8),
            ready: Some(("listening on".to_string(), Arc::new(tx))),
        };
        let tail = sink.tail.clone();

        let input: &[u8] = b"booting\nmulticosim: controller listening on 127.0.0.1:5556\nmore\n";
        pump(input, Stream::Stdout, sink).await.unwrap();

        assert!(*rx.borrow_and_update());
        assert_eq!(tail.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn pump_without_match_leaves_flag() {
        let (tx, rx) = watch::channel(false);
        let sink = LineSink {
            role: Role::Simulator,
            process_id: "test".to_string(),
            tail: LogTail::new(8),
            ready: Some(("never".to_string(), Arc::new(tx))),
        };

        let input: &[u8] = b"one\ntwo\n";
        pump(input, Stream::Stderr, sink).await.unwrap();

        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn pump_survives_invalid_utf8() {
        let (tx, rx) = watch::channel(false);
        let sink = LineSink {
            role: Role::Simulator,
            process_id: "test".to_string(),
            tail: LogTail::new(8),
            ready: Some(("world ready".to_string(), Arc::new(tx))),
        };
        let tail = sink.tail.clone();

        let input: &[u8] = b"bad \xff byte\r\nworld ready\nno newline";
        pump(input, Stream::Stdout, sink).await.unwrap();

        assert!(*rx.borrow());
        assert_eq!(
            tail.snapshot(),
            vec!["bad \u{fffd} byte", "world ready", "no newline"]
        );
    }
}
