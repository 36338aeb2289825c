//! WebSocket implementation of [`TerminalIo`]
//!
//! Translates terminal protocol frames from the browser into raw keystrokes
//! and process output into `stdout` frames. Completed input lines, and output
//! if configured, are handed to the audit publisher on spawned tasks.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use kube::api::TerminalSize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::io::TerminalIo;
use super::message::{Op, TerminalMessage};
use crate::audit::{AuditMsg, AuditPublisher, DataType};
use crate::error::{Error, Result};
use crate::session::ConnectionInfo;

/// WebSocket close reasons must fit in a control frame
const MAX_CLOSE_REASON: usize = 123;

/// Text ping sent by the browser client as a keepalive
const KEEPALIVE_PING: &str = "ping";
const KEEPALIVE_PONG: &str = "pong";

struct Output<S> {
    sink: S,
    /// Trailing bytes of an incomplete UTF-8 sequence
    carry: Vec<u8>,
}

struct Input<R> {
    stream: R,
    /// Keystrokes since the last carriage return
    line: String,
    /// Keystrokes that did not fit into the caller's buffer
    pending: Vec<u8>,
}

/// Terminal bound to one browser WebSocket
pub struct TerminalBridge<S, R> {
    session_id: String,
    info: Arc<ConnectionInfo>,
    output: Mutex<Output<S>>,
    input: Mutex<Input<R>>,
    /// Latest window size; sizes not yet applied are overwritten
    resize_tx: watch::Sender<Option<TerminalSize>>,
    resize_rx: Mutex<watch::Receiver<Option<TerminalSize>>>,
    audit: Option<Arc<AuditPublisher>>,
    closed: CancellationToken,
    close_sent: AtomicBool,
}

impl<S, R> TerminalBridge<S, R>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin + Send,
{
    /// Wrap a split WebSocket whose `bind` has already been handled
    pub fn new(
        sink: S,
        stream: R,
        session_id: impl Into<String>,
        info: Arc<ConnectionInfo>,
        audit: Option<Arc<AuditPublisher>>,
    ) -> Self {
        let (resize_tx, resize_rx) = watch::channel(None);
        Self {
            session_id: session_id.into(),
            info,
            output: Mutex::new(Output {
                sink,
                carry: Vec::new(),
            }),
            input: Mutex::new(Input {
                stream,
                line: String::new(),
                pending: Vec::new(),
            }),
            resize_tx,
            resize_rx: Mutex::new(resize_rx),
            audit,
            closed: CancellationToken::new(),
            close_sent: AtomicBool::new(false),
        }
    }

    /// Whether the connection is closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn send(&self, message: Message) -> Result<()> {
        let mut output = self.output.lock().await;
        self.send_locked(&mut output, message).await
    }

    async fn send_locked(&self, output: &mut Output<S>, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        output.sink.send(message).await.map_err(|e| {
            debug!(session_id = %self.session_id, error = %e, "Terminal send failed");
            self.closed.cancel();
            Error::ConnectionClosed
        })
    }

    fn record_stdin(&self, line: &mut String, data: &str) {
        let Some(audit) = &self.audit else {
            return;
        };

        line.push_str(data);
        if !data.ends_with('\r') {
            return;
        }

        let command = line.strip_suffix('\r').unwrap_or(line.as_str()).to_string();
        line.clear();
        if command.is_empty() {
            return;
        }
        audit.spawn_publish(AuditMsg::from_connection(
            &self.session_id,
            &self.info,
            command,
            DataType::Stdin,
        ));
    }

    fn record_stdout(&self, text: &str) {
        if let Some(audit) = self.audit.as_ref().filter(|a| a.stdout_enabled()) {
            audit.spawn_publish(AuditMsg::from_connection(
                &self.session_id,
                &self.info,
                text,
                DataType::Stdout,
            ));
        }
    }
}

#[async_trait]
impl<S, R> TerminalIo for TerminalBridge<S, R>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin + Send,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut input = self.input.lock().await;

        if !input.pending.is_empty() {
            let n = buf.len().min(input.pending.len());
            buf[..n].copy_from_slice(&input.pending[..n]);
            input.pending.drain(..n);
            return Ok(n);
        }

        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
                frame = input.stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.send(Message::Pong(payload)).await;
                    continue;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    return Err(Error::ProtocolViolation(
                        "binary frames are not part of the terminal protocol".to_string(),
                    ));
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session_id = %self.session_id, "Browser closed terminal");
                    self.closed.cancel();
                    return Err(Error::ConnectionClosed);
                }
                Some(Err(e)) => {
                    debug!(session_id = %self.session_id, error = %e, "Terminal receive failed");
                    self.closed.cancel();
                    return Err(Error::ConnectionClosed);
                }
            };

            if text.as_str() == KEEPALIVE_PING {
                let _ = self.send(Message::Text(KEEPALIVE_PONG.into())).await;
                continue;
            }

            let message = TerminalMessage::parse(text.as_str())?;
            match message.op {
                Op::Stdin => {
                    self.record_stdin(&mut input.line, &message.data);

                    let bytes = message.data.as_bytes();
                    let n = buf.len().min(bytes.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    input.pending.extend_from_slice(&bytes[n..]);
                    return Ok(n);
                }
                Op::Resize => {
                    let size = TerminalSize {
                        width: message.cols,
                        height: message.rows,
                    };
                    self.resize_tx.send_replace(Some(size));
                    return Ok(0);
                }
                Op::Bind => {
                    return Err(Error::ProtocolViolation(
                        "session is already bound".to_string(),
                    ));
                }
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected op {:?} from browser",
                        other
                    )));
                }
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut output = self.output.lock().await;
        output.carry.extend_from_slice(data);
        let text = take_utf8(&mut output.carry);
        if text.is_empty() {
            return Ok(data.len());
        }

        if is_missing_bash_notice(&text) {
            debug!(session_id = %self.session_id, "Suppressed missing-bash notice");
            return Ok(data.len());
        }

        let frame = TerminalMessage::stdout(text.as_str()).encode()?;
        self.send_locked(&mut output, Message::Text(frame.into()))
            .await?;
        drop(output);

        self.record_stdout(&text);
        Ok(data.len())
    }

    async fn next_resize(&self) -> Option<TerminalSize> {
        let mut rx = self.resize_rx.lock().await;
        loop {
            let changed = tokio::select! {
                _ = self.closed.cancelled() => return None,
                changed = rx.changed() => changed,
            };
            if changed.is_err() {
                return None;
            }
            // `TerminalSize` does not implement `Clone`; copy its fields.
            let current = rx.borrow_and_update().as_ref().map(|s| TerminalSize {
                width: s.width,
                height: s.height,
            });
            if let Some(size) = current {
                return Some(size);
            }
        }
    }

    async fn toast(&self, message: &str) -> Result<()> {
        let frame = TerminalMessage::toast(message).encode()?;
        self.send(Message::Text(frame.into())).await
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut output = self.output.lock().await;
        let frame = CloseFrame {
            code,
            reason: truncate_reason(reason).into(),
        };
        if let Err(e) = self.send_locked(&mut output, Message::Close(Some(frame))).await {
            debug!(session_id = %self.session_id, error = %e, "Close frame not delivered");
        }
        if let Err(e) = output.sink.close().await {
            warn!(session_id = %self.session_id, error = %e, "Failed to close terminal socket");
        }
        drop(output);

        self.closed.cancel();
    }
}

/// Decode as much of `carry` as forms complete UTF-8, leaving a trailing
/// partial sequence in place
///
/// Invalid sequences are replaced with U+FFFD.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry.as_slice()) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

/// The runtime's complaint when bash is absent; the `/bin/sh` fallback follows
fn is_missing_bash_notice(text: &str) -> bool {
    text.contains("OCI runtime exec failed")
        && (text.contains(r#"exec: "/bin/bash""#) || text.contains(r#"exec: \"/bin/bash\""#))
}

pub(super) fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_utf8_carries_partial_sequence() {
        // "é" is 0xC3 0xA9
        let mut carry = vec![b'a', 0xC3];
        assert_eq!(take_utf8(&mut carry), "a");
        assert_eq!(carry, vec![0xC3]);

        carry.push(0xA9);
        assert_eq!(take_utf8(&mut carry), "é");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_take_utf8_replaces_invalid_bytes() {
        let mut carry = vec![b'a', 0xFF, b'b'];
        assert_eq!(take_utf8(&mut carry), "a\u{FFFD}b");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_missing_bash_notice_detection() {
        assert!(is_missing_bash_notice(
            r#"OCI runtime exec failed: exec failed: container_linux.go:380: starting container process caused: exec: "/bin/bash": stat /bin/bash: no such file or directory"#
        ));
        assert!(is_missing_bash_notice(
            r#"{"message":"OCI runtime exec failed: exec: \"/bin/bash\": not found"}"#
        ));
        assert!(!is_missing_bash_notice("OCI runtime exec failed: exec: \"/init.sh\""));
        assert!(!is_missing_bash_notice("user@host:~$ /bin/bash"));
    }

    #[test]
    fn test_truncate_reason_respects_char_boundaries() {
        let short = "process exited";
        assert_eq!(truncate_reason(short), short);

        let long = "é".repeat(100);
        let truncated = truncate_reason(&long);
        assert!(truncated.len() <= MAX_CLOSE_REASON);
        assert_eq!(truncated.len(), 122);
    }
}
