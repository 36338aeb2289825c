//! Terminal connection scenarios over in-memory sockets

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use tokio::sync::mpsc;

use super::*;
use crate::audit::{AuditError, AuditTransport};
use crate::cluster_cache::{CloudShellTarget, ClusterConfigCache, DEFAULT_CLUSTER_CONFIG_TTL};
use crate::kube_client::MockClusterClient;
use crate::metadata::{ClusterRecord, MockClusterMetadataSource};
use crate::session::{ConnectionInfo, SessionRegistry, DEFAULT_SESSION_TTL};

type ServerSink = UnboundedSender<Message>;
type ServerStream = UnboundedReceiver<Result<Message, axum::Error>>;

/// Both ends of an in-memory WebSocket
struct Socket {
    /// Frames the server sent
    from_server: UnboundedReceiver<Message>,
    /// Frames the browser sends
    to_server: UnboundedSender<Result<Message, axum::Error>>,
}

impl Socket {
    fn send_json(&self, json: &str) {
        self.to_server
            .unbounded_send(Ok(Message::Text(json.to_string().into())))
            .unwrap();
    }

    fn send(&self, message: &TerminalMessage) {
        self.send_json(&message.encode().unwrap());
    }

    async fn next_frame(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(1), self.from_server.next())
            .await
            .expect("timed out waiting for server frame")
            .expect("server side closed")
    }
}

fn socket() -> (ServerSink, ServerStream, Socket) {
    let (server_tx, from_server) = unbounded();
    let (to_server, server_rx) = unbounded();
    (
        server_tx,
        server_rx,
        Socket {
            from_server,
            to_server,
        },
    )
}

/// Records every delivered audit payload
struct RecordingTransport {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl AuditTransport for RecordingTransport {
    async fn send(&self, payload: &str) -> Result<(), AuditError> {
        let _ = self.tx.send(payload.to_string());
        Ok(())
    }
}

fn recording_audit(stdout: bool) -> (Arc<AuditPublisher>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = AuditPublisher::new(Arc::new(RecordingTransport { tx }), stdout);
    (Arc::new(publisher), rx)
}

fn info() -> Arc<ConnectionInfo> {
    Arc::new(ConnectionInfo::workload("c1", "ns", "p1", "c", "alice"))
}

fn bridge(
    audit: Option<Arc<AuditPublisher>>,
) -> (TerminalBridge<ServerSink, ServerStream>, Socket) {
    let (sink, stream, socket) = socket();
    (TerminalBridge::new(sink, stream, "sess-1", info(), audit), socket)
}

fn close_code_of(frame: &Message) -> Option<u16> {
    match frame {
        Message::Close(Some(frame)) => Some(frame.code),
        _ => None,
    }
}

#[tokio::test]
async fn test_resize_reaches_resize_channel_without_audit() {
    let (bridge, socket) = bridge(None);

    socket.send(&TerminalMessage::resize(40, 120));
    let mut buf = [0u8; 64];
    assert_eq!(bridge.read(&mut buf).await.unwrap(), 0);

    let size = bridge.next_resize().await.unwrap();
    assert_eq!((size.height, size.width), (40, 120));
}

#[tokio::test]
async fn test_unapplied_resizes_keep_latest_size() {
    let (bridge, socket) = bridge(None);

    let mut buf = [0u8; 64];
    for rows in 1..=20u16 {
        socket.send(&TerminalMessage::resize(rows, 80));
        assert_eq!(bridge.read(&mut buf).await.unwrap(), 0);
    }

    let size = bridge.next_resize().await.unwrap();
    assert_eq!((size.height, size.width), (20, 80));

    // Nothing newer is pending
    let next = tokio::time::timeout(Duration::from_millis(50), bridge.next_resize()).await;
    assert!(next.is_err());
}

#[tokio::test]
async fn test_keystrokes_pass_through_and_audit_one_line() {
    let (audit, mut events) = recording_audit(false);
    let (bridge, socket) = bridge(Some(audit));

    for key in ["l", "s", "\r"] {
        socket.send(&TerminalMessage::stdin(key));
    }

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    for _ in 0..3 {
        let n = bridge.read(&mut buf).await.unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"ls\r");

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    let event: serde_json::Value = serde_json::from_str(&event).unwrap();
    assert_eq!(event["data"], "ls");
    assert_eq!(event["data_type"], "stdin");
    assert_eq!(event["session_id"], "sess-1");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_empty_line_is_not_audited() {
    let (audit, mut events) = recording_audit(false);
    let (bridge, socket) = bridge(Some(audit));

    socket.send(&TerminalMessage::stdin("\r"));
    let mut buf = [0u8; 8];
    assert_eq!(bridge.read(&mut buf).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_only_final_carriage_return_is_stripped() {
    let (audit, mut events) = recording_audit(false);
    let (bridge, socket) = bridge(Some(audit));

    socket.send(&TerminalMessage::stdin("echo\r\r"));
    let mut buf = [0u8; 16];
    assert_eq!(bridge.read(&mut buf).await.unwrap(), 6);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    let event: serde_json::Value = serde_json::from_str(&event).unwrap();
    assert_eq!(event["data"], "echo\r");
}

#[tokio::test]
async fn test_oversized_stdin_spans_reads() {
    let (bridge, socket) = bridge(None);
    socket.send(&TerminalMessage::stdin("hello"));

    let mut buf = [0u8; 2];
    let mut chunks = Vec::new();
    for _ in 0..3 {
        let n = bridge.read(&mut buf).await.unwrap();
        chunks.push(String::from_utf8(buf[..n].to_vec()).unwrap());
    }
    assert_eq!(chunks, vec!["he", "ll", "o"]);
}

#[tokio::test]
async fn test_keepalive_ping_gets_pong_and_is_not_input() {
    let (bridge, mut socket) = bridge(None);
    socket
        .to_server
        .unbounded_send(Ok(Message::Text("ping".into())))
        .unwrap();
    socket
        .to_server
        .unbounded_send(Ok(Message::Ping(vec![1, 2].into())))
        .unwrap();
    socket.send(&TerminalMessage::stdin("x"));

    let mut buf = [0u8; 8];
    assert_eq!(bridge.read(&mut buf).await.unwrap(), 1);
    assert_eq!(buf[0], b'x');

    match socket.next_frame().await {
        Message::Text(text) => assert_eq!(text.as_str(), "pong"),
        other => panic!("expected pong text, got {:?}", other),
    }
    assert!(matches!(socket.next_frame().await, Message::Pong(_)));
}

#[tokio::test]
async fn test_malformed_frame_fails_only_that_read() {
    let (bridge, socket) = bridge(None);
    socket.send_json("{broken");
    socket.send_json(r#"{"op":"launch"}"#);
    socket.send(&TerminalMessage::stdin("a"));

    let mut buf = [0u8; 8];
    assert!(matches!(
        bridge.read(&mut buf).await,
        Err(Error::ProtocolViolation(_))
    ));
    assert!(matches!(
        bridge.read(&mut buf).await,
        Err(Error::ProtocolViolation(_))
    ));
    assert_eq!(bridge.read(&mut buf).await.unwrap(), 1);
}

#[tokio::test]
async fn test_output_is_framed_as_stdout() {
    let (audit, mut events) = recording_audit(true);
    let (bridge, mut socket) = bridge(Some(audit));

    assert_eq!(bridge.write(b"total 0\r\n").await.unwrap(), 9);

    match socket.next_frame().await {
        Message::Text(text) => {
            let message = TerminalMessage::parse(text.as_str()).unwrap();
            assert_eq!(message, TerminalMessage::stdout("total 0\r\n"));
        }
        other => panic!("expected stdout frame, got {:?}", other),
    }

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(event.contains(r#""data_type":"stdout""#));
}

#[tokio::test]
async fn test_missing_bash_notice_is_suppressed() {
    let (bridge, mut socket) = bridge(None);
    let notice = br#"OCI runtime exec failed: exec failed: exec: "/bin/bash": stat /bin/bash: no such file or directory: unknown"#;

    assert_eq!(bridge.write(notice).await.unwrap(), notice.len());
    assert!(socket.from_server.try_next().is_err());
}

#[tokio::test]
async fn test_close_is_idempotent_and_unblocks_readers() {
    let (bridge, mut socket) = bridge(None);

    bridge.close(close_code::NORMAL, "process exited").await;
    bridge.close(close_code::EXEC_FAILED, "again").await;

    let frames: Vec<Message> = socket.from_server.by_ref().collect().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(close_code_of(&frames[0]), Some(close_code::NORMAL));

    let mut buf = [0u8; 8];
    assert!(matches!(
        bridge.read(&mut buf).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(bridge.next_resize().await.is_none());
    assert!(bridge.is_closed());
}

#[tokio::test]
async fn test_browser_disconnect_ends_reads() {
    let (bridge, socket) = bridge(None);
    drop(socket);

    let mut buf = [0u8; 8];
    assert!(matches!(
        bridge.read(&mut buf).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(bridge.write(b"late output").await.is_err());
}

const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: c1
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: c1
  context:
    cluster: c1
    user: u
current-context: c1
users:
- name: u
  user:
    token: t
"#;

fn context(client: MockClusterClient) -> TerminalContext {
    let mut source = MockClusterMetadataSource::new();
    source.expect_get().returning(|name| {
        Ok(Some(ClusterRecord {
            name: name.to_string(),
            kubeconfig: Some(KUBECONFIG.to_string()),
            is_member: true,
        }))
    });

    let client: Arc<dyn crate::kube_client::ClusterClient> = Arc::new(client);
    TerminalContext {
        registry: Arc::new(SessionRegistry::local_only(DEFAULT_SESSION_TTL)),
        clusters: Arc::new(ClusterConfigCache::new(
            Arc::new(source),
            client.clone(),
            DEFAULT_CLUSTER_CONFIG_TTL,
            CloudShellTarget::default(),
        )),
        launcher: Arc::new(ExecLauncher::new(client, crate::exec::DEFAULT_SCRIPT)),
        audit: None,
    }
}

#[tokio::test]
async fn test_unknown_session_closes_without_exec() {
    // No exec expectation: any launch attempt panics the mock
    let ctx = context(MockClusterClient::new());
    let (sink, stream, mut socket) = socket();

    socket.send(&TerminalMessage::bind("0123456789abcdef"));
    handle_connection(sink, stream, ctx).await;

    let frames: Vec<Message> = socket.from_server.by_ref().collect().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(close_code_of(&frames[0]), Some(close_code::BIND_FAILED));
    match &frames[0] {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.reason.as_str(), "session not found: 0123456789abcdef")
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_first_frame_must_be_bind() {
    let ctx = context(MockClusterClient::new());
    let (sink, stream, mut socket) = socket();

    socket.send(&TerminalMessage::stdin("ls\r"));
    handle_connection(sink, stream, ctx).await;

    let frames: Vec<Message> = socket.from_server.by_ref().collect().await;
    assert_eq!(close_code_of(&frames[0]), Some(close_code::BIND_FAILED));
}

#[tokio::test]
async fn test_bound_session_runs_shell_then_closes_normally() {
    let mut client = MockClusterClient::new();
    client
        .expect_exec()
        .times(1)
        .withf(|cluster, info, command, _| {
            cluster.name == "c1" && info.pod_name == "p1" && command[0] == "/bin/bash"
        })
        .returning(|_, _, _, _| Ok(()));

    let ctx = context(client);
    let session = ctx
        .registry
        .create_session(ConnectionInfo::workload("c1", "ns", "p1", "c", "alice"))
        .await
        .unwrap();

    let (sink, stream, mut socket) = socket();
    socket
        .to_server
        .unbounded_send(Ok(Message::Ping(vec![9].into())))
        .unwrap();
    socket.send(&TerminalMessage::bind(session.as_str()));
    handle_connection(sink, stream, ctx).await;

    let frames: Vec<Message> = socket.from_server.by_ref().collect().await;
    assert!(matches!(frames[0], Message::Pong(_)));
    assert_eq!(close_code_of(frames.last().unwrap()), Some(close_code::NORMAL));
}

#[tokio::test]
async fn test_failed_shell_sends_toast_and_error_close() {
    let mut client = MockClusterClient::new();
    client
        .expect_exec()
        .times(2)
        .returning(|_, _, _, _| Err(Error::RemoteExecFailed("no shell".into())));

    let ctx = context(client);
    let session = ctx
        .registry
        .create_session(ConnectionInfo::workload("c1", "ns", "p1", "c", "alice"))
        .await
        .unwrap();

    let (sink, stream, mut socket) = socket();
    socket.send(&TerminalMessage::bind(session.as_str()));
    handle_connection(sink, stream, ctx).await;

    let frames: Vec<Message> = socket.from_server.by_ref().collect().await;
    assert_eq!(frames.len(), 2);
    match &frames[0] {
        Message::Text(text) => {
            let toast = TerminalMessage::parse(text.as_str()).unwrap();
            assert_eq!(toast.op, Op::Toast);
            assert!(toast.data.contains("no shell"));
        }
        other => panic!("expected toast, got {:?}", other),
    }
    assert_eq!(close_code_of(&frames[1]), Some(close_code::EXEC_FAILED));
}

#[tokio::test]
async fn test_control_session_uses_cluster_picked_at_creation() {
    // The metadata mock has no list expectation, so rediscovery would panic
    let mut client = MockClusterClient::new();
    client
        .expect_exec()
        .times(1)
        .withf(|cluster, info, command, _| {
            cluster.name == "host"
                && info.is_control_cluster
                && command[0] == crate::exec::CONTROL_SCRIPT
        })
        .returning(|_, _, _, _| Ok(()));

    let ctx = context(client);
    let mut info = ConnectionInfo::workload("host", "kubecube-system", "shell-1", "shell", "alice");
    info.is_control_cluster = true;
    info.target_cluster = Some("c1".into());
    info.token = Some(crate::session::SecretToken::new("tok"));
    let session = ctx.registry.create_session(info).await.unwrap();

    let (sink, stream, mut socket) = socket();
    socket.send(&TerminalMessage::bind(session.as_str()));
    handle_connection(sink, stream, ctx).await;

    let frames: Vec<Message> = socket.from_server.by_ref().collect().await;
    assert_eq!(close_code_of(frames.last().unwrap()), Some(close_code::NORMAL));
}
