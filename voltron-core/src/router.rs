// Request router
//
// Accepts view clients over a local socket or TCP, one task per connection.
// Every request reaches the adaptor through the worker queue; blocking
// requests park in the event bridge until the target stops.

use crate::config::{Config, ViewConfig};
use crate::error::{VoltronError, VoltronResult};
use crate::events::EventBridge;
use crate::protocol::{
    ClientId, Reply, Request, RequestKind, Response, SubscriptionId, ViewKind, MAX_LINE_LENGTH,
};
use crate::registry::PluginRegistry;
use crate::worker::{ReplySink, RequestJob, WorkQueue};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-connection lifecycle. Authentication is trivial: there are no
/// credentials, a connected client is immediately authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Authenticated,
    Serving,
    Closed,
}

/// Snapshot for the `status` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStatus {
    pub connections: usize,
    pub pending: usize,
    pub subscriptions: usize,
}

/// Reply to one in-process request
#[derive(Debug)]
pub struct PendingReply {
    rx: mpsc::UnboundedReceiver<Reply>,
}

fn worker_gone() -> VoltronError {
    VoltronError::TargetGone("worker stopped before replying".to_string())
}

impl PendingReply {
    pub async fn recv(mut self) -> VoltronResult<Value> {
        self.rx.recv().await.map_or_else(|| Err(worker_gone()), |r| r.result)
    }

    /// For callers outside the runtime
    pub fn blocking_recv(mut self) -> VoltronResult<Value> {
        self.rx.blocking_recv().map_or_else(|| Err(worker_gone()), |r| r.result)
    }

    pub fn try_recv(&mut self) -> Option<VoltronResult<Value>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply.result),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(Err(worker_gone())),
        }
    }
}

/// Live handle to a view subscription. Dropping it ends the subscription at
/// the next stop.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub view: ViewKind,
    updates: mpsc::UnboundedReceiver<Reply>,
}

impl Subscription {
    /// Next update, `None` once the session is gone
    pub async fn next(&mut self) -> Option<VoltronResult<Value>> {
        self.updates.recv().await.map(|r| r.result)
    }

    pub fn try_next(&mut self) -> Option<VoltronResult<Value>> {
        self.updates.try_recv().ok().map(|r| r.result)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line(String),
    /// Longer than the limit; the whole line was consumed and discarded
    TooLong(usize),
    Eof,
}

/// Read one newline-terminated line, buffering at most `limit` bytes of it.
async fn read_bounded_line<R>(reader: &mut R, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut seen = 0usize;
    let mut terminated = false;
    while !terminated {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if seen == 0 {
                return Ok(LineRead::Eof);
            }
            break;
        }
        let (take, consumed) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                terminated = true;
                (pos, pos + 1)
            }
            None => (available.len(), available.len()),
        };
        let room = limit.saturating_sub(buf.len()).min(take);
        buf.extend_from_slice(&available[..room]);
        seen = seen.saturating_add(take);
        reader.consume(consumed);
    }
    if seen > limit {
        return Ok(LineRead::TooLong(seen));
    }
    Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()))
}

pub struct Router {
    registry: Arc<PluginRegistry>,
    bridge: Arc<EventBridge>,
    queue: WorkQueue,
    runtime: Handle,
    view_config: ViewConfig,
    default_timeout: Option<Duration>,
    next_client: AtomicU64,
    connections: AtomicUsize,
}

impl Router {
    pub fn new(
        registry: Arc<PluginRegistry>,
        bridge: Arc<EventBridge>,
        queue: WorkQueue,
        config: &Config,
        runtime: Handle,
    ) -> Self {
        Self {
            registry,
            bridge,
            queue,
            runtime,
            view_config: config.view.clone(),
            default_timeout: config.wait_timeout(),
            next_client: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn open_client(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop a client's parked requests and subscriptions.
    pub fn close_client(&self, client: ClientId) -> usize {
        self.bridge.cancel_client(client)
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            connections: self.connections.load(Ordering::Relaxed),
            pending: self.bridge.pending(),
            subscriptions: self.bridge.subscription_count(),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Submit a request from an in-process client.
    pub fn request(&self, client: ClientId, request: Request) -> PendingReply {
        let (sink, rx) = mpsc::unbounded_channel();
        self.submit(client, &sink, request);
        PendingReply { rx }
    }

    /// Open a view subscription for an in-process client.
    pub fn subscribe(&self, client: ClientId, view: ViewKind) -> Subscription {
        let (sink, updates) = mpsc::unbounded_channel();
        let id = self.register_view(client, view, sink);
        Subscription { id, view, updates }
    }

    pub fn unsubscribe(&self, client: ClientId, id: SubscriptionId) -> bool {
        self.bridge.unsubscribe(client, id)
    }

    fn register_view(&self, client: ClientId, view: ViewKind, sink: ReplySink) -> SubscriptionId {
        let request = Request::new(view.request(&self.view_config));
        self.bridge.subscribe(client, view, request, sink)
    }

    /// Parse one wire line and submit it. Parse failures are answered in
    /// order with the client's other replies.
    pub fn handle_line(&self, client: ClientId, sink: &ReplySink, line: &str) {
        match Request::parse(line) {
            Ok(request) => self.submit(client, sink, request),
            Err(e) => {
                warn!("client {} sent a bad request: {}", client, e);
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned());
                self.queue.deliver(
                    sink,
                    Reply {
                        id,
                        subscription: None,
                        result: Err(e),
                    },
                );
            }
        }
    }

    pub fn submit(&self, client: ClientId, sink: &ReplySink, request: Request) {
        debug!("client {} -> {}", client, request.kind.name());
        if request.kind.is_local() {
            let result = self.answer_locally(client, sink, &request.kind);
            self.queue.deliver(sink, Reply::to(&request, result));
            return;
        }

        let timeout = request.timeout.or(self.default_timeout);
        let block = request.block || request.kind.always_blocks();
        let job = RequestJob {
            client,
            request,
            sink: sink.clone(),
            subscription: None,
        };
        if !block {
            self.queue.submit(job);
            return;
        }

        let waiter = self.bridge.park(job);
        if let Some(timeout) = timeout {
            let bridge = self.bridge.clone();
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(job) = bridge.expire(waiter) {
                    debug!("client {} waiter {} timed out", job.client, waiter);
                    job.reply(Err(VoltronError::Timeout(timeout)));
                }
            });
            self.bridge.arm_timer(waiter, timer.abort_handle());
        }
    }

    fn answer_locally(&self, client: ClientId, sink: &ReplySink, kind: &RequestKind) -> VoltronResult<Value> {
        match kind {
            RequestKind::Plugins => Ok(self.registry.describe()),
            RequestKind::Subscribe { view } => {
                let plugin = self
                    .registry
                    .view(view)
                    .ok_or_else(|| VoltronError::InvalidArguments(format!("unknown view: {}", view)))?;
                let kind = plugin.kind;
                let id = self.register_view(client, kind, sink.clone());
                Ok(json!({ "subscription": id, "view": kind }))
            }
            RequestKind::Unsubscribe { id } => {
                if self.bridge.unsubscribe(client, *id) {
                    Ok(json!({ "unsubscribed": id }))
                } else {
                    Err(VoltronError::NotFound(format!("subscription {}", id)))
                }
            }
            other => Err(VoltronError::Unsupported(format!(
                "{} must go through the worker",
                other.name()
            ))),
        }
    }

    /// Serve one connection until the client goes away.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client = self.open_client();
        let mut state = ConnectionState::Connected;
        info!("client {} connected", client);
        self.connections.fetch_add(1, Ordering::Relaxed);

        state = match state {
            ConnectionState::Connected => ConnectionState::Authenticated,
            other => other,
        };
        debug!("client {} {:?}", client, state);

        let (reader, mut writer) = tokio::io::split(stream);
        let (sink, mut replies) = mpsc::unbounded_channel::<Reply>();
        let writer_task = tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                let line = Response::from(reply).encode();
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!("client {} write failed: {}", client, e);
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        state = ConnectionState::Serving;
        debug!("client {} {:?}", client, state);
        let mut reader = BufReader::new(reader);
        let mut clean_close = true;
        loop {
            match read_bounded_line(&mut reader, MAX_LINE_LENGTH).await {
                Ok(LineRead::Eof) => break,
                Ok(LineRead::Line(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    self.handle_line(client, &sink, line);
                }
                Ok(LineRead::TooLong(length)) => {
                    warn!("client {} sent a {} byte line", client, length);
                    self.queue.deliver(
                        &sink,
                        Reply {
                            id: None,
                            subscription: None,
                            result: Err(VoltronError::MalformedRequest(format!(
                                "request too large: {} bytes (max: {} bytes)",
                                length, MAX_LINE_LENGTH
                            ))),
                        },
                    );
                }
                Err(e) => {
                    warn!("client {} read error: {}", client, e);
                    clean_close = false;
                    break;
                }
            }
        }

        state = ConnectionState::Closed;
        let cancelled = self.bridge.cancel_client(client);
        self.connections.fetch_sub(1, Ordering::Relaxed);
        info!("client {} {:?}, {} parked item(s) cancelled", client, state, cancelled);

        // Replies to requests already queued are still written on a clean close
        drop(sink);
        if clean_close {
            let _ = writer_task.await;
        } else {
            writer_task.abort();
        }
    }

    /// Bind the local socket, replacing a stale socket file.
    pub fn bind_unix(path: &Path) -> std::io::Result<UnixListener> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if path.exists() {
            debug!("removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!("listening on {}", path.display());
        Ok(listener)
    }

    pub async fn serve_unix(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(self.clone().handle_connection(stream));
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("tcp connection from {}", peer);
                    tokio::spawn(self.clone().handle_connection(stream));
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::{Address, Status};
    use crate::test_support::{fake_factory, fake_registry, FakeTarget};
    use crate::types::{StopReason, TargetState};
    use crate::worker::{spawn_dedicated, work_queue, Limits};
    use tokio::net::UnixStream;

    fn start(target: &FakeTarget) -> Arc<Router> {
        let (queue, jobs) = work_queue();
        let bridge = EventBridge::new(queue.clone());
        spawn_dedicated(fake_factory, target.handle(), Limits::default(), bridge.notifier(), jobs).unwrap();
        Arc::new(Router::new(
            Arc::new(fake_registry()),
            bridge,
            queue,
            &Config::default(),
            Handle::current(),
        ))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    struct WireClient {
        lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        writer: tokio::net::unix::OwnedWriteHalf,
    }

    impl WireClient {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn serve(router: &Arc<Router>) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = Router::bind_unix(&path).unwrap();
        tokio::spawn(router.clone().serve_unix(listener));
        (dir, path)
    }

    #[tokio::test]
    async fn test_registers_stopped_and_running() {
        let target = FakeTarget::new();
        let router = start(&target);
        let (_dir, path) = serve(&router).await;
        let mut client = WireClient::connect(&path).await;

        client.send(r#"{"type":"registers","block":false}"#).await;
        let response = client.recv().await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["body"]["rax"], 0);
        assert!(response.get("error_kind").is_none());

        target.set_state(TargetState::running());
        client.send(r#"{"type":"registers","block":false}"#).await;
        let response = client.recv().await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["error_kind"], "NotStopped");
    }

    #[tokio::test]
    async fn test_blocking_request_sees_post_stop_state() {
        let target = FakeTarget::new();
        target.run();
        let router = start(&target);
        let client = router.open_client();

        let pending = router.request(client, Request::blocking(RequestKind::Registers));
        assert_eq!(router.status().pending, 1);

        target.set_register("rax", 42);
        target.stop(StopReason::Breakpoint);
        let regs = tokio::time::timeout(Duration::from_secs(5), pending.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(regs["rax"], 42);
        assert_eq!(router.status().pending, 0);
    }

    #[tokio::test]
    async fn test_responses_in_submission_order() {
        let target = FakeTarget::new();
        target.map(0x7000, vec![0; 64]);
        let router = start(&target);
        let client = router.open_client();
        let (sink, mut replies) = mpsc::unbounded_channel();

        for i in 0..50 {
            let line = match i % 4 {
                0 => json!({"type": "memory", "args": {"address": 0x7000, "length": 8}, "id": i}),
                1 => json!({"type": "plugins", "id": i}),
                2 => json!({"type": "bogus", "id": i}),
                _ => json!({"type": "state", "id": i}),
            };
            router.handle_line(client, &sink, &line.to_string());
        }
        for i in 0..50 {
            let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply.id, Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_malformed_keeps_connection_open() {
        let target = FakeTarget::new();
        let router = start(&target);
        let (_dir, path) = serve(&router).await;
        let mut client = WireClient::connect(&path).await;

        client.send("this is not json").await;
        client.send(r#"{"type":"state","id":"s1"}"#).await;
        let first = client.recv().await;
        assert_eq!(first["error_kind"], "MalformedRequest");
        let second = client.recv().await;
        assert_eq!(second["status"], "ok");
        assert_eq!(second["id"], "s1");
        assert_eq!(second["body"]["state"], "stopped");
    }

    #[tokio::test]
    async fn test_oversized_line_rejected_and_connection_serves() {
        let target = FakeTarget::new();
        let router = start(&target);
        let (_dir, path) = serve(&router).await;
        let mut client = WireClient::connect(&path).await;

        let huge = "a".repeat(MAX_LINE_LENGTH * 3);
        client.writer.write_all(huge.as_bytes()).await.unwrap();
        client.send("").await;
        client.send(r#"{"type":"state","id":7}"#).await;

        let first = client.recv().await;
        assert_eq!(first["error_kind"], "MalformedRequest");
        let second = client.recv().await;
        assert_eq!(second["status"], "ok");
        assert_eq!(second["id"], 7);
        assert_eq!(router.status().connections, 1);
    }

    #[tokio::test]
    async fn test_bounded_line_reads() {
        let input = format!("short\n{}\ntail", "x".repeat(20));
        let mut reader = input.as_bytes();
        assert_eq!(
            read_bounded_line(&mut reader, 10).await.unwrap(),
            LineRead::Line("short".to_string())
        );
        assert_eq!(read_bounded_line(&mut reader, 10).await.unwrap(), LineRead::TooLong(20));
        assert_eq!(
            read_bounded_line(&mut reader, 10).await.unwrap(),
            LineRead::Line("tail".to_string())
        );
        assert_eq!(read_bounded_line(&mut reader, 10).await.unwrap(), LineRead::Eof);

        let mut exact = "0123456789\n".as_bytes();
        assert_eq!(
            read_bounded_line(&mut exact, 10).await.unwrap(),
            LineRead::Line("0123456789".to_string())
        );
    }

    #[tokio::test]
    async fn test_in_process_wait_always_blocks() {
        let target = FakeTarget::new();
        target.run();
        let router = start(&target);
        let client = router.open_client();

        let mut pending = router.request(client, Request::new(RequestKind::Wait));
        assert_eq!(router.status().pending, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pending.try_recv().is_none());

        target.stop(StopReason::Step);
        let state = tokio::time::timeout(Duration::from_secs(5), pending.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state["state"], "stopped");
        assert_eq!(router.status().pending, 0);
    }

    #[tokio::test]
    async fn test_released_waiter_disarms_timeout() {
        let target = FakeTarget::new();
        target.run();
        let router = start(&target);
        let client = router.open_client();
        let (sink, mut replies) = mpsc::unbounded_channel();

        router.handle_line(client, &sink, r#"{"type":"wait","args":{"timeout":0.2}}"#);
        assert_eq!(router.bridge.armed_timers(), 1);
        target.stop(StopReason::Breakpoint);
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.result.is_ok());
        assert_eq!(router.bridge.armed_timers(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_blocking_request() {
        let target = FakeTarget::new();
        target.run();
        let router = start(&target);
        let (_dir, path) = serve(&router).await;
        let before = router.status().pending;

        let mut client = WireClient::connect(&path).await;
        client.send(r#"{"type":"registers","block":true}"#).await;
        eventually(|| router.status().pending == before + 1).await;

        drop(client);
        eventually(|| router.status().pending == before && router.status().connections == 0).await;

        target.stop(StopReason::Breakpoint);
        assert_eq!(target.register_reads(), 0);
    }

    #[tokio::test]
    async fn test_blocking_timeout_replies_once() {
        let target = FakeTarget::new();
        target.run();
        let router = start(&target);
        let client = router.open_client();
        let (sink, mut replies) = mpsc::unbounded_channel();

        router.handle_line(client, &sink, r#"{"type":"wait","args":{"timeout":0.05}}"#);
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.result.unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(router.status().pending, 0);

        target.stop(StopReason::Step);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wire_subscription_updates_on_stop() {
        let target = FakeTarget::new();
        let router = start(&target);
        let (_dir, path) = serve(&router).await;
        let mut client = WireClient::connect(&path).await;

        client.send(r#"{"type":"subscribe","args":{"view":"bt"}}"#).await;
        let ack = client.recv().await;
        assert_eq!(ack["body"]["view"], "backtrace");
        let id = ack["body"]["subscription"].clone();

        target.run();
        target.stop(StopReason::Step);
        let update = client.recv().await;
        assert_eq!(update["subscription"], id);
        assert_eq!(update["body"]["frames"][1]["symbol"], "main");

        client.send(&format!(r#"{{"type":"unsubscribe","args":{{"id":{}}}}}"#, id)).await;
        assert_eq!(client.recv().await["status"], "ok");
        assert_eq!(router.status().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_concurrent_clients_disjoint_memory() {
        let target = FakeTarget::new();
        target.map(0x1000, vec![0x11; 16]);
        target.map(0x2000, vec![0x22; 16]);
        let router = start(&target);

        let a = router.request(
            router.open_client(),
            Request::new(RequestKind::Memory { address: Address::Absolute(0x1000), length: 4 }),
        );
        let b = router.request(
            router.open_client(),
            Request::new(RequestKind::Memory { address: Address::Absolute(0x2000), length: 4 }),
        );
        let (a, b) = tokio::join!(a.recv(), b.recv());
        assert_eq!(a.unwrap()["bytes"], "11111111");
        assert_eq!(b.unwrap()["bytes"], "22222222");
    }

    #[tokio::test]
    async fn test_target_gone_keeps_serving() {
        let target = FakeTarget::new();
        let router = start(&target);
        let client = router.open_client();

        target.exit();
        let err = router
            .request(client, Request::new(RequestKind::Registers))
            .recv()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetGone);

        let state = router.request(client, Request::new(RequestKind::State)).recv().await.unwrap();
        assert_eq!(state["state"], "exited");

        let response: Response = Reply { id: None, subscription: None, result: Err(err) }.into();
        assert_eq!(response.status, Status::Error);
    }
}
