//! Matches responses to the requests that caused them.
//!
//! Every call registers a pending entry under a fresh id before the request
//! is written. A routing task consumes the pump's inbound channel, resolves
//! entries by id and answers requests the server sends to us. The pending
//! table and its `closed` flag sit behind one lock, so a response, a timeout
//! and a connection loss can never resolve the same entry twice.

use crate::envelope::{Envelope, EnvelopeKind, METHOD_NOT_FOUND, RequestId, RpcError};
use crate::error::McpError;
use crate::pump::Outbound;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Completion = Result<Value, McpError>;

struct PendingRequest {
    method: String,
    deadline: Instant,
    tx: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
    closed: bool,
}

type SharedTable = Arc<Mutex<PendingTable>>;

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fail every pending request and refuse new ones.
fn fail_all(table: &Mutex<PendingTable>, server: &str) {
    let drained: Vec<PendingRequest> = {
        let mut table = lock(table);
        table.closed = true;
        table.entries.drain().map(|(_, pending)| pending).collect()
    };
    if !drained.is_empty() {
        tracing::debug!(server, "Failing {} pending request(s)", drained.len());
    }
    for pending in drained {
        let _ = pending.tx.send(Err(McpError::ConnectionLost {
            server: server.to_string(),
        }));
    }
}

/// Removes a call's entry when its future is dropped or finishes.
struct PendingGuard<'a> {
    table: &'a Mutex<PendingTable>,
    id: &'a RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).entries.remove(self.id);
    }
}

/// Request/response matching for one connection.
pub struct Correlator {
    server: String,
    next_id: AtomicI64,
    table: SharedTable,
    outbound: Outbound,
    router: JoinHandle<()>,
}

impl Correlator {
    /// Start routing envelopes from `inbound`.
    pub fn new(server: &str, outbound: Outbound, inbound: mpsc::UnboundedReceiver<Envelope>) -> Self {
        let table: SharedTable = Arc::default();
        let router = tokio::spawn(route(
            server.to_string(),
            Arc::clone(&table),
            outbound.clone(),
            inbound,
        ));
        Self {
            server: server.to_string(),
            next_id: AtomicI64::new(1),
            table,
            outbound,
            router,
        }
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        {
            let mut table = lock(&self.table);
            if table.closed {
                return Err(self.connection_lost());
            }
            table.entries.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    deadline,
                    tx,
                },
            );
        }
        let _guard = PendingGuard {
            table: &self.table,
            id: &id,
        };

        tracing::debug!(server = %self.server, %id, method, "-> request");
        // The deadline also covers queueing behind a child that stopped reading.
        let request = Envelope::request(id.clone(), method, params);
        match tokio::time::timeout_at(deadline, self.outbound.send(&request)).await {
            Ok(sent) => sent?,
            Err(_) => {
                tracing::debug!(server = %self.server, %id, method, "request not sent before deadline");
                return Err(self.timed_out(method, timeout));
            }
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.connection_lost()),
            Err(_) => {
                let expired = lock(&self.table).entries.remove(&id).is_some();
                // The router may have taken the entry just as the deadline hit.
                if !expired {
                    if let Ok(outcome) = rx.try_recv() {
                        return outcome;
                    }
                }
                tracing::debug!(server = %self.server, %id, method, "request timed out");
                Err(self.timed_out(method, timeout))
            }
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.connection_lost());
        }
        tracing::debug!(server = %self.server, method, "-> notification");
        self.outbound
            .send(&Envelope::notification(method, params))
            .await
    }

    /// Whether the inbound stream has ended or `close` was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.table).closed
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// Fail all pending requests with `ConnectionLost` and stop routing.
    pub fn close(&self) {
        fail_all(&self.table, &self.server);
        self.router.abort();
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> McpError {
        McpError::Timeout {
            server: self.server.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    fn connection_lost(&self) -> McpError {
        McpError::ConnectionLost {
            server: self.server.clone(),
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route(
    server: String,
    table: SharedTable,
    outbound: Outbound,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = inbound.recv().await {
        match envelope.kind() {
            EnvelopeKind::Response => resolve(&server, &table, envelope),
            EnvelopeKind::Request => answer(&server, &outbound, envelope),
            EnvelopeKind::Notification => {
                tracing::debug!(
                    server = %server,
                    method = envelope.method.as_deref().unwrap_or_default(),
                    "<- notification (ignored)"
                );
            }
            EnvelopeKind::Invalid => {
                tracing::warn!(server = %server, "Ignoring envelope that is neither call nor response");
            }
        }
    }
    tracing::debug!(server = %server, "inbound stream ended");
    fail_all(&table, &server);
}

fn resolve(server: &str, table: &Mutex<PendingTable>, envelope: Envelope) {
    let Some(id) = envelope.id else {
        return;
    };
    let Some(pending) = lock(table).entries.remove(&id) else {
        tracing::debug!(server, %id, "Discarding response with no pending request");
        return;
    };

    let remaining = pending.deadline.saturating_duration_since(Instant::now());
    tracing::debug!(
        server,
        %id,
        method = %pending.method,
        remaining_ms = remaining.as_millis() as u64,
        "<- response"
    );

    let outcome = match (envelope.error, envelope.result) {
        (Some(error), _) => Err(McpError::Remote {
            server: server.to_string(),
            code: error.code,
            message: error.message,
        }),
        (None, Some(result)) => Ok(result),
        (None, None) => Err(McpError::Protocol(format!(
            "response {id} has neither result nor error"
        ))),
    };
    let _ = pending.tx.send(outcome);
}

/// Replies are queued without waiting so routing never stalls on stdin.
fn answer(server: &str, outbound: &Outbound, envelope: Envelope) {
    let (Some(id), Some(method)) = (envelope.id, envelope.method) else {
        return;
    };
    let reply = if method == "ping" {
        Envelope::response(id, serde_json::json!({}))
    } else {
        tracing::debug!(server, %method, "Rejecting unsupported server request");
        Envelope::error_response(
            id,
            RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {method}")),
        )
    };
    if let Err(e) = outbound.try_send(&reply) {
        tracing::debug!(server, "Failed to answer server request: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{FrameReader, Framing};
    use crate::pump::IoPump;
    use std::collections::HashSet;
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};

    /// The far end of an in-memory connection.
    struct FakeServer {
        frames: FrameReader<BufReader<DuplexStream>>,
        writer: DuplexStream,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Envelope {
            self.frames.next_envelope().await.unwrap().unwrap()
        }

        async fn send(&mut self, envelope: &Envelope) {
            let frame = Framing::LineDelimited.encode(envelope).unwrap();
            self.writer.write_all(&frame).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    fn setup() -> (IoPump, Correlator, FakeServer) {
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);
        let (pump, inbound) = IoPump::start("fake", client_in, client_out, Framing::LineDelimited);
        let correlator = Correlator::new("fake", pump.outbound(), inbound);
        let server = FakeServer {
            frames: FrameReader::new(BufReader::new(server_in), Framing::LineDelimited),
            writer: server_out,
        };
        (pump, correlator, server)
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn responses_routed_regardless_of_arrival_order() {
        let (_pump, correlator, mut server) = setup();

        let call_a = correlator.call("a", None, LONG);
        let call_b = correlator.call("b", None, LONG);
        let script = async {
            let first = server.recv().await;
            let second = server.recv().await;
            let (req_a, req_b) = if first.method.as_deref() == Some("a") {
                (first, second)
            } else {
                (second, first)
            };
            // Answer B before A.
            server
                .send(&Envelope::response(req_b.id.unwrap(), serde_json::json!("B")))
                .await;
            server
                .send(&Envelope::response(req_a.id.unwrap(), serde_json::json!("A")))
                .await;
        };

        let (a, b, ()) = tokio::join!(call_a, call_b, script);
        assert_eq!(a.unwrap(), "A");
        assert_eq!(b.unwrap(), "B");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_unique_ids() {
        let (_pump, correlator, mut server) = setup();
        let correlator = Arc::new(correlator);

        let mut calls = Vec::new();
        for i in 0..20 {
            let c = Arc::clone(&correlator);
            calls.push(tokio::spawn(async move {
                c.call("work", Some(serde_json::json!({ "i": i })), LONG).await
            }));
        }

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let req = server.recv().await;
            let id = req.id.clone().unwrap();
            assert!(seen.insert(id.clone()), "duplicate id {id}");
            server
                .send(&Envelope::response(id, req.params.unwrap()["i"].clone()))
                .await;
        }

        let mut results: Vec<i64> = Vec::new();
        for call in calls {
            results.push(call.await.unwrap().unwrap().as_i64().unwrap());
        }
        results.sort();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_response_is_discarded() {
        let (_pump, correlator, mut server) = setup();

        let started = Instant::now();
        let err = correlator
            .call("slow", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 100, .. }), "{err:?}");
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(correlator.pending_count(), 0);

        // Answer the expired request, then check the connection still works.
        let slow = server.recv().await;
        server
            .send(&Envelope::response(slow.id.unwrap(), serde_json::json!("late")))
            .await;

        let next = correlator.call("fast", None, LONG);
        let reply = async {
            let req = server.recv().await;
            assert_eq!(req.method.as_deref(), Some("fast"));
            server
                .send(&Envelope::response(req.id.unwrap(), serde_json::json!("on time")))
                .await;
        };
        let (result, ()) = tokio::join!(next, reply);
        assert_eq!(result.unwrap(), "on time");
    }

    /// A connection whose far end never reads what we write.
    fn setup_stalled() -> (IoPump, Correlator, DuplexStream, DuplexStream) {
        let (client_out, server_in) = tokio::io::duplex(1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);
        let (pump, inbound) = IoPump::start("stalled", client_in, client_out, Framing::LineDelimited);
        let correlator = Correlator::new("stalled", pump.outbound(), inbound);
        (pump, correlator, server_in, server_out)
    }

    #[tokio::test]
    async fn deadline_covers_requests_stuck_behind_unread_stdin() {
        let (_pump, correlator, _unread, _server_out) = setup_stalled();
        let correlator = Arc::new(correlator);
        let padding = "x".repeat(512);

        let started = Instant::now();
        let mut calls = Vec::new();
        for i in 0..80 {
            let c = Arc::clone(&correlator);
            let params = serde_json::json!({ "i": i, "padding": padding });
            calls.push(tokio::spawn(async move {
                c.call("tools/call", Some(params), Duration::from_millis(100)).await
            }));
        }
        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(3), call)
                .await
                .expect("call outlived its deadline")
                .unwrap();
            assert!(matches!(result, Err(McpError::Timeout { timeout_ms: 100, .. })));
        }
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn server_requests_do_not_stall_response_routing() {
        let (_pump, correlator, _unread, mut server_out) = setup_stalled();

        let call = correlator.call("work", None, LONG);
        let flood = async {
            // Let the request reach the pipe before the replies pile up.
            tokio::time::sleep(Duration::from_millis(50)).await;
            for n in 0..500 {
                let ping = format!("{{\"jsonrpc\":\"2.0\",\"id\":\"p{n}\",\"method\":\"ping\"}}\n");
                server_out.write_all(ping.as_bytes()).await.unwrap();
            }
            server_out
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"done\"}\n")
                .await
                .unwrap();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(call, flood)
        })
        .await
        .expect("routing stalled");
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn error_response_becomes_remote_error() {
        let (_pump, correlator, mut server) = setup();
        let call = correlator.call("tools/call", None, LONG);
        let reply = async {
            let req = server.recv().await;
            server
                .send(&Envelope::error_response(
                    req.id.unwrap(),
                    RpcError::new(-32601, "Unknown tool: mul"),
                ))
                .await;
        };
        let (result, ()) = tokio::join!(call, reply);
        match result.unwrap_err() {
            McpError::Remote { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Unknown tool: mul");
            }
            other => panic!("Expected Remote, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_result_is_a_success() {
        let (_pump, correlator, mut server) = setup();
        let call = correlator.call("noop", None, LONG);
        let reply = async {
            let req = server.recv().await;
            let id = req.id.unwrap();
            server
                .send_raw(&format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":null}}\n"))
                .await;
        };
        let (result, ()) = tokio::join!(call, reply);
        assert_eq!(result.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn stream_end_fails_pending_with_connection_lost() {
        let (_pump, correlator, server) = setup();
        let call = correlator.call("never", None, LONG);
        let hang_up = async move {
            let mut server = server;
            let _ = server.recv().await;
            drop(server);
        };
        let (result, ()) = tokio::join!(call, hang_up);
        assert!(matches!(result, Err(McpError::ConnectionLost { .. })));

        // Wait for the router to observe the end of the stream.
        for _ in 0..50 {
            if correlator.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            correlator.call("after", None, LONG).await,
            Err(McpError::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (_pump, correlator, _server) = setup();
        let correlator = Arc::new(correlator);
        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.call("stuck", None, LONG).await });

        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        correlator.close();
        assert!(matches!(
            call.await.unwrap(),
            Err(McpError::ConnectionLost { .. })
        ));
        assert!(correlator.is_closed());
    }

    #[tokio::test]
    async fn dropped_call_removes_pending_entry() {
        let (_pump, correlator, _server) = setup();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            correlator.call("abandoned", None, LONG),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn server_ping_is_answered_and_other_requests_rejected() {
        let (_pump, _correlator, mut server) = setup();

        server.send_raw("{\"jsonrpc\":\"2.0\",\"id\":\"p1\",\"method\":\"ping\"}\n").await;
        let pong = server.recv().await;
        assert_eq!(pong.id, Some(RequestId::Text("p1".into())));
        assert_eq!(pong.result, Some(serde_json::json!({})));

        server
            .send_raw("{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"sampling/createMessage\"}\n")
            .await;
        let rejected = server.recv().await;
        assert_eq!(rejected.id, Some(RequestId::Number(2)));
        assert_eq!(rejected.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unmatched_and_notification_envelopes_are_ignored() {
        let (_pump, correlator, mut server) = setup();
        server
            .send_raw("{\"jsonrpc\":\"2.0\",\"id\":999,\"result\":{}}\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
            .await;

        let call = correlator.call("real", None, LONG);
        let reply = async {
            let req = server.recv().await;
            server
                .send(&Envelope::response(req.id.unwrap(), serde_json::json!(1)))
                .await;
        };
        let (result, ()) = tokio::join!(call, reply);
        assert_eq!(result.unwrap(), 1);
    }
}
