//! JSON-RPC request/response plumbing over a pair of byte streams.
//!
//! A background task owns the read half and routes each response to the
//! request waiting for it. Requests that time out or are dropped release
//! their slot, so a late response is discarded instead of being delivered
//! to whoever asks next.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{CancelledParams, IncomingMessage, JsonRpcNotification, JsonRpcRequest};

/// Maximum size of one line read from a server (1 MiB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Time allowed for sending `notifications/cancelled`.
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Reply = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct PendingMap {
    slots: HashMap<i64, Reply>,
    closed: bool,
}

struct Shared {
    server: String,
    writer: tokio::sync::Mutex<BoxWriter>,
    pending: Mutex<PendingMap>,
    next_id: AtomicI64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        let mut map = self.pending();
        map.closed = true;
        for (_, reply) in map.slots.drain() {
            let _ = reply.send(Err(Error::ServerExited));
        }
    }

    /// Fail every outstanding request without closing the channel.
    fn fail_pending(&self, error: impl Fn() -> Error) {
        for (_, reply) in self.pending().slots.drain() {
            let _ = reply.send(Err(error()));
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Removes a pending slot when the waiting request goes away.
struct SlotGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().slots.remove(&self.id);
    }
}

/// Cheaply cloneable handle to one server's JSON-RPC channel.
#[derive(Clone)]
pub(crate) struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    /// Start routing responses read from `reader`.
    pub(crate) fn start(server: &str, reader: BoxReader, writer: BoxWriter) -> Self {
        let shared = Arc::new(Shared {
            server: server.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(PendingMap::default()),
            next_id: AtomicI64::new(1),
            reader: Mutex::new(None),
        });

        // The task holds only a weak reference so dropping the last client
        // handle tears the channel down.
        let weak = Arc::downgrade(&shared);
        let server_name = server.to_string();
        let task = tokio::spawn(async move {
            read_loop(&server_name, reader, &weak).await;
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        });
        *shared.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Self { shared }
    }

    /// Whether the server side has gone away or the client was shut down.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.pending().closed
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// The timeout covers writing the request too. A server that stops
    /// reading mid-request leaves a torn line behind, so the channel is shut
    /// down in that case.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.shared.pending();
            if map.closed {
                return Err(Error::ServerExited);
            }
            map.slots.insert(id, tx);
        }
        let guard = SlotGuard {
            shared: &self.shared,
            id,
        };

        let message = JsonRpcRequest::new(id, method, params);
        let mut sent = false;
        let exchange = async {
            if let Err(e) = self.write_line(&message).await {
                return Err(e);
            }
            sent = true;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ServerExited),
            }
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                drop(guard);
                if sent {
                    debug!(server = %self.shared.server, id, method, "request timed out");
                    self.cancel_remote(id, "request timed out").await;
                } else {
                    warn!(server = %self.shared.server, method, "server stopped reading its input");
                    self.shutdown();
                }
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Send a notification; no response is expected.
    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.write_line(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Stop routing and fail every outstanding request.
    pub(crate) fn shutdown(&self) {
        self.shared.close();
        if let Some(task) = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    async fn cancel_remote(&self, id: i64, reason: &str) {
        let params = CancelledParams {
            request_id: id,
            reason: reason.to_string(),
        };
        let params = serde_json::to_value(params).ok();
        let notice = self.notify("notifications/cancelled", params);
        match tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, notice).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(server = %self.shared.server, id, "failed to send cancellation: {e}");
            }
            Err(_) => debug!(server = %self.shared.server, id, "cancellation notice timed out"),
        }
    }

    async fn write_line(&self, message: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut writer = self.shared.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_loop(server: &str, reader: BoxReader, shared: &std::sync::Weak<Shared>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let limit = MAX_OUTPUT_SIZE as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!(server, "server closed its output");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(server, "failed reading from server: {e}");
                return;
            }
        }

        if line.last() != Some(&b'\n') && line.len() > MAX_OUTPUT_SIZE {
            // Too long to hold. The id is somewhere in the discarded part, so
            // everything waiting on this server fails.
            let size = match skip_line(&mut reader).await {
                Ok(rest) => line.len() + rest,
                Err(e) => {
                    warn!(server, "failed reading from server: {e}");
                    return;
                }
            };
            warn!(server, size, "discarding oversized message");
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.fail_pending(|| Error::OutputTooLarge {
                size,
                max: MAX_OUTPUT_SIZE,
            });
            continue;
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: IncomingMessage = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                debug!(server, "ignoring non-protocol output: {e}");
                continue;
            }
        };

        let Some(id) = message.response_id() else {
            debug!(server, method = ?message.method, "ignoring server-initiated message");
            continue;
        };

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let Some(reply) = shared.pending().slots.remove(&id) else {
            debug!(server, id, "discarding response for abandoned request");
            continue;
        };
        let _ = reply.send(message.into_result().map_err(Error::from));
    }
}

/// Consume input up to and including the next newline. Returns the byte count.
async fn skip_line(reader: &mut BufReader<BoxReader>) -> std::io::Result<usize> {
    let mut skipped = 0;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(skipped);
        }
        let (used, done) = match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (buf.len(), false),
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    fn client_pair() -> (RpcClient, tokio::io::DuplexStream) {
        let (client_io, server_io) = duplex(8 * 1024);
        let (reader, writer) = split(client_io);
        let client = RpcClient::start("test", Box::new(reader), Box::new(writer));
        (client, server_io)
    }

    #[tokio::test]
    async fn routes_response_by_id() {
        let (client, server_io) = client_pair();
        let (read, mut write) = split(server_io);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].as_i64().unwrap();
            // A notification first, then the answer.
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n")
                .await
                .unwrap();
            let reply = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"ok\":true}}}}\n");
            write.write_all(reply.as_bytes()).await.unwrap();
        });

        let result = client
            .request("ping", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn eof_fails_pending_and_later_requests() {
        let (client, server_io) = client_pair();
        let handle = tokio::spawn({
            let client = client.clone();
            async move { client.request("ping", None, Duration::from_secs(5)).await }
        });
        while client.shared.pending().slots.is_empty() {
            tokio::task::yield_now().await;
        }
        drop(server_io);

        assert!(matches!(handle.await.unwrap(), Err(Error::ServerExited)));
        assert!(client.is_closed());
        assert!(matches!(
            client.request("ping", None, Duration::from_secs(5)).await,
            Err(Error::ServerExited)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_request_releases_its_slot() {
        let (client, _server_io) = client_pair();
        let result = client
            .request("slow", None, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(client.shared.pending().slots.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_when_server_stops_reading() {
        let (client, _server_io) = client_pair();
        let params = serde_json::json!({ "blob": "x".repeat(64 * 1024) });

        let result = client
            .request("tools/call", Some(params), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(client.is_closed());
        assert!(client.shared.pending().slots.is_empty());
    }

    #[tokio::test]
    async fn oversized_message_fails_waiting_request_only() {
        let (client, server_io) = client_pair();
        let (read, mut write) = split(server_io);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let id = serde_json::from_str::<Value>(&first).unwrap()["id"].as_i64().unwrap();
            let huge = format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"text\":\"{}\"}}}}\n",
                "a".repeat(MAX_OUTPUT_SIZE)
            );
            write.write_all(huge.as_bytes()).await.unwrap();

            let second = lines.next_line().await.unwrap().unwrap();
            let id = serde_json::from_str::<Value>(&second).unwrap()["id"].as_i64().unwrap();
            let reply = format!("{{\"jsonrpc\":\"2.0\",\"id\":{id},\"result\":{{\"ok\":true}}}}\n");
            write.write_all(reply.as_bytes()).await.unwrap();
        });

        let err = client
            .request("big", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutputTooLarge { size, .. } if size > MAX_OUTPUT_SIZE));

        let result = client
            .request("small", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }
}
