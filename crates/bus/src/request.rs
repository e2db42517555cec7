//! Request/response correlation layered on top of [`crate::Bus`]
//! pub/sub, grounded on `crates/mcp-client/src/transport.rs`'s
//! pending-request-map-with-timeout shape (`StdioTransport`), retargeted
//! from a stdio/SSE transport onto `Bus::publish`/`subscribe`. This is
//! the transport `ra-mcp`'s `BusMcpClient`/`BusMcpServer` build on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use ra_domain::error::{Error, Result};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::Bus;

/// Sends a correlated request on `request_channel` and awaits a single
/// matching reply on `response_channel`, keyed by the caller-supplied
/// correlation id (the outgoing JSON-RPC request id, serialized as a
/// string key in the pending map — mirrors `StdioTransport`'s
/// `pending: HashMap<u64, oneshot::Sender<...>>`).
pub struct BusRequestClient {
    bus: Arc<dyn Bus>,
    response_channel: String,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
    _listener: tokio::task::JoinHandle<()>,
}

impl BusRequestClient {
    /// Start listening on `response_channel` and return a client that can
    /// issue correlated requests against `request_channel`.
    pub async fn connect(bus: Arc<dyn Bus>, response_channel: &str) -> Result<Self> {
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut stream = bus.subscribe(response_channel).await?;
        let pending_for_task = pending.clone();
        let listener = tokio::spawn(async move {
            while let Some(raw) = stream.next().await {
                let Ok(envelope) = serde_json::from_str::<Envelope>(&raw) else {
                    continue;
                };
                if let Some(tx) = pending_for_task.lock().remove(&envelope.correlation_id) {
                    let _ = tx.send(envelope.payload);
                }
            }
        });

        Ok(Self {
            bus,
            response_channel: response_channel.to_string(),
            pending,
            _listener: listener,
        })
    }

    /// Publish `payload` (already-serialized JSON) on `request_channel`
    /// tagged with `correlation_id`, then wait up to `request_timeout` for
    /// a reply on this client's response channel. Rejects with
    /// `Error::Timeout` on expiry, with a `"Request timeout: <method>"`
    /// message naming the call that timed out.
    pub async fn request(
        &self,
        request_channel: &str,
        correlation_id: &str,
        payload: &str,
        request_timeout: Duration,
        method_for_timeout_message: &str,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(correlation_id.to_string(), tx);

        let envelope = Envelope {
            correlation_id: correlation_id.to_string(),
            reply_to: self.response_channel.clone(),
            payload: payload.to_string(),
        };
        let serialized = serde_json::to_string(&envelope).map_err(Error::Json)?;
        self.bus.publish(request_channel, &serialized).await?;

        match timeout(request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ToolRpc(format!(
                "Request timeout: {method_for_timeout_message}"
            ))),
            Err(_) => {
                self.pending.lock().remove(correlation_id);
                Err(Error::Timeout(format!(
                    "Request timeout: {method_for_timeout_message}"
                )))
            }
        }
    }

    /// Reject every pending request — called on disconnect so callers
    /// awaiting a reply fail fast instead of hanging.
    pub fn reject_all_pending(&self, reason: &str) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(format!(r#"{{"error":"{reason}"}}"#));
        }
    }
}

/// Subscribes to a request channel, dispatches each request through
/// `handler`, and publishes the reply on the envelope's `reply_to`
/// channel — the server half of the correlation pattern.
pub struct BusRequestServer;

impl BusRequestServer {
    /// Runs until the bus subscription ends. `handler` receives the raw
    /// (non-enveloped) request payload and must return the raw reply
    /// payload.
    pub async fn serve<F, Fut>(bus: Arc<dyn Bus>, request_channel: &str, handler: F) -> Result<()>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = String> + Send,
    {
        let mut stream = bus.subscribe(request_channel).await?;
        while let Some(raw) = stream.next().await {
            let Ok(envelope) = serde_json::from_str::<Envelope>(&raw) else {
                continue;
            };
            let reply_payload = handler(envelope.payload).await;
            let reply = Envelope {
                correlation_id: envelope.correlation_id,
                reply_to: String::new(),
                payload: reply_payload,
            };
            if let Ok(serialized) = serde_json::to_string(&reply) {
                let _ = bus.publish(&envelope.reply_to, &serialized).await;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Envelope {
    correlation_id: String,
    reply_to: String,
    payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;

    #[tokio::test]
    async fn request_response_roundtrip() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());

        let server_bus = bus.clone();
        tokio::spawn(async move {
            BusRequestServer::serve(server_bus, "req", |payload| async move {
                format!("echo:{payload}")
            })
            .await
            .unwrap();
        });
        // Give the server task a chance to subscribe before we publish.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = BusRequestClient::connect(bus.clone(), "resp-1").await.unwrap();
        let reply = client
            .request("req", "corr-1", "hello", Duration::from_secs(1), "test")
            .await
            .unwrap();
        assert_eq!(reply, "echo:hello");
    }

    #[tokio::test]
    async fn request_times_out_without_a_server() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let client = BusRequestClient::connect(bus, "resp-2").await.unwrap();
        let result = client
            .request(
                "nobody-home",
                "corr-2",
                "hi",
                Duration::from_millis(30),
                "tools/call",
            )
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("tools/call"));
    }
}
