//! Subscriber server.
//!
//! Every TCP connection is a subscriber: it receives each broadcast message
//! as one JSON line. Lines sent by the client keep the connection alive and
//! may carry control requests:
//!
//! ```text
//! -> {"op":"add","name":"crawler","host":"10.0.0.12","port":7070,"interval":"1s","credential":"local"}
//! <- {"type":"reply","ok":true}
//! <- {"name":"crawler","type":"metrics","data":{...}}
//! -> {"op":"remove","name":"nope"}
//! <- {"type":"reply","ok":false,"error":"core with name nope does not exist"}
//! ```
//!
//! A connection that sends nothing for the idle timeout is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Subscription;
use crate::manager::{CoreManager, CoreSpec};

/// Silence after which a subscriber is disconnected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_BUFFER: usize = 256;

/// Longest request line accepted before the subscriber is disconnected.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Control requests accepted from subscribers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Ping,
    List,
    Get { name: String },
    Add(CoreSpec),
    Remove { name: String },
    Credentials,
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    /// Always `"reply"`, separating answers from broadcast messages.
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            kind: "reply",
            ok: true,
            data,
            error: None,
        }
    }

    pub fn error(error: impl ToString) -> Self {
        Self {
            kind: "reply",
            ok: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// Execute one control request against the manager.
pub fn handle_request(manager: &CoreManager, request: Request) -> Reply {
    match request {
        Request::Ping => Reply::ok(Some(serde_json::json!("pong"))),
        Request::List => to_reply(&manager.list_cores()),
        Request::Get { name } => match manager.core(&name) {
            Some(info) => to_reply(&info),
            None => Reply::error(crate::manager::ManagerError::NotFound(name)),
        },
        Request::Add(spec) => match manager.add_core(spec) {
            Ok(()) => Reply::ok(None),
            Err(e) => Reply::error(e),
        },
        Request::Remove { name } => match manager.remove_core(&name) {
            Ok(()) => Reply::ok(None),
            Err(e) => Reply::error(e),
        },
        Request::Credentials => to_reply(&manager.credential_names()),
    }
}

fn to_reply<T: Serialize>(value: &T) -> Reply {
    match serde_json::to_value(value) {
        Ok(data) => Reply::ok(Some(data)),
        Err(e) => Reply::error(e),
    }
}

/// Serves broadcast messages to TCP subscribers.
#[derive(Debug, Clone)]
pub struct SubscriberServer {
    manager: Arc<CoreManager>,
    idle_timeout: Duration,
    buffer: usize,
    max_request_bytes: usize,
}

impl SubscriberServer {
    pub fn new(manager: Arc<CoreManager>) -> Self {
        Self {
            manager,
            idle_timeout: IDLE_TIMEOUT,
            buffer: DEFAULT_BUFFER,
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Messages buffered per subscriber before it is considered too slow.
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    /// Accept subscribers until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(address = %local, "Subscriber server listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    let server = self.clone();
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        server.handle_connection(socket, peer, cancel).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept subscriber");
                }
            }
        }

        tracing::info!("Subscriber server stopped");
        Ok(())
    }

    async fn handle_connection(self, socket: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let subscription = self.manager.subscribe(self.buffer);
        let id = subscription.id();
        tracing::info!(%peer, subscriber = %id, "Subscriber connected");

        let (read, write) = socket.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(write, subscription, reply_rx, cancel.clone()));
        self.read_loop(read, peer, reply_tx, &cancel).await;

        cancel.cancel();
        self.manager.broadcaster().unsubscribe(id);
        if let Err(e) = writer.await {
            tracing::error!(%peer, error = %e, "Subscriber writer panicked");
        }
        tracing::info!(%peer, subscriber = %id, "Subscriber disconnected");
    }

    async fn read_loop(
        &self,
        read: OwnedReadHalf,
        peer: SocketAddr,
        replies: mpsc::UnboundedSender<Reply>,
        cancel: &CancellationToken,
    ) {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        let limit = self.max_request_bytes as u64;

        loop {
            line.clear();
            let mut bounded = (&mut reader).take(limit);
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = tokio::time::timeout(self.idle_timeout, bounded.read_line(&mut line)) => read,
            };

            match read {
                Err(_) => {
                    tracing::info!(%peer, timeout = ?self.idle_timeout, "Subscriber idle, closing");
                    return;
                }
                Ok(Ok(0)) => return,
                Ok(Ok(n)) if n as u64 >= limit && !line.ends_with('\n') => {
                    tracing::warn!(%peer, limit, "Subscriber request too long, closing");
                    return;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "Subscriber read failed");
                    return;
                }
            }

            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            let reply = match serde_json::from_str::<Request>(text) {
                Ok(request) => {
                    tracing::debug!(%peer, ?request, "Control request");
                    handle_request(&self.manager, request)
                }
                Err(e) => Reply::error(format!("invalid request: {}", e)),
            };
            if replies.send(reply).is_err() {
                return;
            }
        }
    }
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut subscription: Subscription,
    mut replies: mpsc::UnboundedReceiver<Reply>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = replies.recv() => match reply {
                Some(reply) => serde_json::to_string(&reply),
                None => break,
            },
            message = subscription.recv() => match message {
                Some(message) => serde_json::to_string(&*message),
                // Evicted by the broadcaster.
                None => break,
            },
        };

        let mut line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode outgoing line");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = write.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "Subscriber write failed");
            break;
        }
    }

    // Wake the reader if we stopped first.
    cancel.cancel();
    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialStore};
    use poolwatch_client::ChannelConnector;
    use poolwatch_types::RawStatusSample;
    use serde_json::Value;

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(address: SocketAddr) -> Self {
            let (read, writer) = TcpStream::connect(address).await.unwrap().into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        /// Next line, or `None` at end of stream.
        async fn next(&mut self) -> Option<Value> {
            let mut line = String::new();
            let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a line")
                .unwrap();
            (n > 0).then(|| serde_json::from_str(&line).unwrap())
        }

        async fn next_reply(&mut self) -> Value {
            loop {
                let value = self.next().await.expect("connection closed");
                if value["type"] == "reply" {
                    return value;
                }
            }
        }
    }

    async fn start(
        idle_timeout: Duration,
    ) -> (Arc<CoreManager>, Arc<ChannelConnector>, SocketAddr, CancellationToken) {
        start_with(|server| server.idle_timeout(idle_timeout)).await
    }

    async fn start_with(
        configure: impl FnOnce(SubscriberServer) -> SubscriberServer,
    ) -> (Arc<CoreManager>, Arc<ChannelConnector>, SocketAddr, CancellationToken) {
        let connector = Arc::new(ChannelConnector::new());
        let credentials = CredentialStore::new([Credential::insecure("local")]);
        let manager = Arc::new(CoreManager::new(credentials, connector.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = configure(SubscriberServer::new(manager.clone()));
        tokio::spawn(server.serve(listener, shutdown.clone()));

        (manager, connector, address, shutdown)
    }

    #[test]
    fn test_parse_requests() {
        let add: Request = serde_json::from_str(
            r#"{"op":"add","name":"c","host":"h","port":1,"interval":"1s","credential":"local"}"#,
        )
        .unwrap();
        assert!(matches!(add, Request::Add(ref spec) if spec.name == "c" && spec.port == 1));

        let get: Request = serde_json::from_str(r#"{"op":"get","name":"c"}"#).unwrap();
        assert_eq!(get, Request::Get { name: "c".into() });

        assert!(serde_json::from_str::<Request>(r#"{"op":"explode"}"#).is_err());
    }

    #[test]
    fn test_reply_shape() {
        assert_eq!(Reply::ok(None).kind, "reply");
        assert_eq!(Reply::error("boom").kind, "reply");

        let ok = serde_json::to_value(Reply::ok(None)).unwrap();
        assert_eq!(ok, serde_json::json!({"type": "reply", "ok": true}));

        let err = serde_json::to_value(Reply::error("boom")).unwrap();
        assert_eq!(
            err,
            serde_json::json!({"type": "reply", "ok": false, "error": "boom"})
        );
    }

    #[tokio::test]
    async fn test_control_requests() {
        let (manager, _connector, address, shutdown) = start(IDLE_TIMEOUT).await;
        let mut client = Client::connect(address).await;

        client.send(r#"{"op":"ping"}"#).await;
        assert_eq!(client.next_reply().await["data"], "pong");

        client
            .send(r#"{"op":"add","name":"crawler","host":"127.0.0.1","port":7070,"interval":"1s","credential":"local"}"#)
            .await;
        assert_eq!(client.next_reply().await["ok"], true);
        assert!(manager.contains("crawler"));

        client.send(r#"{"op":"list"}"#).await;
        let reply = client.next_reply().await;
        assert_eq!(reply["data"][0]["name"], "crawler");
        assert_eq!(reply["data"][0]["port"], 7070);

        client.send(r#"{"op":"get","name":"crawler"}"#).await;
        assert_eq!(client.next_reply().await["data"]["interval"], "1s");

        client.send(r#"{"op":"credentials"}"#).await;
        assert_eq!(client.next_reply().await["data"], serde_json::json!(["local"]));

        client.send(r#"{"op":"remove","name":"ghost"}"#).await;
        let reply = client.next_reply().await;
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("ghost"));

        client.send("garbage").await;
        assert_eq!(client.next_reply().await["ok"], false);

        shutdown.cancel();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_without_name_is_rejected() {
        let (manager, connector, address, shutdown) = start(IDLE_TIMEOUT).await;
        let mut client = Client::connect(address).await;

        client
            .send(r#"{"op":"add","host":"127.0.0.1","port":7070,"interval":"1s","credential":"local"}"#)
            .await;
        let reply = client.next_reply().await;
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("name"));

        assert!(manager.list_cores().is_empty());
        assert_eq!(connector.attempts(), 0);

        shutdown.cancel();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_request_closes_connection() {
        let (manager, _connector, address, shutdown) =
            start_with(|server| server.max_request_bytes(64)).await;
        let mut client = Client::connect(address).await;

        client.send(r#"{"op":"ping"}"#).await;
        client.next_reply().await;
        assert_eq!(manager.broadcaster().subscriber_count(), 1);

        // No newline in sight: the server gives up instead of buffering.
        client.writer.write_all(&[b'x'; 256]).await.unwrap();
        let mut rest = String::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), client.reader.read_line(&mut rest))
            .await
            .expect("connection should be closed");
        // Unread input may turn the close into a reset.
        assert!(matches!(closed, Ok(0) | Err(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.broadcaster().subscriber_count(), 0);

        shutdown.cancel();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscriber_receives_metrics() {
        let (manager, connector, address, shutdown) = start(IDLE_TIMEOUT).await;
        let peer = connector.push_connection();
        let mut client = Client::connect(address).await;

        // The ping round trip guarantees the subscription exists.
        client.send(r#"{"op":"ping"}"#).await;
        client.next_reply().await;

        manager
            .add_core(CoreSpec::new("crawler", "127.0.0.1", 7070, "1s", "local"))
            .unwrap();
        let mut state = manager.watch_state("crawler").unwrap();
        state
            .wait_for(|s| *s == crate::supervisor::CoreState::Streaming)
            .await
            .unwrap();

        peer.send_status(RawStatusSample::builder().total_task(4).thread(true, 1).build());

        let message = client.next().await.unwrap();
        assert_eq!(message["name"], "crawler");
        assert_eq!(message["type"], "metrics");
        assert_eq!(message["data"]["total_task"], 4);
        assert_eq!(message["data"]["working"], 1);

        shutdown.cancel();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_subscriber_is_dropped() {
        let (manager, _connector, address, shutdown) = start(Duration::from_millis(200)).await;
        let mut client = Client::connect(address).await;

        client.send(r#"{"op":"ping"}"#).await;
        client.next_reply().await;
        assert_eq!(manager.broadcaster().subscriber_count(), 1);

        // No more traffic: the server closes the connection.
        assert!(client.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.broadcaster().subscriber_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let (manager, _connector, address, shutdown) = start(IDLE_TIMEOUT).await;
        let mut client = Client::connect(address).await;
        client.send(r#"{"op":"ping"}"#).await;
        client.next_reply().await;

        shutdown.cancel();
        assert!(client.next().await.is_none());
        manager.shutdown().await;
    }
}
