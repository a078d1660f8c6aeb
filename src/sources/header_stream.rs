//! `newHeads` WebSocket subscription
//!
//! Connecting -> Subscribed -> Streaming, reconnecting with exponential
//! backoff on any disconnect until shutdown. A rejected subscription or a
//! socket silent past the idle timeout counts as a disconnect; the backoff
//! starts over once a session delivers a header. Headers go into a bounded queue;
//! when the queue stays full past the enqueue timeout the header is dropped
//! and logged so a slow consumer cannot grow memory without bound.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::LiveConfig;
use crate::models::BlockHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Connecting,
    Subscribed,
    Streaming,
    Stopped,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Subscribed,
            2 => Self::Streaming,
            3 => Self::Stopped,
            _ => Self::Connecting,
        }
    }
}

/// Lock-free counters shared with the status endpoint.
#[derive(Debug, Default)]
pub struct StreamStats {
    state: AtomicU8,
    pub headers_received: AtomicU64,
    pub headers_enqueued: AtomicU64,
    pub headers_dropped: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub reconnects: AtomicU64,
}

impl StreamStats {
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Server message as seen by the stream.
#[derive(Debug, PartialEq)]
enum Incoming {
    SubscriptionAck(String),
    Rejected(String),
    Header(BlockHeader),
    Malformed(String),
    Other,
}

fn classify(text: &str) -> Incoming {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Incoming::Malformed(e.to_string()),
    };

    if value.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        let header = &value["params"]["result"];
        return match BlockHeader::from_json(header) {
            Ok(h) => Incoming::Header(h),
            Err(e) => Incoming::Malformed(e.to_string()),
        };
    }

    if let Some(err) = value.get("error") {
        return Incoming::Rejected(err.to_string());
    }
    if let Some(id) = value.get("result").and_then(Value::as_str) {
        return Incoming::SubscriptionAck(id.to_string());
    }
    Incoming::Other
}

enum SessionEnd {
    /// Server closed, rejected the subscription or went silent; reconnect.
    Disconnected(&'static str),
    /// Shutdown requested or the consumer went away.
    Stop,
}

pub struct HeaderStream {
    url: String,
    config: LiveConfig,
    tx: mpsc::Sender<BlockHeader>,
    stats: Arc<StreamStats>,
}

impl HeaderStream {
    pub fn new(url: &str, config: LiveConfig, tx: mpsc::Sender<BlockHeader>) -> Self {
        Self {
            url: url.to_string(),
            config,
            tx,
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Run until shutdown is signalled or the consumer side of the queue closes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut delay = self.config.reconnect_initial_delay;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.stats.set_state(StreamState::Connecting);

            let mut delivered = false;
            match self.connect_and_stream(&mut shutdown, &mut delivered).await {
                Ok(SessionEnd::Stop) => break,
                Ok(SessionEnd::Disconnected(reason)) => {
                    warn!(reason, "Header stream disconnected");
                }
                Err(e) => {
                    error!(error = %e, "Header stream error");
                }
            }
            if delivered {
                delay = self.config.reconnect_initial_delay;
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!("Reconnecting header stream in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
            delay = next_delay(delay, self.config.reconnect_max_delay);
        }

        self.stats.set_state(StreamState::Stopped);
        info!("Header stream stopped");
    }

    /// `delivered` is set once the session has received a header.
    async fn connect_and_stream(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        delivered: &mut bool,
    ) -> Result<SessionEnd> {
        info!("Connecting to execution WebSocket");
        let (ws, response) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to execution WebSocket")?;
        debug!(status = %response.status(), "WebSocket connected");

        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("Failed to send eth_subscribe")?;

        let idle_timeout = self.config.stream_idle_timeout;
        let idle = sleep(idle_timeout);
        tokio::pin!(idle);

        let mut ping = interval(self.config.stream_ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = ping.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("Failed to send keepalive ping")?;
                    continue;
                }
                _ = &mut idle => {
                    warn!(timeout = ?idle_timeout, "No traffic on header stream");
                    return Ok(SessionEnd::Disconnected("idle timeout"));
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Stop);
                    }
                    continue;
                }
            };
            idle.as_mut().reset(Instant::now() + idle_timeout);

            match msg {
                Some(Ok(Message::Text(text))) => match classify(&text) {
                    Incoming::SubscriptionAck(id) => {
                        self.stats.set_state(StreamState::Subscribed);
                        info!(subscription = %id, "Subscribed to newHeads");
                        self.stats.set_state(StreamState::Streaming);
                    }
                    Incoming::Rejected(reason) => {
                        error!(reason = %reason, "newHeads subscription rejected");
                        return Ok(SessionEnd::Disconnected("subscribe rejected"));
                    }
                    Incoming::Header(header) => {
                        *delivered = true;
                        self.stats.headers_received.fetch_add(1, Ordering::Relaxed);
                        if !self.enqueue(header).await {
                            return Ok(SessionEnd::Stop);
                        }
                    }
                    Incoming::Malformed(reason) => {
                        self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                        warn!(reason = %reason, "Skipping malformed stream message");
                    }
                    Incoming::Other => {}
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed header stream");
                    return Ok(SessionEnd::Disconnected("server close"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::Disconnected("stream ended")),
            }
        }
    }

    /// Returns false once the consumer is gone.
    async fn enqueue(&self, header: BlockHeader) -> bool {
        let number = header.number;
        match self.tx.send_timeout(header, self.config.enqueue_timeout).await {
            Ok(()) => {
                self.stats.headers_enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(block = number, "Header enqueued");
                true
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.stats.headers_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(block = number, "Header queue full, dropping header");
                true
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                info!("Header consumer closed, stopping stream");
                false
            }
        }
    }
}

#[inline]
fn next_delay(current: Duration, cap: Duration) -> Duration {
    current.saturating_mul(2).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::WebSocketStream;

    type ServerWs = WebSocketStream<TcpStream>;

    const ACK: &str = r#"{"jsonrpc":"2.0","id":1,"result":"0xsub"}"#;

    /// Accept connections forever, handing each one and its index to `session`.
    async fn serve<F, Fut>(session: F) -> String
    where
        F: Fn(usize, ServerWs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut index = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let sub = ws.next().await.unwrap().unwrap();
                assert!(sub.to_text().unwrap().contains("newHeads"));
                tokio::spawn(session(index, ws));
                index += 1;
            }
        });
        format!("ws://{}", addr)
    }

    /// Drain the socket until the client leaves.
    async fn hold_open(mut ws: ServerWs) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    fn fast_reconnect() -> LiveConfig {
        LiveConfig {
            reconnect_initial_delay: Duration::from_millis(20),
            reconnect_max_delay: Duration::from_secs(1),
            ..LiveConfig::default()
        }
    }

    async fn next_number(rx: &mut mpsc::Receiver<BlockHeader>) -> Option<u64> {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("header within 5s")
            .map(|h| h.number)
    }

    fn notification(number: u64) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0xsub",
                "result": {
                    "number": format!("0x{:x}", number),
                    "hash": format!("0xh{}", number),
                    "parentHash": "0xp",
                    "miner": "0x1111111111111111111111111111111111111111",
                    "timestamp": "0x65a0f000"
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            classify(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#),
            Incoming::SubscriptionAck("0xabc".into())
        );
        match classify(&notification(17)) {
            Incoming::Header(h) => assert_eq!(h.number, 17),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(classify("not json"), Incoming::Malformed(_)));
        assert!(matches!(
            classify(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no subs"}}"#),
            Incoming::Rejected(_)
        ));
        assert!(matches!(
            classify(r#"{"method":"eth_subscription","params":{"result":{"hash":"0x1"}}}"#),
            Incoming::Malformed(_)
        ));
    }

    #[test]
    fn test_reconnect_backoff_caps() {
        let cap = Duration::from_secs(60);
        let mut d = Duration::from_secs(1);
        let mut secs = Vec::new();
        for _ in 0..8 {
            secs.push(d.as_secs());
            d = next_delay(d, cap);
        }
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn test_stream_subscribes_and_enqueues_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let sub = ws.next().await.unwrap().unwrap();
            assert!(sub.to_text().unwrap().contains("newHeads"));
            ws.send(Message::Text(r#"{"jsonrpc":"2.0","id":1,"result":"0xsub"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text("garbage".into())).await.unwrap();
            ws.send(Message::Text(notification(100))).await.unwrap();
            ws.send(Message::Text(notification(101))).await.unwrap();
            // hold the connection open until the client leaves
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (tx, mut rx) = mpsc::channel(8);
        let stream = HeaderStream::new(&format!("ws://{}", addr), LiveConfig::default(), tx);
        let stats = stream.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { stream.run(shutdown_rx).await });

        assert_eq!(rx.recv().await.map(|h| h.number), Some(100));
        assert_eq!(rx.recv().await.map(|h| h.number), Some(101));
        assert_eq!(stats.state(), StreamState::Streaming);
        assert_eq!(stats.malformed_messages.load(Ordering::Relaxed), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(stats.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_full_queue_drops_header() {
        let (tx, _rx) = mpsc::channel(1);
        let config = LiveConfig {
            enqueue_timeout: Duration::from_millis(10),
            ..LiveConfig::default()
        };
        let stream = HeaderStream::new("ws://unused", config, tx);
        let header = BlockHeader {
            number: 1,
            hash: "0x1".into(),
            parent_hash: "0x0".into(),
            miner: None,
            timestamp: 0,
        };
        assert!(stream.enqueue(header.clone()).await);
        assert!(stream.enqueue(header).await);
        assert_eq!(stream.stats.headers_enqueued.load(Ordering::Relaxed), 1);
        assert_eq!(stream.stats.headers_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stream_reconnects_after_server_close() {
        let url = serve(|index, mut ws| async move {
            ws.send(Message::Text(ACK.into())).await.unwrap();
            ws.send(Message::Text(notification(100 + index as u64))).await.unwrap();
            if index == 0 {
                let _ = ws.close(None).await;
            } else {
                hold_open(ws).await;
            }
        })
        .await;

        let (tx, mut rx) = mpsc::channel(8);
        let stream = HeaderStream::new(&url, fast_reconnect(), tx);
        let stats = stream.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { stream.run(shutdown_rx).await });

        assert_eq!(next_number(&mut rx).await, Some(100));
        assert_eq!(next_number(&mut rx).await, Some(101));
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(stats.state(), StreamState::Streaming);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_subscription_reconnects() {
        let url = serve(|index, mut ws| async move {
            if index == 0 {
                let rejected =
                    r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no subs"}}"#;
                ws.send(Message::Text(rejected.into())).await.unwrap();
            } else {
                ws.send(Message::Text(ACK.into())).await.unwrap();
                ws.send(Message::Text(notification(7))).await.unwrap();
            }
            hold_open(ws).await;
        })
        .await;

        let (tx, mut rx) = mpsc::channel(8);
        let stream = HeaderStream::new(&url, fast_reconnect(), tx);
        let stats = stream.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { stream.run(shutdown_rx).await });

        assert_eq!(next_number(&mut rx).await, Some(7));
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(stats.malformed_messages.load(Ordering::Relaxed), 0);
        assert_eq!(stats.state(), StreamState::Streaming);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_socket_hits_idle_timeout() {
        let url = serve(|index, mut ws| async move {
            ws.send(Message::Text(ACK.into())).await.unwrap();
            ws.send(Message::Text(notification(index as u64 + 1))).await.unwrap();
            if index == 0 {
                // keep the socket open but never read or write again
                sleep(Duration::from_secs(30)).await;
                drop(ws);
            } else {
                hold_open(ws).await;
            }
        })
        .await;

        let config = LiveConfig {
            stream_idle_timeout: Duration::from_millis(200),
            ..fast_reconnect()
        };
        let (tx, mut rx) = mpsc::channel(8);
        let stream = HeaderStream::new(&url, config, tx);
        let stats = stream.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { stream.run(shutdown_rx).await });

        assert_eq!(next_number(&mut rx).await, Some(1));
        assert_eq!(next_number(&mut rx).await, Some(2));
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_backoff_grows_when_sessions_deliver_nothing() {
        let url = serve(|_, mut ws| async move {
            ws.send(Message::Text(ACK.into())).await.unwrap();
            let _ = ws.close(None).await;
        })
        .await;

        let (tx, _rx) = mpsc::channel(8);
        let stream = HeaderStream::new(&url, fast_reconnect(), tx);
        let stats = stream.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { stream.run(shutdown_rx).await });

        // 20ms, 40ms, 80ms, 160ms: at most five sessions fit in 400ms,
        // where a fixed 20ms delay would allow about twenty
        sleep(Duration::from_millis(400)).await;
        let reconnects = stats.reconnects.load(Ordering::Relaxed);
        assert!((2..=6).contains(&reconnects), "reconnects = {}", reconnects);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
