use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{AppError, WebSocketError};
use crate::websocket::{BroadcastRouter, Connection};
use crate::{AppState, Result};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Accepts WebSocket clients on one port and relays their frames.
pub struct RelayServer {
    listener: TcpListener,
    state: AppState,
}

impl RelayServer {
    /// Bind the configured address. Failing to bind is fatal for the process.
    pub async fn bind(state: AppState) -> Result<Self> {
        let addr = state.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| AppError::BindError { addr, source })?;

        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` resolves, then close every client and wait
    /// briefly for their tasks to finish.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, state } = self;
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tasks.spawn(handle_connection(state.clone(), stream, addr));
                    }
                    Err(e) => warn!(error = %e, "TCP accept error"),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        drop(listener);
        let closing = state.shutdown().await;
        info!(connections = closing, "Relay shutting down");

        let drained = timeout(state.config.relay.shutdown_grace(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Shutdown grace period elapsed, aborting connections");
            tasks.shutdown().await;
        }

        // Aborted connection tasks never reach their disconnect path.
        for conn in state.registry.drain().await {
            conn.begin_close();
            conn.mark_closed();
            warn!(conn = %conn.id(), peer = %conn.peer_addr(), "Released connection after forced shutdown");
        }

        Ok(())
    }

    pub async fn serve_until_ctrl_c(self) -> Result<()> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

/// Moves a connection to `Closed` when its task ends, including when the
/// task is aborted before it gets to run the disconnect path.
struct CloseGuard {
    conn: Arc<Connection>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.conn.begin_close();
        if self.conn.mark_closed() {
            let lifetime = chrono::Utc::now() - self.conn.connected_at();
            info!(
                conn = %self.conn.id(),
                peer = %self.conn.peer_addr(),
                client = self.conn.label().unwrap_or("-"),
                lifetime_ms = lifetime.num_milliseconds(),
                dropped = self.conn.dropped_count(),
                "Client disconnected"
            );
        }
    }
}

/// Run one client from handshake to `Closed`.
pub async fn handle_connection(state: AppState, raw_stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = raw_stream.set_nodelay(true) {
        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let relay = &state.config.relay;
    let mut label = None;
    let handshake = timeout(
        relay.handshake_timeout(),
        tokio_tungstenite::accept_hdr_async_with_config(
            raw_stream,
            |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                label = client_label(req.uri().query());
                Ok(resp)
            },
            Some(ws_config(relay)),
        ),
    );
    let ws_stream = match handshake.await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            let err = WebSocketError::Handshake(e.to_string());
            warn!(peer = %addr, error = %err, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(
                peer = %addr,
                timeout_secs = relay.handshake_timeout_secs,
                "WebSocket handshake timed out"
            );
            return;
        }
    };

    let (conn, rx) = Connection::new(addr, label, relay.outbound_capacity);
    let _guard = CloseGuard { conn: conn.clone() };
    let router = state.router.clone();
    state.registry.register(conn.clone()).await;

    info!(
        conn = %conn.id(),
        peer = %addr,
        client = conn.label().unwrap_or("-"),
        "Client connected"
    );

    let (ws_sink, ws_stream) = ws_stream.split();

    // Dropping the set aborts whatever is still running in it.
    let mut halves = JoinSet::new();
    halves.spawn(write_loop(ws_sink, rx, conn.clone(), relay.send_timeout()));
    let reader = halves.spawn(read_loop(
        ws_stream,
        conn.clone(),
        router.clone(),
        relay.clone(),
    ));

    // Whichever side finishes first decides why the connection ends.
    match halves.join_next().await {
        Some(Ok(Err(e))) => router.on_error(&conn, e).await,
        Some(Err(e)) => {
            error!(conn = %conn.id(), error = %e, "Connection task panicked");
            router.on_disconnect(&conn).await;
        }
        _ => router.on_disconnect(&conn).await,
    }

    reader.abort();
    // Let the writer send its close frame.
    let finished = timeout(relay.writer_drain(), async {
        while halves.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        debug!(conn = %conn.id(), "Writer did not finish in time, aborting it");
    }
}

async fn read_loop(
    mut ws_stream: WsStream,
    conn: Arc<Connection>,
    router: Arc<BroadcastRouter>,
    relay: RelayConfig,
) -> std::result::Result<(), WebSocketError> {
    let heartbeat = relay.heartbeat_interval();
    let mut ticker = tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                };
                last_seen = Instant::now();

                match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        router.on_message(&conn, msg).await;
                    }
                    Message::Close(frame) => {
                        debug!(conn = %conn.id(), ?frame, "Client initiated close");
                        return Ok(());
                    }
                    // Pongs to client pings are queued by tungstenite itself.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            _ = ticker.tick(), if heartbeat.is_some() => {
                if last_seen.elapsed() > relay.heartbeat_timeout() {
                    warn!(conn = %conn.id(), peer = %conn.peer_addr(), "Heartbeat timeout");
                    return Err(WebSocketError::Timeout);
                }
                if let Err(e) = conn.try_send(Message::Ping(Vec::new())) {
                    debug!(conn = %conn.id(), error = %e, "Failed to queue heartbeat ping");
                }
            }
        }
    }
}

async fn write_loop(
    mut ws_sink: WsSink,
    mut rx: mpsc::Receiver<Message>,
    conn: Arc<Connection>,
    send_timeout: Duration,
) -> std::result::Result<(), WebSocketError> {
    let result: std::result::Result<(), WebSocketError> = async {
        let closing = conn.closing();
        tokio::pin!(closing);

        loop {
            tokio::select! {
                biased;
                _ = &mut closing => return Ok(()),
                next = rx.recv() => match next {
                    Some(msg) => timeout(send_timeout, ws_sink.send(msg))
                        .await
                        .map_err(|_| WebSocketError::Timeout)??,
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    if let Ok(Err(e)) = timeout(send_timeout, ws_sink.send(close)).await {
        debug!(conn = %conn.id(), error = %e, "Close frame not sent");
    }
    let _ = timeout(send_timeout, ws_sink.close()).await;

    result
}

fn ws_config(relay: &RelayConfig) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(relay.max_message_size);
    config.max_frame_size = Some(relay.max_message_size);
    config
}

/// `type` query parameter of the upgrade request, e.g. `/?type=python`.
fn client_label(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "type")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::test_addr;
    use crate::Settings;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn socket_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let server = WebSocketStream::from_raw_socket(accepted.unwrap().0, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client.unwrap(), Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn test_client_label() {
        assert_eq!(client_label(Some("type=python")), Some("python".to_string()));
        assert_eq!(client_label(Some("a=1&type=viewer")), Some("viewer".to_string()));
        assert_eq!(client_label(Some("type=")), None);
        assert_eq!(client_label(Some("kind=phone")), None);
        assert_eq!(client_label(None), None);
    }

    #[test]
    fn test_ws_config_limits() {
        let settings = Settings::new_for_test().unwrap();
        let config = ws_config(&settings.relay);
        assert_eq!(config.max_message_size, Some(settings.relay.max_message_size));
    }

    #[tokio::test]
    async fn test_writer_drains_queue_until_closing() {
        let (server, mut client) = socket_pair().await;
        let (sink, _stream) = server.split();
        let (conn, rx) = Connection::new(test_addr(), None, 8);

        conn.try_send(Message::Text("one".into())).unwrap();
        conn.try_send(Message::Text("two".into())).unwrap();
        let writer = tokio::spawn(write_loop(sink, rx, conn.clone(), Duration::from_secs(1)));

        assert_eq!(client.next().await.unwrap().unwrap(), Message::Text("one".into()));
        assert_eq!(client.next().await.unwrap().unwrap(), Message::Text("two".into()));

        // An idle queue keeps the writer waiting rather than finishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        conn.try_send(Message::Binary(vec![3])).unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Message::Binary(vec![3]));

        conn.begin_close();
        let result = timeout(Duration::from_secs(2), writer).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(matches!(client.next().await.unwrap().unwrap(), Message::Close(_)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = Settings::new_for_test().unwrap();
        settings.server.port = taken.local_addr().unwrap().port();

        let result = RelayServer::bind(AppState::new(settings)).await;
        assert!(matches!(result, Err(AppError::BindError { .. })));
    }

    #[test_log::test(tokio::test)]
    async fn test_heartbeat_times_out_silent_client() {
        let mut settings = Settings::new_for_test().unwrap();
        settings.relay.heartbeat_interval_secs = 1;
        settings.relay.heartbeat_timeout_secs = 2;

        let server = RelayServer::bind(AppState::new(settings)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state().clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_until(async move {
            let _ = stop_rx.await;
        }));

        // Connect, then never read: tungstenite cannot answer pings on our behalf.
        let (_ws, _) = connect_async(format!("ws://{}/?type=sensor", addr)).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while state.registry.len().await != 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.registry.len().await, 1);

        let deadline = Instant::now() + Duration::from_secs(6);
        while !state.registry.is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(state.registry.is_empty().await);

        let _ = stop_tx.send(());
        handle.await.unwrap().unwrap();
    }
}
