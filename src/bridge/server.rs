//! WebSocket control server
//!
//! Every accepted socket gets its own [`ClientSession`]. Outbound frames
//! funnel through one sender task so a stalled client cannot block the
//! session that produces them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::protocol::ClientSink;
use crate::session::ClientSession;
use crate::state::AppState;

/// A client that cannot take a frame within this window is dropped
const SEND_TIMEOUT_SECS: u64 = 5;

pub struct ControlServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl ControlServer {
    pub async fn bind(addr: &str, state: Arc<AppState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Control server listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the listener fails
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;

            // Status lines are small and latency matters more than batching
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
            info!("WebSocket connection from {}", addr);

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    error!("WebSocket connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<(), String> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (sink, mut outbound) = ClientSink::channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

    let session = ClientSession::new(state, sink);
    let id = session.id().to_string();

    // Task: frame sender
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            match tokio::time::timeout(
                Duration::from_secs(SEND_TIMEOUT_SECS),
                ws_sender.send(Message::Text(msg.to_frame())),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!("WebSocket send failed: {:?}", e);
                    break;
                }
                Err(_) => {
                    warn!("WebSocket send timeout after 5s - client unresponsive, disconnecting");
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
        debug!("Frame sender stopped");
    });

    let session_task = tokio::spawn(session.run(inbound_rx));

    while let Some(msg) = ws_receiver.next().await {
        let forwarded = match msg {
            Ok(Message::Text(text)) => inbound_tx.send(text),
            Ok(Message::Binary(data)) => {
                inbound_tx.send(String::from_utf8_lossy(&data).into_owned())
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket close message received for session {}", id);
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Ok(()),
            Err(e) => {
                warn!("WebSocket receive error: {} for session {}", e, id);
                break;
            }
        };
        if forwarded.is_err() {
            debug!("Session {} stopped accepting frames", id);
            break;
        }
    }

    // Ends the session loop, which cancels any pending prompt
    drop(inbound_tx);
    if let Err(e) = session_task.await {
        error!("Session {} task failed: {}", id, e);
    }
    sender_task.abort();

    info!("WebSocket client disconnected, session {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::ssh::mock::{MockConnector, MockRemote};
    use tokio_tungstenite::connect_async;

    async fn start_server() -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            progress_interval_secs: 0,
            ..Settings::default()
        };
        let state = Arc::new(AppState::with_connector(
            settings,
            dir.path().to_path_buf(),
            Arc::new(MockConnector::new(MockRemote::new())),
        ));
        let server = ControlServer::bind("127.0.0.1:0", state).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        (addr, dir)
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("receive error");
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_websocket() {
        let (addr, _dir) = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        ws.send(Message::Text(r#"{"type":"hello"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "Unknown message type: hello");

        ws.send(Message::Text(r#"{"type":"command","command":"run"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut ws).await,
            "SSH configuration missing. Please run an export first."
        );
    }

    #[tokio::test]
    async fn test_clients_have_independent_sessions() {
        let (addr, _dir) = start_server().await;
        let (mut first, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let (mut second, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        first
            .send(Message::Text(
                r#"{"type":"command","command":"clean","user":"alice","host":"hpc","remoteDir":"/scratch/job1"}"#
                    .into(),
            ))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut first).await,
            "Executing command: cd /scratch/job1 && ./Allclean"
        );

        second
            .send(Message::Text(r#"{"type":"command","command":"clean"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut second).await,
            "SSH configuration missing. Please run an export first."
        );

        first.close(None).await.unwrap();
    }
}
