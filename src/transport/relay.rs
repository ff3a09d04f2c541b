//! WebSocket driver for the relay connection.
//!
//! `RelayClient` runs as its own tokio task. It executes the actions the
//! `ConnectionManager` asks for, answers nothing itself, and forwards every
//! parsed frame except liveness pongs to the application over a channel.

use crate::transport::connection::{
    ConnectionAction, ConnectionManager, ConnectionState, ConnectionTimings,
};
use crate::transport::protocol::{ClientFrame, ServerFrame};
use crate::utils::{NetworkError, RelayConfig, Result};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream>> + Send>>;

/// Everything the relay task reports upward
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A parsed frame from the relay
    Frame(ServerFrame),
    /// Connection state changed
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone, Copy)]
enum RelayControl {
    Reconnect,
    Shutdown,
}

/// Cloneable handle for talking to the relay task
#[derive(Debug, Clone)]
pub struct RelayHandle {
    frames: mpsc::UnboundedSender<ClientFrame>,
    control: mpsc::UnboundedSender<RelayControl>,
}

impl RelayHandle {
    /// Queue a frame for transmission
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        self.frames
            .send(frame)
            .map_err(|_| NetworkError::ChannelClosed.into())
    }

    /// Reset the attempt budget and reconnect after the cool-off
    pub fn reconnect(&self) -> Result<()> {
        self.control
            .send(RelayControl::Reconnect)
            .map_err(|_| NetworkError::ChannelClosed.into())
    }

    /// Close the transport and stop the task
    pub fn shutdown(&self) {
        let _ = self.control.send(RelayControl::Shutdown);
    }
}

/// Relay connection task
pub struct RelayClient {
    url: String,
    manager: ConnectionManager,
    connect_timeout: Duration,
    connecting: Option<ConnectFuture>,
    socket: Option<WsStream>,
    pending: VecDeque<ClientFrame>,
    max_pending: usize,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    control: mpsc::UnboundedReceiver<RelayControl>,
    events: mpsc::UnboundedSender<RelayEvent>,
    reported_state: ConnectionState,
}

impl RelayClient {
    /// Spawn the relay task; it starts connecting immediately
    pub fn spawn(
        config: &RelayConfig,
    ) -> (RelayHandle, mpsc::UnboundedReceiver<RelayEvent>, JoinHandle<()>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self {
            url: config.url.clone(),
            manager: ConnectionManager::new(ConnectionTimings::from(config)),
            connect_timeout: config.liveness_timeout(),
            connecting: None,
            socket: None,
            pending: VecDeque::new(),
            max_pending: config.max_pending_frames,
            outbound: frame_rx,
            control: control_rx,
            events: event_tx,
            reported_state: ConnectionState::Disconnected,
        };

        let task = tokio::spawn(client.run());
        let handle = RelayHandle {
            frames: frame_tx,
            control: control_tx,
        };
        (handle, event_rx, task)
    }

    async fn run(mut self) {
        log::info!("Connecting to relay {}", self.url);
        let actions = self.manager.connect(Instant::now());
        self.apply(actions).await;
        self.publish_state();

        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                opened = pending_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(opened).await;
                }
                message = next_message(&mut self.socket) => {
                    self.handle_socket_message(message).await;
                }
                frame = self.outbound.recv() => match frame {
                    Some(frame) => self.send_or_queue(frame).await,
                    None => break,
                },
                control = self.control.recv() => match control {
                    Some(RelayControl::Reconnect) => {
                        log::info!("Manual reconnect requested");
                        let actions = self.manager.reconnect(Instant::now());
                        self.apply(actions).await;
                    }
                    Some(RelayControl::Shutdown) | None => break,
                },
                () = sleep_until(deadline) => {
                    let actions = self.manager.poll(Instant::now());
                    self.apply(actions).await;
                }
            }
            self.publish_state();
        }

        let actions = self.manager.shutdown();
        self.apply(actions).await;
        self.publish_state();
        log::info!("Relay task stopped");
    }

    async fn apply(&mut self, actions: Vec<ConnectionAction>) {
        let mut queue: VecDeque<ConnectionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                ConnectionAction::OpenTransport => {
                    self.connecting = Some(Box::pin(open(self.url.clone(), self.connect_timeout)));
                }
                ConnectionAction::SendProbe => {
                    if let Err(e) = self.write(&ClientFrame::Ping).await {
                        log::warn!("Liveness probe failed: {e}");
                        queue.extend(self.transport_lost());
                    }
                }
                ConnectionAction::CloseTransport => {
                    self.connecting = None;
                    if let Some(mut socket) = self.socket.take() {
                        let _ = socket.close(None).await;
                    }
                }
            }
        }
    }

    async fn on_connect_result(&mut self, opened: Result<WsStream>) {
        let actions = match opened {
            Ok(socket) => {
                self.socket = Some(socket);
                self.manager.on_transport_open(Instant::now())
            }
            Err(e) => {
                if e.is_recoverable() {
                    log::warn!("Relay connection failed, backing off: {e}");
                } else {
                    log::error!("Relay connection failed: {e}");
                }
                self.manager.on_transport_closed(Instant::now())
            }
        };
        self.apply(actions).await;
    }

    fn transport_lost(&mut self) -> Vec<ConnectionAction> {
        self.socket = None;
        self.manager.on_transport_closed(Instant::now())
    }

    async fn handle_socket_message(
        &mut self,
        message: Option<std::result::Result<Message, tungstenite::Error>>,
    ) {
        match message {
            Some(Ok(Message::Text(text))) => match ServerFrame::from_json(&text) {
                Ok(ServerFrame::Pong) => {
                    let was_live = self.manager.is_live();
                    self.manager.on_pong(Instant::now());
                    if !was_live && self.manager.is_live() {
                        self.flush_pending().await;
                    }
                }
                Ok(frame) => {
                    log::debug!(
                        "<- {} ({})",
                        frame.frame_type(),
                        frame.session_id().unwrap_or("-")
                    );
                    let _ = self.events.send(RelayEvent::Frame(frame));
                }
                Err(e) => log::warn!("Ignoring relay frame: {e}"),
            },
            Some(Ok(Message::Binary(_))) => log::warn!("Ignoring binary relay frame"),
            Some(Ok(Message::Close(reason))) => {
                log::info!("Relay closed the connection: {reason:?}");
                let actions = self.transport_lost();
                self.apply(actions).await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("Relay socket error: {e}");
                let actions = self.transport_lost();
                self.apply(actions).await;
            }
            None => {
                log::info!("Relay stream ended");
                let actions = self.transport_lost();
                self.apply(actions).await;
            }
        }
    }

    async fn send_or_queue(&mut self, frame: ClientFrame) {
        if self.manager.is_live() {
            if let Err(e) = self.write(&frame).await {
                log::warn!("Send failed, queueing {}: {e}", frame.frame_type());
                self.enqueue(frame);
                let actions = self.transport_lost();
                self.apply(actions).await;
            }
        } else {
            self.enqueue(frame);
        }
    }

    fn enqueue(&mut self, frame: ClientFrame) {
        if self.max_pending == 0 {
            log::warn!("Not connected, dropping {}", frame.frame_type());
            return;
        }
        if self.pending.len() >= self.max_pending {
            if let Some(dropped) = self.pending.pop_front() {
                log::warn!("Pending queue full, dropping oldest {}", dropped.frame_type());
            }
        }
        self.pending.push_back(frame);
    }

    async fn flush_pending(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            if let Err(e) = self.write(&frame).await {
                log::warn!("Flush interrupted: {e}");
                self.pending.push_front(frame);
                let actions = self.transport_lost();
                self.apply(actions).await;
                return;
            }
        }
    }

    async fn write(&mut self, frame: &ClientFrame) -> Result<()> {
        let socket = self.socket.as_mut().ok_or_else(|| NetworkError::Transport {
            reason: "no open transport".to_string(),
        })?;
        log::debug!("-> {}", frame.frame_type());
        socket.send(Message::Text(frame.to_json()?)).await?;
        Ok(())
    }

    fn publish_state(&mut self) {
        let state = self.manager.state();
        if state != self.reported_state {
            self.reported_state = state;
            let _ = self.events.send(RelayEvent::StateChanged(state));
        }
    }
}

async fn open(url: String, timeout: Duration) -> Result<WsStream> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(NetworkError::ConnectionFailed {
            url,
            reason: e.to_string(),
        }
        .into()),
        Err(_) => Err(NetworkError::Timeout {
            operation: format!("connect to {url}"),
        }
        .into()),
    }
}

async fn pending_connect(connecting: &mut Option<ConnectFuture>) -> Result<WsStream> {
    match connecting {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    socket: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_relay_reports_disconnect() {
        let config = RelayConfig {
            url: "ws://127.0.0.1:9".to_string(),
            ..RelayConfig::default()
        };
        let (handle, mut events, task) = RelayClient::spawn(&config);

        let first = events.recv().await.unwrap();
        assert_eq!(first, RelayEvent::StateChanged(ConnectionState::Connecting));
        let second = events.recv().await.unwrap();
        assert_eq!(second, RelayEvent::StateChanged(ConnectionState::Disconnected));
        handle.send(ClientFrame::Ping).unwrap();

        handle.shutdown();
        task.await.unwrap();
        assert!(handle.send(ClientFrame::Ping).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_handshake() {
        // accepts TCP but never answers the upgrade request
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(120)).await;
        });

        let config = RelayConfig {
            url: format!("ws://{addr}"),
            liveness_timeout_secs: 120,
            ..RelayConfig::default()
        };
        let (handle, mut events, task) = RelayClient::spawn(&config);
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::StateChanged(ConnectionState::Connecting)
        );

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("relay task ignored shutdown while connecting")
            .unwrap();
        server.abort();
    }
}
