//! Duplex channel to the breath analysis service.
//!
//! The socket lives in a spawned link task; the [`SessionChannel`] handle talks
//! to it through a single-slot frame channel, an inbound event queue and a
//! one-shot shutdown signal. No reconnect is attempted here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::audio::WireFrame;
use crate::error::ChannelError;
use crate::protocol::{ControlMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_QUEUE: usize = 64;
/// Audio frames allowed to wait for the socket; a frame finding the slot taken is dropped.
const FRAMES_IN_FLIGHT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// One guided-breathing attempt, as announced to the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub target_breath_duration_seconds: f64,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        target_breath_duration_seconds: f64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            target_breath_duration_seconds,
        }
    }

    pub fn handshake(&self) -> ControlMessage {
        ControlMessage::Start {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            target_breath_duration: self.target_breath_duration_seconds,
        }
    }
}

/// Inbound events delivered to the channel owner.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// A breath event or a server-reported error. Unknown types never get here.
    Message(ServerMessage),
    /// The transport went away without us asking.
    Closed(ChannelError),
}

/// Shared between the handle and the link task. `sent` only counts frames
/// the socket accepted.
#[derive(Debug, Default)]
struct FrameCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

fn frame_slot() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(FRAMES_IN_FLIGHT)
}

pub struct SessionChannel {
    url: String,
    state: ConnectionState,
    frame_tx: Option<mpsc::Sender<Bytes>>,
    event_rx: Option<mpsc::Receiver<NetEvent>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    link: Option<JoinHandle<()>>,
    counters: Arc<FrameCounters>,
}

impl SessionChannel {
    /// `url` is the ws:// or wss:// endpoint of the analysis service.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: ConnectionState::Disconnected,
            frame_tx: None,
            event_rx: None,
            shutdown_tx: None,
            link: None,
            counters: Arc::new(FrameCounters::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Frames written to the socket.
    pub fn frames_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Frames dropped before reaching the socket, including any still pending at shutdown.
    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Open the transport and send the start handshake.
    ///
    /// No acknowledgement is awaited: once this returns `Ok`, frames flow.
    /// Calling it on a connected channel does nothing.
    pub async fn connect(&mut self, session: &Session) -> Result<(), ChannelError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        let url = Url::parse(&self.url).map_err(|e| ChannelError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidUrl(format!(
                "{}: expected ws:// or wss://",
                self.url
            )));
        }
        let hello = session
            .handshake()
            .to_json()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;

        self.state = ConnectionState::Connecting;
        log::info!("Connecting to {}...", self.url);

        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(ChannelError::Connect(e.to_string()));
            }
        };
        log::info!("Connected!");

        let (mut write, read) = ws_stream.split();

        // 发送 start 握手消息，不等待服务端确认
        log::debug!("Sending handshake: {}", hello);
        if let Err(e) = write.send(Message::Text(hello.into())).await {
            self.state = ConnectionState::Closed;
            return Err(ChannelError::Transport(e.to_string()));
        }

        let (frame_tx, frame_rx) = frame_slot();
        let (event_tx, event_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.link = Some(tokio::spawn(run_link(
            write,
            read,
            frame_rx,
            event_tx,
            shutdown_rx,
            self.counters.clone(),
        )));
        self.frame_tx = Some(frame_tx);
        self.event_rx = Some(event_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Hand one frame to the link task as a binary message.
    ///
    /// Dropped without error when the channel is not connected or a previous
    /// frame is still waiting for the socket. Returns whether the frame was
    /// accepted; it counts as sent once written.
    pub fn send_frame(&mut self, frame: &WireFrame) -> bool {
        let Some(frame_tx) = self
            .frame_tx
            .as_ref()
            .filter(|_| self.state == ConnectionState::Connected)
        else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match frame_tx.try_send(frame.to_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropping outbound frame: {}", e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Next inbound event. Pending forever while no link is open.
    pub async fn next_event(&mut self) -> NetEvent {
        let Some(event_rx) = self.event_rx.as_mut() else {
            return std::future::pending().await;
        };

        let event = event_rx
            .recv()
            .await
            .unwrap_or(NetEvent::Closed(ChannelError::Closed(None)));
        if matches!(event, NetEvent::Closed(_)) {
            self.mark_closed();
        }
        event
    }

    /// Send the stop message (best effort), close the transport and move to `Closed`.
    ///
    /// Does not wait; see [`SessionChannel::closed`]. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            log::info!("Disconnecting from {}", self.url);
            let _ = shutdown_tx.send(());
        }
        self.mark_closed();
    }

    /// Wait for the link task to finish flushing after [`SessionChannel::disconnect`].
    pub async fn closed(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.await;
        }
    }

    fn mark_closed(&mut self) {
        self.frame_tx = None;
        self.event_rx = None;
        self.shutdown_tx = None;
        self.state = ConnectionState::Closed;
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ======================== Link task ========================

async fn run_link(
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    mut frame_rx: mpsc::Receiver<Bytes>,
    event_tx: mpsc::Sender<NetEvent>,
    shutdown_rx: oneshot::Receiver<()>,
    counters: Arc<FrameCounters>,
) {
    let result = link_loop(write, read, &mut frame_rx, &event_tx, shutdown_rx, &counters).await;
    discard_pending(&mut frame_rx, &counters);

    match result {
        Ok(()) => log::info!("Channel closed"),
        Err(e) => {
            log::warn!("Channel failed: {}", e);
            let _ = event_tx.send(NetEvent::Closed(e)).await;
        }
    }
}

// 主循环，处理读取和写入
async fn link_loop(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
    frame_rx: &mut mpsc::Receiver<Bytes>,
    event_tx: &mpsc::Sender<NetEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    counters: &FrameCounters,
) -> Result<(), ChannelError> {
    loop {
        tokio::select! {
            biased;

            // Fires on disconnect() and when the handle is dropped
            _ = &mut shutdown_rx => {
                match ControlMessage::Stop.to_json() {
                    Ok(stop) => {
                        if let Err(e) = write.send(Message::Text(stop.into())).await {
                            log::debug!("Stop message not delivered: {}", e);
                        }
                    }
                    Err(e) => log::warn!("Failed to encode stop message: {}", e),
                }
                let _ = write.close().await;
                return Ok(());
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_text(&text, event_tx).await,
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary message from server", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return Err(ChannelError::Closed(frame.map(|f| f.reason.to_string())));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
                    None => return Err(ChannelError::Closed(None)),
                }
            }
            Some(data) = frame_rx.recv() => {
                write
                    .send(Message::Binary(data))
                    .await
                    .map_err(|e| ChannelError::Transport(e.to_string()))?;
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Close the frame slot and count whatever never reached the socket as dropped.
fn discard_pending(frame_rx: &mut mpsc::Receiver<Bytes>, counters: &FrameCounters) {
    frame_rx.close();
    let mut pending = 0;
    while frame_rx.try_recv().is_ok() {
        pending += 1;
    }
    if pending > 0 {
        log::debug!("Discarding {} unsent frame(s)", pending);
        counters.dropped.fetch_add(pending, Ordering::Relaxed);
    }
}

async fn dispatch_text(text: &str, event_tx: &mpsc::Sender<NetEvent>) {
    let msg = match ServerMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::debug!("{}; dropped: {}", e, text);
            return;
        }
    };

    match msg {
        ServerMessage::Unknown => {
            log::debug!("Unhandled message type: {}", text);
        }
        msg => {
            // Receiver gone means a disconnect is underway
            let _ = event_tx.send(NetEvent::Message(msg)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode_samples;

    #[test]
    fn handshake_carries_session_fields() {
        let session = Session::new("abc", "user-1", 5.0);
        assert_eq!(
            session.handshake(),
            ControlMessage::Start {
                session_id: "abc".into(),
                user_id: "user-1".into(),
                target_breath_duration: 5.0,
            }
        );
    }

    #[test]
    fn frames_are_dropped_while_disconnected() {
        let mut channel = SessionChannel::new("ws://127.0.0.1:1/ws");
        let frame = encode_samples(&[0.0; 16]);
        for _ in 0..10 {
            assert!(!channel.send_frame(&frame));
        }
        assert_eq!(channel.frames_sent(), 0);
        assert_eq!(channel.frames_dropped(), 10);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn outbound_slot_holds_one_frame() {
        let mut channel = SessionChannel::new("ws://127.0.0.1:1/ws");
        let (frame_tx, mut frame_rx) = frame_slot();
        channel.frame_tx = Some(frame_tx);
        channel.state = ConnectionState::Connected;

        let frame = encode_samples(&[0.25; 16]);
        assert!(channel.send_frame(&frame));
        // Slot taken: the newer frame goes, the pending one stays
        assert!(!channel.send_frame(&frame));
        assert_eq!(channel.frames_dropped(), 1);
        assert_eq!(channel.frames_sent(), 0);

        assert_eq!(frame_rx.try_recv().unwrap(), frame.to_bytes());
        assert!(channel.send_frame(&frame));
        assert_eq!(channel.frames_dropped(), 1);
    }

    #[test]
    fn pending_frames_count_as_dropped_at_shutdown() {
        let counters = FrameCounters::default();
        let (frame_tx, mut frame_rx) = frame_slot();
        frame_tx.try_send(Bytes::from_static(&[0, 0])).unwrap();

        discard_pending(&mut frame_rx, &counters);
        assert_eq!(counters.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(counters.sent.load(Ordering::Relaxed), 0);
        assert!(frame_tx.try_send(Bytes::new()).is_err());
    }

    #[test]
    fn disconnect_without_connect_is_harmless() {
        let mut channel = SessionChannel::new("ws://127.0.0.1:1/ws");
        channel.disconnect();
        channel.disconnect();
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let mut channel = SessionChannel::new("http://localhost/ws");
        let err = channel.connect(&Session::new("s", "u", 4.0)).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidUrl(_)));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut channel = SessionChannel::new(format!("ws://127.0.0.1:{}/ws", port));
        let err = channel.connect(&Session::new("s", "u", 4.0)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect(_)));
        assert_eq!(channel.state(), ConnectionState::Closed);
    }
}
