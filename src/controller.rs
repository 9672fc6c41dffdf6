use std::time::Duration;

use crate::audio::{encode, AudioCapture, AudioFrame, FrameStream};
use crate::error::SessionError;
use crate::net_link::{ConnectionState, NetEvent, Session, SessionChannel};
use crate::protocol::{BreathEvent, BreathPhase, ServerMessage};
use crate::state_machine::{BreathStateMachine, CalibrationState};

/// How long [`SessionController::wait_closed`] waits for the stop message to flush.
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Callbacks supplied by the host. All run on the task driving the controller.
pub trait SessionObserver {
    fn on_breath_event(&mut self, _event: &BreathEvent) {}
    /// Fires once per session, when calibration completes.
    fn on_calibrated(&mut self) {}
    /// Fatal errors arrive at most once per session; server-reported ones may repeat.
    fn on_error(&mut self, _error: &SessionError) {}
    fn on_connection_state(&mut self, _state: ConnectionState) {}
}

impl SessionObserver for () {}

enum Step {
    Frame(Option<AudioFrame>),
    Net(NetEvent),
}

/// Drives one guided-breathing session: capture → encode → channel, and
/// channel events → state machine → observer.
pub struct SessionController<O: SessionObserver> {
    session: Session,
    channel: SessionChannel,
    capture: AudioCapture,
    frames: Option<FrameStream>,
    machine: BreathStateMachine,
    observer: O,
    fatal_reported: bool,
}

impl<O: SessionObserver> SessionController<O> {
    pub fn new(session: Session, channel: SessionChannel, capture: AudioCapture, observer: O) -> Self {
        Self {
            session,
            channel,
            capture,
            frames: None,
            machine: BreathStateMachine::new(),
            observer,
            fatal_reported: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    // ---- read-only state ----

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn is_calibrating(&self) -> bool {
        self.machine.is_calibrating()
    }

    pub fn breath_count(&self) -> u32 {
        self.machine.breath_count()
    }

    pub fn current_phase(&self) -> BreathPhase {
        self.machine.current_phase()
    }

    pub fn confidence(&self) -> f64 {
        self.machine.confidence()
    }

    pub fn calibration(&self) -> CalibrationState {
        self.machine.calibration()
    }

    pub fn frames_sent(&self) -> u64 {
        self.channel.frames_sent()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.channel.frames_dropped() + self.capture.dropped_frames()
    }

    // ---- lifecycle ----

    /// Open the channel and send the handshake. No-op when already connected.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.channel.is_connected() {
            return Ok(());
        }
        self.fatal_reported = false;
        self.observer.on_connection_state(ConnectionState::Connecting);

        match self.channel.connect(&self.session).await {
            Ok(()) => {
                log::info!(
                    "Session {} started for user {} (target {}s)",
                    self.session.session_id,
                    self.session.user_id,
                    self.session.target_breath_duration_seconds
                );
                self.observer.on_connection_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.observer.on_connection_state(ConnectionState::Closed);
                let err = SessionError::Channel(e);
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Acquire the microphone. No-op when already capturing.
    ///
    /// Starting before `connect()` is allowed; frames are dropped until the
    /// channel is connected.
    pub async fn start_audio_capture(&mut self) -> Result<(), SessionError> {
        if self.capture.is_running() {
            return Ok(());
        }
        if !self.channel.is_connected() {
            log::warn!("Capture started before the channel is connected, frames will be dropped");
        }

        match self.capture.start().await {
            Ok(frames) => {
                self.frames = Some(frames);
                Ok(())
            }
            Err(e) => {
                let err = SessionError::Capture(e);
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Release the microphone and drop the frame pipeline. Safe to call repeatedly.
    pub fn stop_audio_capture(&mut self) {
        if let Err(e) = self.capture.stop() {
            log::warn!("Capture ended with error: {}", e);
        }
        self.frames = None;
    }

    /// Tear the session down: stop capture, drop the frame pipeline, close the
    /// channel. Every step runs regardless of what already happened.
    pub fn disconnect(&mut self) {
        self.stop_audio_capture();
        let was_connected = self.channel.is_connected();
        self.channel.disconnect();
        if was_connected {
            self.observer.on_connection_state(ConnectionState::Closed);
        }
    }

    /// After [`SessionController::disconnect`], give the link a moment to deliver the stop message.
    pub async fn wait_closed(&mut self) {
        if tokio::time::timeout(LINK_CLOSE_TIMEOUT, self.channel.closed()).await.is_err() {
            log::warn!("Channel did not close within {:?}", LINK_CLOSE_TIMEOUT);
        }
    }

    /// Whether anything is still producing events.
    pub fn is_live(&self) -> bool {
        self.channel.is_connected() || self.frames.is_some()
    }

    /// Process exactly one pipeline event: one captured frame or one inbound
    /// message. Returns `false` once nothing is live.
    pub async fn step(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }

        let next = tokio::select! {
            frame = next_frame(&mut self.frames) => Step::Frame(frame),
            event = self.channel.next_event() => Step::Net(event),
        };

        match next {
            Step::Frame(Some(frame)) => {
                let wire = encode(frame);
                self.channel.send_frame(&wire);
            }
            Step::Frame(None) => self.capture_ended(),
            Step::Net(NetEvent::Message(msg)) => self.handle_server_message(msg),
            Step::Net(NetEvent::Closed(e)) => {
                self.observer.on_connection_state(ConnectionState::Closed);
                self.fail(SessionError::Channel(e));
            }
        }
        true
    }

    /// Run until the session ends (channel closed and capture stopped).
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::BreathEvent { data } => {
                if self.machine.apply(&data).calibrated {
                    self.observer.on_calibrated();
                }
                self.observer.on_breath_event(&data);
            }
            ServerMessage::Error { message } => {
                log::warn!("Analysis service reported: {}", message);
                self.observer.on_error(&SessionError::ServerReported(message));
            }
            ServerMessage::Unknown => {}
        }
    }

    fn capture_ended(&mut self) {
        self.frames = None;
        match self.capture.stop() {
            Ok(()) => log::info!("Frame stream ended"),
            Err(e) => self.fail(SessionError::Capture(e)),
        }
    }

    /// Report a fatal error once and release everything.
    fn fail(&mut self, err: SessionError) {
        if !self.fatal_reported {
            self.fatal_reported = true;
            log::error!("Session {} failed: {}", self.session.session_id, err);
            self.observer.on_error(&err);
        }
        self.disconnect();
    }
}

impl<O: SessionObserver> Drop for SessionController<O> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn next_frame(frames: &mut Option<FrameStream>) -> Option<AudioFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
