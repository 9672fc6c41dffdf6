// Shared helpers for pipeline tests: a synthetic microphone, an observer that
// records every callback, and an in-process analysis server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use breath_link::audio::{AudioCapture, CaptureBackend, CaptureConstraints, FrameReader};
use breath_link::{
    BreathEvent, CaptureError, ConnectionState, Session, SessionChannel, SessionController,
    SessionError, SessionObserver,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

/// Sine-wave microphone that paces itself like a real device (scaled down).
pub struct SineBackend {
    pub fail_open: Option<CaptureError>,
    pub frame_delay: Duration,
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl SineBackend {
    pub fn new() -> Self {
        Self {
            fail_open: None,
            frame_delay: Duration::from_millis(5),
            opened: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn denied() -> Self {
        Self {
            fail_open: Some(CaptureError::PermissionDenied),
            ..Self::new()
        }
    }
}

struct SineReader {
    phase: f32,
    delay: Duration,
    released: Arc<AtomicUsize>,
}

impl CaptureBackend for SineBackend {
    fn open(&self, _: &CaptureConstraints) -> Result<Box<dyn FrameReader>, CaptureError> {
        if let Some(e) = &self.fail_open {
            return Err(e.clone());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SineReader {
            phase: 0.0,
            delay: self.frame_delay,
            released: self.released.clone(),
        }))
    }
}

impl FrameReader for SineReader {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), CaptureError> {
        std::thread::sleep(self.delay);
        for s in frame.iter_mut() {
            *s = 0.5 * self.phase.sin();
            self.phase += 2.0 * std::f32::consts::PI * 220.0 / 44_100.0;
        }
        Ok(())
    }
}

impl Drop for SineReader {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Recorder {
    pub events: Vec<BreathEvent>,
    /// Number of breath events already delivered when on_calibrated fired.
    pub calibrated_at: Vec<usize>,
    pub errors: Vec<SessionError>,
    pub states: Vec<ConnectionState>,
}

impl Recorder {
    pub fn fatal_errors(&self) -> usize {
        self.errors.iter().filter(|e| e.is_fatal()).count()
    }
}

impl SessionObserver for Recorder {
    fn on_breath_event(&mut self, event: &BreathEvent) {
        self.events.push(event.clone());
    }

    fn on_calibrated(&mut self) {
        self.calibrated_at.push(self.events.len());
    }

    fn on_error(&mut self, error: &SessionError) {
        self.errors.push(error.clone());
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        self.states.push(state);
    }
}

pub fn controller(url: &str, backend: SineBackend) -> SessionController<Recorder> {
    let session = Session::new("session-1", "user-1", 4.0);
    let capture = AudioCapture::new(Arc::new(backend), CaptureConstraints::default());
    let channel = SessionChannel::new(url);
    SessionController::new(session, channel, capture, Recorder::default())
}

pub async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/api/meditation/ws/breath", listener.local_addr().unwrap());
    (listener, url)
}

pub async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

pub fn breath_event_json(n: u32, phase: &str) -> String {
    format!(
        r#"{{"type":"breath_event","data":{{"phase":"{}","rms":0.1,"spectral_centroid":640.0,"confidence":0.9,"timestamp":"2024-05-01T10:00:{:02}Z","duration_ms":4000.0,"breath_number":{}}}}}"#,
        phase,
        n % 60,
        n
    )
}

/// Step the controller until `done` holds, failing the test after a few seconds.
pub async fn step_until<O, F>(controller: &mut SessionController<O>, mut done: F)
where
    O: SessionObserver,
    F: FnMut(&SessionController<O>) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&*controller) {
            if !controller.step().await {
                break;
            }
        }
    })
    .await
    .expect("pipeline did not reach the expected state in time");
}
