//! Microphone acquisition on a dedicated recording thread.
//!
//! Uses std::thread (NOT tokio tasks) for blocking device reads. Frames leave
//! the thread through a single-slot channel: if the previous frame has not been
//! picked up yet, the new one is dropped rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use super::encoder::AudioFrame;
use crate::config::Config;
use crate::error::CaptureError;

pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u32 = 1;
/// Samples per frame (~93 ms at 44.1 kHz).
pub const FRAME_SAMPLES: usize = 4096;

/// Fixed acquisition parameters requested from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    /// Device name understood by the backend (e.g. "default", "plughw:0,0")
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    /// Off: gain changes would distort the energy the analyzer measures.
    pub auto_gain_control: bool,
    /// Noise suppression depth in dB (negative)
    pub noise_suppress_db: i32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_samples: FRAME_SAMPLES,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: false,
            noise_suppress_db: -25,
        }
    }
}

impl CaptureConstraints {
    /// Default constraints on the device named in `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            device: config.capture_device.clone(),
            noise_suppress_db: config.noise_suppress_db,
            ..Self::default()
        }
    }
}

/// Source of microphone audio. `open` acquires the device on the recording thread.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn FrameReader>, CaptureError>;
}

/// An acquired device. Dropping the reader releases it.
pub trait FrameReader {
    /// Block until `frame` is completely filled with mono samples in [-1, 1].
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), CaptureError>;
}

/// Frames in capture order. Capacity is one frame.
pub type FrameStream = mpsc::Receiver<AudioFrame>;

pub struct AudioCapture {
    backend: Arc<dyn CaptureBackend>,
    constraints: CaptureConstraints,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    record_handle: Option<JoinHandle<Result<(), CaptureError>>>,
}

impl AudioCapture {
    pub fn new(backend: Arc<dyn CaptureBackend>, constraints: CaptureConstraints) -> Self {
        Self {
            backend,
            constraints,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            record_handle: None,
        }
    }

    pub fn constraints(&self) -> &CaptureConstraints {
        &self.constraints
    }

    /// Whether a recording thread currently holds the device.
    pub fn is_running(&self) -> bool {
        self.record_handle.is_some()
    }

    /// Frames dropped because the consumer had not taken the previous one.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Acquire the device and start producing frames.
    ///
    /// Resolves once the recording thread has opened the device (or failed to).
    pub async fn start(&mut self) -> Result<FrameStream, CaptureError> {
        if self.record_handle.is_some() {
            return Err(CaptureError::Stream("capture already running".to_string()));
        }

        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(1);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();

        self.running.store(true, Ordering::SeqCst);
        self.dropped.store(0, Ordering::Relaxed);

        log::info!(
            "AudioCapture starting, device: \"{}\", rate: {}Hz, ch: {}, frame: {} samples, ec: {}, ns: {}, agc: {}",
            self.constraints.device,
            self.constraints.sample_rate,
            self.constraints.channels,
            self.constraints.frame_samples,
            self.constraints.echo_cancellation,
            self.constraints.noise_suppression,
            self.constraints.auto_gain_control,
        );

        let handle = {
            let backend = self.backend.clone();
            let constraints = self.constraints.clone();
            let running = self.running.clone();
            let dropped = self.dropped.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    let result =
                        record_thread(&*backend, &constraints, frame_tx, ready_tx, &running, &dropped);
                    if let Err(e) = &result {
                        log::error!("Recording thread error: {}", e);
                    }
                    result
                })
                .map_err(|e| CaptureError::Stream(format!("failed to spawn recording thread: {}", e)))?
        };

        match ready_rx.await {
            Ok(Ok(())) => {
                self.record_handle = Some(handle);
                Ok(frame_rx)
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(CaptureError::Stream("recording thread exited during start".to_string()))
            }
        }
    }

    /// Signal the recording thread to stop and wait for it to release the device.
    ///
    /// Returns the error that ended recording, if any. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.record_handle.take() else {
            return Ok(());
        };

        let result = handle
            .join()
            .unwrap_or_else(|_| Err(CaptureError::Stream("recording thread panicked".to_string())));

        let dropped = self.dropped_frames();
        if dropped > 0 {
            log::info!("AudioCapture stopped, {} frames dropped by backpressure", dropped);
        } else {
            log::info!("AudioCapture stopped");
        }
        result
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ======================== Recording thread ========================

fn record_thread(
    backend: &dyn CaptureBackend,
    constraints: &CaptureConstraints,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<(), CaptureError>>,
    running: &AtomicBool,
    dropped: &AtomicU64,
) -> Result<(), CaptureError> {
    // 1. Acquire the device and report the outcome to start()
    let mut reader = match backend.open(constraints) {
        Ok(reader) => {
            let _ = ready_tx.send(Ok(()));
            reader
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    log::info!("Recording started");

    // 2. One frame in flight at most
    while running.load(Ordering::Relaxed) {
        let mut samples = vec![0f32; constraints.frame_samples];
        reader.read_frame(&mut samples)?;

        if !running.load(Ordering::Relaxed) {
            break;
        }

        match frame_tx.try_send(AudioFrame::new(samples)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Frame slot occupied, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                log::info!("Frame receiver dropped");
                break;
            }
        }
    }

    // 3. Release the device before reporting completion
    drop(reader);
    log::info!("Recording stopped");
    Ok(())
}
