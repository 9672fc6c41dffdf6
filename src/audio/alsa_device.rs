//! ALSA capture backend.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::capture::{CaptureBackend, CaptureConstraints, FrameReader};
use super::speex::Preprocessor;
use crate::error::CaptureError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for mono S16 capture with the requested period size.
fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
) -> std::result::Result<(PCM, AlsaParams), CaptureError> {
    let pcm = PCM::new(device, Direction::Capture, false)
        .map_err(|e| CaptureError::from_errno(e.errno(), &format!("open '{}'", device)))?;

    configure(&pcm, sample_rate, channels, period_size)
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{:#}", e)))?;

    let params = {
        let hwp = pcm
            .hw_params_current()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        let rate = hwp.get_rate().unwrap_or(0);
        let ch = hwp.get_channels().unwrap_or(0);
        let ps = hwp.get_period_size().unwrap_or(0) as usize;
        AlsaParams {
            sample_rate: rate,
            channels: ch,
            period_size: ps,
        }
    };

    log::info!(
        "ALSA Capture: device={}, rate={}, channels={}, period_size={}",
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    // 不做重采样：硬件协商结果必须与请求完全一致
    if params.sample_rate != sample_rate || params.channels != channels {
        return Err(CaptureError::DeviceUnavailable(format!(
            "device '{}' negotiated {} Hz / {} ch, need {} Hz / {} ch",
            device, params.sample_rate, params.channels, sample_rate, channels
        )));
    }

    Ok((pcm, params))
}

fn configure(pcm: &PCM, sample_rate: u32, channels: u32, period_size: usize) -> Result<()> {
    let hwp = HwParams::any(pcm).context("Failed to initialize HwParams")?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::S16LE)?;
    hwp.set_channels(channels)?;
    hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
    hwp.set_period_size_near(period_size as alsa::pcm::Frames, ValueOr::Nearest)?;
    pcm.hw_params(&hwp).context("Failed to apply hw params")?;
    Ok(())
}

/// Microphone capture through ALSA with Speex denoise.
pub struct AlsaBackend;

impl CaptureBackend for AlsaBackend {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn FrameReader>, CaptureError> {
        if constraints.echo_cancellation {
            // ALSA 本身没有回声消除，需要在 device 中选择带 AEC 的源（如 PipeWire echo-cancel）
            log::debug!(
                "Echo cancellation is provided by the capture device '{}'",
                constraints.device
            );
        }

        let (pcm, params) = open_capture(
            &constraints.device,
            constraints.sample_rate,
            constraints.channels,
            constraints.frame_samples,
        )?;

        let preprocessor = Preprocessor::for_capture(
            constraints.frame_samples,
            params.sample_rate,
            constraints.noise_suppression,
            constraints.noise_suppress_db,
            constraints.auto_gain_control,
        )
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        let period = params.period_size.max(1);
        Ok(Box::new(AlsaReader {
            pcm,
            preprocessor,
            read_buf: vec![0i16; period],
            accum_buf: Vec::with_capacity(constraints.frame_samples + period),
            frame_buf: vec![0i16; constraints.frame_samples],
        }))
    }
}

/// Holds the PCM handle; dropping it closes the device.
struct AlsaReader {
    pcm: PCM,
    preprocessor: Preprocessor,
    read_buf: Vec<i16>,
    accum_buf: Vec<i16>,
    frame_buf: Vec<i16>,
}

impl FrameReader for AlsaReader {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), CaptureError> {
        let needed = frame.len();
        if needed != self.frame_buf.len() {
            return Err(CaptureError::Stream(format!(
                "frame of {} samples requested, device configured for {}",
                needed,
                self.frame_buf.len()
            )));
        }
        // Period size rarely equals the frame size; accumulate periods until a frame is full
        while self.accum_buf.len() < needed {
            let io = self
                .pcm
                .io_i16()
                .map_err(|e| CaptureError::Stream(e.to_string()))?;
            match io.readi(&mut self.read_buf) {
                Ok(frames) => self.accum_buf.extend_from_slice(&self.read_buf[..frames]),
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    if let Err(e2) = self.pcm.prepare() {
                        log::error!("Failed to recover PCM capture: {}", e2);
                        return Err(CaptureError::Stream(e2.to_string()));
                    }
                }
            }
        }

        self.frame_buf.copy_from_slice(&self.accum_buf[..needed]);
        self.accum_buf.drain(..needed);

        self.preprocessor
            .process(&mut self.frame_buf)
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        for (out, &s) in frame.iter_mut().zip(self.frame_buf.iter()) {
            *out = s as f32 / 32768.0;
        }
        Ok(())
    }
}

impl Drop for AlsaReader {
    fn drop(&mut self) {
        // PCM 句柄随之关闭
        log::info!("ALSA capture device released");
    }
}
