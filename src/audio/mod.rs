//! audio - Microphone capture and wire encoding
//!
//! Capture runs on a dedicated OS thread and hands fixed-size mono frames to
//! the async side; the encoder turns them into 16-bit PCM for the channel.
//! The ALSA backend uses SpeexDSP for noise suppression.

#[cfg(feature = "alsa-backend")]
mod alsa_device;
pub mod capture;
pub mod encoder;
#[cfg(feature = "alsa-backend")]
mod speex;

#[cfg(feature = "alsa-backend")]
pub use alsa_device::AlsaBackend;
pub use capture::{
    AudioCapture, CaptureBackend, CaptureConstraints, FrameReader, FrameStream, CHANNELS,
    FRAME_SAMPLES, SAMPLE_RATE,
};
pub use encoder::{encode, encode_samples, AudioFrame, WireFrame};
