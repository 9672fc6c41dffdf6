//! Safe wrapper around SpeexDSP's preprocessor.
//!
//! Capture runs denoise only: automatic gain control is kept off because the
//! analyzer reads signal energy, and AGC rescales it.

use std::ffi::{c_int, c_void};

use anyhow::Result;

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;
}

pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// SpeexPreprocessState is used from the recording thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a preprocessor for frames of `frame_size` mono samples.
    pub fn new(frame_size: usize, sample_rate: u32) -> Result<Self> {
        let state = unsafe {
            speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int)
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        Ok(Self { state, frame_size })
    }

    /// Preprocessor set up for breath capture.
    ///
    /// * `noise_suppression` - enable denoise
    /// * `noise_suppress_db` - max attenuation in dB (negative, e.g. -25)
    /// * `agc`               - automatic gain control
    pub fn for_capture(
        frame_size: usize,
        sample_rate: u32,
        noise_suppression: bool,
        noise_suppress_db: i32,
        agc: bool,
    ) -> Result<Self> {
        let mut pp = Self::new(frame_size, sample_rate)?;
        pp.set_denoise(noise_suppression);
        if noise_suppression {
            pp.set_noise_suppress(noise_suppress_db);
        }
        pp.set_agc(agc);
        Ok(pp)
    }

    fn ctl_int(&mut self, request: c_int, value: c_int) {
        let mut val = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }

    pub fn set_denoise(&mut self, enable: bool) {
        self.ctl_int(SPEEX_PREPROCESS_SET_DENOISE, enable as c_int);
    }

    /// Set noise suppress level in dB (negative value, e.g. -25).
    pub fn set_noise_suppress(&mut self, level: i32) {
        self.ctl_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, level.min(0));
    }

    pub fn set_agc(&mut self, enable: bool) {
        self.ctl_int(SPEEX_PREPROCESS_SET_AGC, enable as c_int);
    }

    /// Run the preprocessor in place on exactly one frame of 16-bit mono PCM.
    pub fn process(&mut self, samples: &mut [i16]) -> Result<()> {
        if samples.len() != self.frame_size {
            anyhow::bail!(
                "preprocessor expects {} samples, got {}",
                self.frame_size,
                samples.len()
            );
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
        Ok(())
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}
