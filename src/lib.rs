//! breath_link - real-time breath detection client
//!
//! Captures microphone audio, streams it as 16-bit PCM over a WebSocket to a
//! breath analysis service, and turns the events it sends back into
//! calibration progress and the current breath phase.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod session_api;
pub mod state_machine;

pub use config::Config;
pub use controller::{SessionController, SessionObserver};
pub use error::{ApiError, CaptureError, ChannelError, ProtocolError, SessionError};
pub use net_link::{ConnectionState, Session, SessionChannel};
pub use protocol::{BreathEvent, BreathPhase};
pub use state_machine::{BreathState, BreathStateMachine, CalibrationState};
