use crate::protocol::{BreathEvent, BreathPhase};

/// Completed breath cycles needed before measurements are treated as stable.
pub const CALIBRATION_BREATHS: u32 = 10;

/// Session progress. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreathState {
    /// No event seen yet
    #[default]
    Idle,
    /// Breaths 1..9
    Calibrating,
    /// From breath 10 onwards
    Active,
}

/// Derived calibration view handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationState {
    pub is_calibrating: bool,
    pub breath_count: u32,
}

/// What applying one event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition {
    /// The one-shot calibration-complete notification should fire.
    pub calibrated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BreathStateMachine {
    state: BreathState,
    breath_count: u32,
    current_phase: BreathPhase,
    confidence: f64,
}

impl BreathStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one inbound event.
    ///
    /// Phase and confidence always follow the latest event. The breath count
    /// follows `breath_number` but never decreases, so a late or duplicated
    /// event cannot undo progress.
    pub fn apply(&mut self, event: &BreathEvent) -> Transition {
        self.current_phase = event.phase;
        self.confidence = event.confidence;

        if self.state == BreathState::Idle {
            self.state = BreathState::Calibrating;
        }

        if let Some(n) = event.breath_number {
            if n < self.breath_count {
                log::debug!(
                    "Stale breath_number {} (count already {}), keeping count",
                    n,
                    self.breath_count
                );
            }
            self.breath_count = self.breath_count.max(n);
        }

        if self.state == BreathState::Calibrating && self.breath_count >= CALIBRATION_BREATHS {
            self.state = BreathState::Active;
            log::info!("Calibration complete after {} breaths", self.breath_count);
            return Transition { calibrated: true };
        }
        Transition::default()
    }

    pub fn state(&self) -> BreathState {
        self.state
    }

    /// True until calibration completes, including before the first event.
    pub fn is_calibrating(&self) -> bool {
        self.state != BreathState::Active
    }

    pub fn breath_count(&self) -> u32 {
        self.breath_count
    }

    pub fn current_phase(&self) -> BreathPhase {
        self.current_phase
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn calibration(&self) -> CalibrationState {
        CalibrationState {
            is_calibrating: self.is_calibrating(),
            breath_count: self.breath_count,
        }
    }
}
