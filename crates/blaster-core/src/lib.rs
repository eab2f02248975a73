use serde::{Deserialize, Serialize};

pub mod clock;
pub use clock::{Clock, ManualClock, Millis};

pub mod config;
pub use config::{BlasterConfig, BufferMode, ConfigError, EscProtocol, PidConfig, PusherKind};

pub mod intents;
pub use intents::{FlywheelIntent, IntentSet};

pub mod pid;

pub mod flywheel;
pub use flywheel::{FlywheelController, RpmSetpointTable, StepOutcome};

pub mod pusher;
pub use pusher::{PusherCommand, PusherController, PusherFault, PusherState, ShotBuffer};

pub mod input;
pub use input::{DebouncedInput, Switch};

pub mod actuators;
pub use actuators::{PusherActuator, ThrottleActuator};

pub mod utils;
pub use utils::ChangeDetector;

#[cfg(feature = "tokio")]
pub mod queue;
#[cfg(feature = "tokio")]
pub use queue::FlywheelEventQueue;

#[cfg(feature = "tokio")]
pub mod flywheel_task;
#[cfg(feature = "tokio")]
pub use flywheel_task::run_flywheel_task;

#[cfg(feature = "tokio")]
pub mod scheduler;
#[cfg(feature = "tokio")]
pub use scheduler::{ControlLoopScheduler, RawInputs};

#[cfg(feature = "tokio")]
pub use clock::TokioClock;

pub use esc_types::{
    DshotValue, EscSignal, InputFrame, IoSerial, OutputFrame, PusherPins, PwmDuration, Throttle,
    DATATYPES_VERSION, MAX_THROTTLE, VERSION_RESPONSE_JSON_NEWLINE,
};

// --------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub enum FlywheelState {
    /// At rest, or holding idle RPM.
    #[default]
    Idle,
    /// Rev requested, waiting for spin-up.
    Revving,
    FullSpeed,
    /// Throttle decaying at the spindown rate.
    SpinningDown,
}

/// What the flywheel controller publishes after every processed batch.
///
/// Readers always get a whole snapshot, never a mix of two steps.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub struct FlywheelSnapshot {
    pub state: FlywheelState,
    pub target_rpm: u32,
    pub throttle: Throttle,
    /// Incremented on every `Spindown` intent. Lets consumers notice an abort
    /// even when the state went back to `Revving` before they looked.
    pub abort_generation: u32,
    /// Incremented on every entry into `Revving`. A `FullSpeed` snapshot
    /// only answers a fire request if its epoch moved since the request.
    pub rev_epoch: u32,
}

impl FlywheelSnapshot {
    pub fn is_full_speed(&self) -> bool {
        self.state == FlywheelState::FullSpeed
    }
    /// Flywheels stopped and nothing pending.
    pub fn is_at_rest(&self) -> bool {
        self.state == FlywheelState::Idle && self.throttle.is_zero()
    }
}
