//! Intents delivered to the flywheel controller.
//!
//! A batch of pending intents is a set: posting the same intent twice before
//! the controller drains the queue delivers it once.

use enumflags2::{bitflags, BitFlags};

#[bitflags]
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlywheelIntent {
    /// Periodic control step. Re-armed by the controller itself.
    PidTick,
    /// Abort everything and spin down.
    Spindown,
    /// Hold idle RPM until cleared.
    Idle,
    ClearIdle,
    /// Rev switch source asserted.
    Rev,
    ClearRev,
    /// Pusher source asserted (darts queued or trigger held).
    FireRequest,
    ClearFireRequest,
    SetpointNext,
    SetpointPrev,
    Setpoint1,
    Setpoint2,
    Setpoint3,
}

pub type IntentSet = BitFlags<FlywheelIntent>;
