//! Capability interfaces for the outputs, with one implementation per
//! hardware variant. The variant is chosen once from the configuration.

use esc_types::{DshotValue, EscSignal, PusherPins, PwmDuration, Throttle};

use crate::{EscProtocol, PusherCommand, PusherKind};

pub trait ThrottleActuator: Send {
    fn set_throttle(&mut self, value: Throttle);
    /// Signal for the most recent throttle.
    fn signal(&self) -> EscSignal;
}

pub trait PusherActuator: Send {
    fn apply(&mut self, command: PusherCommand);
    fn pins(&self) -> PusherPins;
}

/// Servo-style ESC input.
#[derive(Debug, Default)]
pub struct PwmEsc {
    pulse: PwmDuration,
}

impl ThrottleActuator for PwmEsc {
    fn set_throttle(&mut self, value: Throttle) {
        self.pulse = PwmDuration::from_throttle(value);
    }

    fn signal(&self) -> EscSignal {
        EscSignal::Pwm(self.pulse)
    }
}

#[derive(Debug)]
pub struct DshotEsc {
    value: DshotValue,
}

impl Default for DshotEsc {
    fn default() -> Self {
        Self {
            value: DshotValue::from_throttle(Throttle::ZERO),
        }
    }
}

impl ThrottleActuator for DshotEsc {
    fn set_throttle(&mut self, value: Throttle) {
        self.value = DshotValue::from_throttle(value);
    }

    fn signal(&self) -> EscSignal {
        EscSignal::Dshot(self.value)
    }
}

pub fn throttle_actuator(protocol: EscProtocol) -> Box<dyn ThrottleActuator> {
    match protocol {
        EscProtocol::Pwm => Box::<PwmEsc>::default(),
        EscProtocol::Dshot => Box::<DshotEsc>::default(),
    }
}

/// Single output: energized extends the plunger.
#[derive(Debug, Default)]
pub struct SolenoidPusher {
    energized: bool,
}

impl PusherActuator for SolenoidPusher {
    fn apply(&mut self, command: PusherCommand) {
        match command {
            PusherCommand::Extend => self.energized = true,
            PusherCommand::Retract => self.energized = false,
            other => tracing::warn!("solenoid pusher ignores {other:?}"),
        }
    }

    fn pins(&self) -> PusherPins {
        PusherPins {
            pusher: self.energized,
            brake: false,
        }
    }
}

/// Motor with drive and brake outputs.
#[derive(Debug, Default)]
pub struct MotorPusher {
    pins: PusherPins,
}

impl PusherActuator for MotorPusher {
    fn apply(&mut self, command: PusherCommand) {
        self.pins = match command {
            PusherCommand::DriveForward => PusherPins {
                pusher: true,
                brake: false,
            },
            PusherCommand::Brake => PusherPins {
                pusher: true,
                brake: true,
            },
            PusherCommand::Coast => PusherPins::default(),
            other => {
                tracing::warn!("motor pusher ignores {other:?}");
                return;
            }
        };
    }

    fn pins(&self) -> PusherPins {
        self.pins
    }
}

pub fn pusher_actuator(kind: PusherKind) -> Box<dyn PusherActuator> {
    match kind {
        PusherKind::SolenoidOpenLoop => Box::<SolenoidPusher>::default(),
        PusherKind::MotorClosedLoop => Box::<MotorPusher>::default(),
    }
}
