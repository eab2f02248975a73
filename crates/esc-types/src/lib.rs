#![no_std]

use serde::{Deserialize, Serialize};

#[cfg(feature = "use-defmt")]
use defmt::Format;

// ----------------------------------------------------------------------
// Datatypes

/// Version number for datatypes
pub const DATATYPES_VERSION: u16 = 3; // Increment this if you change definitions here

/// A JSON + newline representation of the IoSerial version response
pub const VERSION_RESPONSE_JSON_NEWLINE: &[u8] = b"{\"VersionResponse\":3}\n";

/// Largest throttle value accepted by the ESCs.
pub const MAX_THROTTLE: u16 = 1999;

/// DShot values below this are reserved for ESC commands.
pub const DSHOT_THROTTLE_OFFSET: u16 = 48;

/// Messages exchanged with the I/O board over the serial link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IoSerial {
    /// Host to board: new output levels.
    Set(OutputFrame),
    /// Board to host: latest raw input levels.
    Inputs(InputFrame),
    VersionRequest,
    VersionResponse(u16),
}

/// Throttle command, always in `0..=MAX_THROTTLE`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
#[serde(transparent)]
pub struct Throttle(u16);

/// newtype wrapper of u16 to specify duration of a servo-style PWM pulse.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
#[serde(transparent)]
pub struct PwmDuration {
    pub duration_usec: u16,
}

/// Throttle value as carried in a DShot frame (command codes excluded).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
#[serde(transparent)]
pub struct DshotValue(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
pub enum EscSignal {
    Pwm(PwmDuration),
    Dshot(DshotValue),
}

/// Output pin levels of the pusher driver.
///
/// For a solenoid only `pusher` is used. For a motor pusher, `pusher` high
/// drives the motor and `brake` high shorts it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-defmt", derive(Format))]
pub struct PusherPins {
    pub pusher: bool,
    pub brake: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFrame {
    pub esc: EscSignal,
    pub pusher: PusherPins,
}

/// Raw switch contacts as read by the board. `true` means the contact is
/// closed; polarity and debouncing are applied on the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrame {
    pub trigger: bool,
    pub rev: bool,
    pub cycle: bool,
    pub button: bool,
    /// Flywheel speed from ESC telemetry, if the board has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flywheel_rpm: Option<u32>,
}

// ----------------------------------------------------------------------

impl Throttle {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(MAX_THROTTLE);

    /// Values above [MAX_THROTTLE] saturate.
    pub fn new(value: u32) -> Self {
        if value > MAX_THROTTLE as u32 {
            Self::MAX
        } else {
            Self(value as u16)
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, amount: u16) -> Self {
        Self(self.0.saturating_sub(amount))
    }
}

impl PwmDuration {
    pub fn new(duration_usec: u16) -> Self {
        Self { duration_usec }
    }

    /// Maps the throttle range onto 1000..2000 µs.
    pub fn from_throttle(throttle: Throttle) -> Self {
        Self::new(throttle.get() / 2 + 1000)
    }
}

impl Default for PwmDuration {
    fn default() -> Self {
        Self {
            duration_usec: 1000,
        }
    }
}

impl DshotValue {
    pub fn from_throttle(throttle: Throttle) -> Self {
        Self(throttle.get() + DSHOT_THROTTLE_OFFSET)
    }
}

impl Default for EscSignal {
    fn default() -> Self {
        EscSignal::Pwm(PwmDuration::default())
    }
}

#[test]
fn test_json_newline_version() -> eyre::Result<()> {
    // This ensures that `VERSION_RESPONSE_JSON_NEWLINE` stays up to date with
    // `DATATYPES_VERSION` and also that it ends with newline.
    assert!(VERSION_RESPONSE_JSON_NEWLINE.ends_with(b"\n"));
    let decoded: IoSerial = serde_json::from_slice(VERSION_RESPONSE_JSON_NEWLINE)?;
    assert_eq!(IoSerial::VersionResponse(DATATYPES_VERSION), decoded);
    Ok(())
}

#[test]
fn test_throttle_saturates() {
    assert_eq!(Throttle::new(5000), Throttle::MAX);
    assert_eq!(Throttle::new(1234).get(), 1234);
    assert_eq!(Throttle::new(3).saturating_sub(10), Throttle::ZERO);
}

#[test]
fn test_esc_encodings() {
    assert_eq!(PwmDuration::from_throttle(Throttle::ZERO).duration_usec, 1000);
    assert_eq!(PwmDuration::from_throttle(Throttle::MAX).duration_usec, 1999);
    assert_eq!(DshotValue::from_throttle(Throttle::ZERO), DshotValue(48));
    assert_eq!(DshotValue::from_throttle(Throttle::MAX), DshotValue(2047));
}

#[test]
fn test_inputs_without_telemetry() -> eyre::Result<()> {
    let json = br#"{"Inputs":{"trigger":true,"rev":false,"cycle":true,"button":false}}"#;
    let decoded: IoSerial = serde_json::from_slice(json)?;
    assert_eq!(
        decoded,
        IoSerial::Inputs(InputFrame {
            trigger: true,
            cycle: true,
            ..Default::default()
        })
    );
    Ok(())
}
