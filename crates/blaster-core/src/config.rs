use serde::{Deserialize, Serialize};

/// How trigger presses and releases change the shot buffer.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub enum BufferMode {
    /// Press loads one burst, release clears whatever is left.
    StopOnRelease,
    /// Press adds a burst unless a full burst is already queued. Release is
    /// ignored.
    #[default]
    FinishBurstOnRelease,
    /// Every press adds a burst. Release is ignored.
    AccumulateBursts,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub enum PusherKind {
    /// Timed solenoid, no position feedback.
    #[default]
    SolenoidOpenLoop,
    /// Motor with a cycle switch marking the home position.
    MotorClosedLoop,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub enum EscProtocol {
    /// Servo-style pulse width.
    Pwm,
    /// Digital throttle values. The bit rate is set on the I/O board.
    #[default]
    Dshot,
}

/// Gains for the optional closed-loop flywheel control. Output is in
/// throttle units added to the open-loop throttle.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Clamp of the integral term and of the total correction, in throttle units.
    #[serde(default = "default_correction_limit")]
    pub correction_limit: f32,
    /// Measured RPM within this distance of the target counts as spun up.
    pub ready_tolerance_rpm: u32,
}

fn default_correction_limit() -> f32 {
    400.0
}

/// Startup configuration of the blaster. Read once and never changed while
/// running.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct BlasterConfig {
    /// Selectable rev speeds. The first one is active after startup.
    pub rev_rpm_setpoints: [u32; 3],
    pub idle_rpm: u32,
    /// How long to hold idle RPM after the last rev source was released.
    pub idle_timeout_ms: u64,
    pub motor_kv: u32,
    /// Nominal pack voltage used to turn RPM into throttle.
    pub battery_millivolts: u32,
    pub burst_length: u16,
    pub buffer_mode: BufferMode,
    /// Spin-up time before the first dart may be pushed.
    pub firing_delay_ms: u64,
    pub pusher: PusherKind,
    pub solenoid_extend_time_ms: u64,
    pub solenoid_retract_time_ms: u64,
    /// For [PusherKind::MotorClosedLoop]: longest drive time without a cycle
    /// switch change before the motor is considered stalled.
    pub pusher_stall_time_ms: u64,
    /// Largest throttle decrease per flywheel tick.
    pub spindown_speed: u16,
    pub rev_switch_normally_closed: bool,
    pub trigger_switch_normally_closed: bool,
    pub cycle_switch_normally_closed: bool,
    pub button_normally_closed: bool,
    pub debounce_time_ms: u64,
    pub target_loop_time_us: u64,
    /// Period of the flywheel PID tick.
    pub pid_period_ms: u64,
    pub esc_protocol: EscProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flywheel_pid: Option<PidConfig>,
}

impl Default for BlasterConfig {
    fn default() -> Self {
        Self {
            rev_rpm_setpoints: [50_000, 40_000, 30_000],
            idle_rpm: 1000,
            idle_timeout_ms: 30_000,
            motor_kv: 2550,
            battery_millivolts: 14_740,
            burst_length: 3,
            buffer_mode: BufferMode::FinishBurstOnRelease,
            firing_delay_ms: 200,
            pusher: PusherKind::SolenoidOpenLoop,
            solenoid_extend_time_ms: 22,
            solenoid_retract_time_ms: 78,
            pusher_stall_time_ms: 500,
            spindown_speed: 1,
            rev_switch_normally_closed: false,
            trigger_switch_normally_closed: false,
            cycle_switch_normally_closed: false,
            button_normally_closed: false,
            debounce_time_ms: 25,
            target_loop_time_us: 1000,
            pid_period_ms: 1,
            esc_protocol: EscProtocol::Dshot,
            flywheel_pid: None,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("rev RPM setpoint {index} is zero")]
    EmptySetpoint { index: usize },
    #[error("idle RPM {idle} is not below the lowest rev setpoint {lowest}")]
    IdleAboveRev { idle: u32, lowest: u32 },
}

impl BlasterConfig {
    /// Reject values the state machines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&'static str, u64); 6] = [
            ("burst_length", self.burst_length.into()),
            ("motor_kv", self.motor_kv.into()),
            ("battery_millivolts", self.battery_millivolts.into()),
            ("spindown_speed", self.spindown_speed.into()),
            ("target_loop_time_us", self.target_loop_time_us),
            ("pid_period_ms", self.pid_period_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.pusher == PusherKind::MotorClosedLoop && self.pusher_stall_time_ms == 0 {
            return Err(ConfigError::Zero("pusher_stall_time_ms"));
        }
        if self.pusher == PusherKind::SolenoidOpenLoop && self.solenoid_extend_time_ms == 0 {
            return Err(ConfigError::Zero("solenoid_extend_time_ms"));
        }
        if let Some(index) = self.rev_rpm_setpoints.iter().position(|rpm| *rpm == 0) {
            return Err(ConfigError::EmptySetpoint { index });
        }
        let lowest = self.rev_rpm_setpoints.iter().copied().min().unwrap_or_default();
        if self.idle_rpm >= lowest {
            return Err(ConfigError::IdleAboveRev {
                idle: self.idle_rpm,
                lowest,
            });
        }
        if let Some(pid) = &self.flywheel_pid {
            if pid.ready_tolerance_rpm == 0 {
                return Err(ConfigError::Zero("flywheel_pid.ready_tolerance_rpm"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        BlasterConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_uses_defaults() -> eyre::Result<()> {
        let cfg: BlasterConfig = serde_yaml::from_str(
            "burst_length: 5\nbuffer_mode: AccumulateBursts\npusher: MotorClosedLoop\n",
        )?;
        assert_eq!(cfg.burst_length, 5);
        assert_eq!(cfg.buffer_mode, BufferMode::AccumulateBursts);
        assert_eq!(cfg.pusher, PusherKind::MotorClosedLoop);
        assert_eq!(cfg.solenoid_retract_time_ms, 78);
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn unknown_field_rejected() {
        let r: Result<BlasterConfig, _> = serde_yaml::from_str("burst_lenght: 5\n");
        assert!(r.is_err());
    }

    #[test]
    fn yaml_roundtrip_keeps_pid() -> eyre::Result<()> {
        let mut cfg = BlasterConfig::default();
        cfg.flywheel_pid = Some(PidConfig {
            kp: 0.02,
            ki: 0.5,
            kd: 0.0,
            correction_limit: 300.0,
            ready_tolerance_rpm: 1500,
        });
        let buf = serde_yaml::to_string(&cfg)?;
        let back: BlasterConfig = serde_yaml::from_str(&buf)?;
        assert_eq!(back, cfg);
        Ok(())
    }

    #[test]
    fn validation_errors() {
        let mut cfg = BlasterConfig::default();
        cfg.burst_length = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("burst_length")));

        let mut cfg = BlasterConfig::default();
        cfg.rev_rpm_setpoints[2] = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::EmptySetpoint { index: 2 }));

        let mut cfg = BlasterConfig::default();
        cfg.idle_rpm = 35_000;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::IdleAboveRev {
                idle: 35_000,
                lowest: 30_000
            })
        );

        let mut cfg = BlasterConfig::default();
        cfg.pusher = PusherKind::MotorClosedLoop;
        cfg.pusher_stall_time_ms = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Zero("pusher_stall_time_ms"))
        );
    }
}
