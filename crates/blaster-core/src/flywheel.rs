//! Flywheel motor state machine.
//!
//! [FlywheelController::process] consumes one drained batch of intents and
//! resolves it in a fixed priority order:
//!
//! 1. `Spindown` aborts everything.
//! 2. Rev sources: `ClearFireRequest` beats `FireRequest`, `Rev` beats
//!    `ClearRev`. The flywheels rev while either source is active.
//! 3. Idle hold: `ClearIdle` beats `Idle`.
//! 4. Setpoint navigation, first match wins.
//! 5. `PidTick` recomputes the throttle and always asks to be re-armed.
//!
//! Because a batch is a set, the result never depends on posting order.

use std::time::Duration;

use crate::{
    pid::Pid, BlasterConfig, FlywheelIntent, FlywheelSnapshot, FlywheelState, IntentSet, Millis,
    Throttle, MAX_THROTTLE,
};

/// Three rev speeds and a cursor. Next and previous wrap around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpmSetpointTable {
    setpoints: [u32; 3],
    cursor: usize,
}

impl RpmSetpointTable {
    pub fn new(setpoints: [u32; 3]) -> Self {
        Self {
            setpoints,
            cursor: 0,
        }
    }

    pub fn current(&self) -> u32 {
        self.setpoints[self.cursor]
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn next(&mut self) {
        self.cursor = (self.cursor + 1) % self.setpoints.len();
    }

    pub fn previous(&mut self) {
        self.cursor = (self.cursor + self.setpoints.len() - 1) % self.setpoints.len();
    }

    /// Out-of-range indices are ignored.
    pub fn select(&mut self, index: usize) {
        if index < self.setpoints.len() {
            self.cursor = index;
        }
    }
}

/// Open-loop throttle for a target RPM.
///
/// Full throttle spins an unloaded motor at `motor_kv * volts`.
pub fn rpm_to_throttle(rpm: u32, motor_kv: u32, battery_millivolts: u32) -> Throttle {
    let full_scale = u64::from(motor_kv) * u64::from(battery_millivolts);
    if full_scale == 0 {
        return Throttle::ZERO;
    }
    let throttle = u64::from(MAX_THROTTLE) * u64::from(rpm) * 1000 / full_scale;
    Throttle::new(throttle.min(u64::from(MAX_THROTTLE)) as u32)
}

/// Increases pass through, decreases are limited to `spindown_speed` per tick.
pub fn limit_spindown(previous: Throttle, command: Throttle, spindown_speed: u16) -> Throttle {
    command.max(previous.saturating_sub(spindown_speed))
}

/// Result of processing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub snapshot: FlywheelSnapshot,
    /// Set whenever the batch held a `PidTick`: post the next one after this
    /// delay.
    pub rearm_pid: Option<Duration>,
}

struct ClosedLoop {
    pid: Pid,
    ready_tolerance_rpm: u32,
}

pub struct FlywheelController {
    idle_rpm: u32,
    idle_timeout_ms: u64,
    firing_delay_ms: u64,
    motor_kv: u32,
    battery_millivolts: u32,
    spindown_speed: u16,
    pid_period: Duration,
    closed_loop: Option<ClosedLoop>,

    state: FlywheelState,
    fire_requested: bool,
    rev_requested: bool,
    idle_hold: bool,
    /// End of the idle window opened when the last rev source cleared.
    idle_until: Option<Millis>,
    rev_started_at: Millis,
    last_pid_tick: Option<Millis>,
    setpoints: RpmSetpointTable,
    target_rpm: u32,
    throttle: Throttle,
    measured_rpm: Option<u32>,
    abort_generation: u32,
    rev_epoch: u32,
}

impl FlywheelController {
    pub fn new(cfg: &BlasterConfig) -> Self {
        Self {
            idle_rpm: cfg.idle_rpm,
            idle_timeout_ms: cfg.idle_timeout_ms,
            firing_delay_ms: cfg.firing_delay_ms,
            motor_kv: cfg.motor_kv,
            battery_millivolts: cfg.battery_millivolts,
            spindown_speed: cfg.spindown_speed,
            pid_period: Duration::from_millis(cfg.pid_period_ms),
            closed_loop: cfg.flywheel_pid.as_ref().map(|p| ClosedLoop {
                pid: Pid::new(p.kp, p.ki, p.kd, p.correction_limit),
                ready_tolerance_rpm: p.ready_tolerance_rpm,
            }),
            state: FlywheelState::Idle,
            fire_requested: false,
            rev_requested: false,
            idle_hold: false,
            idle_until: None,
            rev_started_at: Millis(0),
            last_pid_tick: None,
            setpoints: RpmSetpointTable::new(cfg.rev_rpm_setpoints),
            target_rpm: 0,
            throttle: Throttle::ZERO,
            measured_rpm: None,
            abort_generation: 0,
            rev_epoch: 0,
        }
    }

    pub fn state(&self) -> FlywheelState {
        self.state
    }

    pub fn throttle(&self) -> Throttle {
        self.throttle
    }

    pub fn target_rpm(&self) -> u32 {
        self.target_rpm
    }

    pub fn setpoints(&self) -> &RpmSetpointTable {
        &self.setpoints
    }

    pub fn pid_period(&self) -> Duration {
        self.pid_period
    }

    /// Latest telemetry, `None` when the ESCs do not report speed.
    pub fn set_measured_rpm(&mut self, rpm: Option<u32>) {
        self.measured_rpm = rpm;
    }

    pub fn snapshot(&self) -> FlywheelSnapshot {
        FlywheelSnapshot {
            state: self.state,
            target_rpm: self.target_rpm,
            throttle: self.throttle,
            abort_generation: self.abort_generation,
            rev_epoch: self.rev_epoch,
        }
    }

    pub fn process(&mut self, batch: IntentSet, now: Millis) -> StepOutcome {
        use FlywheelIntent::*;

        if batch.contains(Spindown) {
            self.fire_requested = false;
            self.rev_requested = false;
            self.idle_hold = false;
            self.idle_until = None;
            self.abort_generation = self.abort_generation.wrapping_add(1);
            tracing::info!("flywheel spindown requested");
            self.enter(FlywheelState::SpinningDown);
        } else {
            if batch.contains(ClearFireRequest) {
                self.fire_requested = false;
            } else if batch.contains(FireRequest) {
                self.fire_requested = true;
            }

            if batch.contains(Rev) {
                self.rev_requested = true;
            } else if batch.contains(ClearRev) {
                self.rev_requested = false;
            }

            if batch.contains(ClearIdle) {
                self.idle_hold = false;
            } else if batch.contains(Idle) {
                self.idle_hold = true;
            }

            self.follow_rev_sources(now);
        }

        if batch.contains(SetpointNext) {
            self.setpoints.next();
        } else if batch.contains(SetpointPrev) {
            self.setpoints.previous();
        } else if batch.contains(Setpoint1) {
            self.setpoints.select(0);
        } else if batch.contains(Setpoint2) {
            self.setpoints.select(1);
        } else if batch.contains(Setpoint3) {
            self.setpoints.select(2);
        }
        if batch.intersects(SetpointNext | SetpointPrev | Setpoint1 | Setpoint2 | Setpoint3) {
            tracing::info!(
                "rev setpoint {} ({} RPM)",
                self.setpoints.cursor() + 1,
                self.setpoints.current()
            );
        }

        // The re-arm must not depend on anything above, otherwise the
        // control loop could stop.
        let rearm_pid = if batch.contains(PidTick) {
            self.pid_tick(now);
            Some(self.pid_period)
        } else {
            None
        };

        StepOutcome {
            snapshot: self.snapshot(),
            rearm_pid,
        }
    }

    fn revving_requested(&self) -> bool {
        self.fire_requested || self.rev_requested
    }

    fn follow_rev_sources(&mut self, now: Millis) {
        use FlywheelState::*;
        match (self.state, self.revving_requested()) {
            (Idle | SpinningDown, true) => {
                self.rev_started_at = now;
                self.idle_until = None;
                self.rev_epoch = self.rev_epoch.wrapping_add(1);
                self.enter(Revving);
            }
            (Revving | FullSpeed, false) => {
                self.idle_until = Some(now.plus(self.idle_timeout_ms));
                self.enter(SpinningDown);
            }
            _ => {}
        }
    }

    fn spun_up(&self, now: Millis) -> bool {
        match (&self.closed_loop, self.measured_rpm) {
            (Some(cl), Some(rpm)) => rpm.abs_diff(self.setpoints.current()) <= cl.ready_tolerance_rpm,
            _ => now.since(self.rev_started_at) >= self.firing_delay_ms,
        }
    }

    /// RPM to hold while no rev source is active.
    fn rest_rpm(&self, now: Millis) -> u32 {
        let in_idle_window = self.idle_until.is_some_and(|until| now < until);
        if self.idle_hold || in_idle_window {
            self.idle_rpm
        } else {
            0
        }
    }

    fn pid_tick(&mut self, now: Millis) {
        use FlywheelState::*;

        let dt_ms = match self.last_pid_tick {
            Some(prev) => now.since(prev),
            None => self.pid_period.as_millis() as u64,
        };
        self.last_pid_tick = Some(now);

        if self.state == Revving && self.spun_up(now) {
            self.enter(FullSpeed);
        }

        self.target_rpm = match self.state {
            Revving | FullSpeed => self.setpoints.current(),
            Idle | SpinningDown => self.rest_rpm(now),
        };

        let command = self.throttle_command(dt_ms);
        let previous = self.throttle;
        self.throttle = limit_spindown(previous, command, self.spindown_speed);
        tracing::trace!(
            "flywheel tick: state {:?}, target {} RPM, throttle {}",
            self.state,
            self.target_rpm,
            self.throttle.get()
        );

        match self.state {
            // decay finished once the limiter no longer holds the throttle up
            SpinningDown if self.throttle == command => self.enter(Idle),
            // idle window expired while the wheels still turn
            Idle if self.target_rpm == 0 && !self.throttle.is_zero() => self.enter(SpinningDown),
            _ => {}
        }
    }

    fn throttle_command(&mut self, dt_ms: u64) -> Throttle {
        let feedforward = rpm_to_throttle(self.target_rpm, self.motor_kv, self.battery_millivolts);
        let Some(cl) = self.closed_loop.as_mut() else {
            return feedforward;
        };
        match self.measured_rpm {
            Some(rpm) if self.target_rpm > 0 => {
                let dt = dt_ms as f32 / 1000.0;
                let correction = cl.pid.update(self.target_rpm as f32, rpm as f32, dt);
                let command = (f32::from(feedforward.get()) + correction).max(0.0);
                Throttle::new(command as u32)
            }
            _ => {
                cl.pid.reset();
                feedforward
            }
        }
    }

    fn enter(&mut self, next: FlywheelState) {
        if self.state != next {
            tracing::debug!("flywheel {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
