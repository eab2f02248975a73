//! Firing state machine.
//!
//! Stepped once per control-loop tick. Trigger edges feed the shot buffer
//! according to the [BufferMode]; darts are only pushed while the flywheels
//! report full speed.

use serde::{Deserialize, Serialize};

use crate::{
    BlasterConfig, BufferMode, DebouncedInput, FlywheelIntent, FlywheelSnapshot, IntentSet, Millis,
    PusherKind,
};

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub enum PusherState {
    #[default]
    Idle,
    /// Waiting for the flywheels to reach full speed.
    Accelerating,
    FullSpeedIdle,
    FullSpeedFiring,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PusherCommand {
    /// Motor on, brake off.
    DriveForward,
    Brake,
    /// Motor and brake off.
    Coast,
    Extend,
    Retract,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SolenoidPhase {
    Retracted,
    /// Energized, waiting for the extend time.
    Extending,
    /// Released, waiting for the retract time before the next stroke.
    Retracting,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MotorPhase {
    Coasting,
    Driving,
    /// Stopped at the home position.
    Braking,
    Stalled,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StrokePhase {
    Solenoid(SolenoidPhase),
    Motor(MotorPhase),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum PusherFault {
    #[error("pusher motor stalled: no cycle switch change for {elapsed_ms} ms, {dropped_shots} shot(s) dropped")]
    Stalled { elapsed_ms: u64, dropped_shots: u16 },
}

/// Number of darts still to push.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShotBuffer(u16);

impl ShotBuffer {
    pub fn count(&self) -> u16 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn on_press(&mut self, mode: BufferMode, burst_length: u16) {
        match mode {
            BufferMode::StopOnRelease => self.0 = burst_length,
            BufferMode::FinishBurstOnRelease => {
                if self.0 < burst_length {
                    self.0 = self.0.saturating_add(burst_length);
                }
            }
            BufferMode::AccumulateBursts => self.0 = self.0.saturating_add(burst_length),
        }
    }

    pub fn on_release(&mut self, mode: BufferMode) {
        if mode == BufferMode::StopOnRelease {
            self.0 = 0;
        }
    }

    fn take_one(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }

    /// Empty the buffer, returning how many shots were dropped.
    fn clear(&mut self) -> u16 {
        std::mem::take(&mut self.0)
    }
}

/// Switches the pusher looks at, already debounced for this tick.
pub struct PusherInputs<'a> {
    pub trigger: &'a dyn DebouncedInput,
    pub rev: &'a dyn DebouncedInput,
    pub cycle: &'a dyn DebouncedInput,
}

/// Everything one tick produced.
#[derive(Debug, Default, PartialEq)]
pub struct PusherStep {
    /// To be posted to the flywheel controller with this tick's batch.
    pub intents: IntentSet,
    pub command: Option<PusherCommand>,
    pub fault: Option<PusherFault>,
}

pub struct PusherController {
    kind: PusherKind,
    burst_length: u16,
    buffer_mode: BufferMode,
    extend_ms: u64,
    retract_ms: u64,
    stall_ms: u64,

    state: PusherState,
    shots: ShotBuffer,
    phase: StrokePhase,
    stroke_timer: Millis,
    /// A stroke is in flight.
    firing: bool,
    /// Last flywheel abort generation seen.
    abort_generation: u32,
    /// Set by an abort, cleared once trigger and rev are both released.
    abort_latched: bool,
    /// Flywheel rev epoch seen when the fire request went out.
    requested_epoch: u32,
}

impl PusherController {
    pub fn new(cfg: &BlasterConfig) -> Self {
        let phase = match cfg.pusher {
            PusherKind::SolenoidOpenLoop => StrokePhase::Solenoid(SolenoidPhase::Retracted),
            PusherKind::MotorClosedLoop => StrokePhase::Motor(MotorPhase::Coasting),
        };
        Self {
            kind: cfg.pusher,
            burst_length: cfg.burst_length,
            buffer_mode: cfg.buffer_mode,
            extend_ms: cfg.solenoid_extend_time_ms,
            retract_ms: cfg.solenoid_retract_time_ms,
            stall_ms: cfg.pusher_stall_time_ms,
            state: PusherState::Idle,
            shots: ShotBuffer::default(),
            phase,
            stroke_timer: Millis(0),
            firing: false,
            abort_generation: 0,
            abort_latched: false,
            requested_epoch: 0,
        }
    }

    pub fn state(&self) -> PusherState {
        self.state
    }

    pub fn shots(&self) -> u16 {
        self.shots.count()
    }

    pub fn firing(&self) -> bool {
        self.firing
    }

    pub fn stroke_phase(&self) -> StrokePhase {
        self.phase
    }

    pub fn step(
        &mut self,
        inputs: &PusherInputs<'_>,
        flywheel: &FlywheelSnapshot,
        now: Millis,
    ) -> PusherStep {
        use PusherState::*;

        let mut out = PusherStep::default();

        if inputs.trigger.pressed() {
            self.shots.on_press(self.buffer_mode, self.burst_length);
        } else if inputs.trigger.released() {
            self.shots.on_release(self.buffer_mode);
        }

        let held = inputs.trigger.is_pressed() || inputs.rev.is_pressed();
        if self.abort_latched && !held {
            self.abort_latched = false;
        }
        let aborted = flywheel.abort_generation != self.abort_generation;

        match self.state {
            Idle => {
                self.abort_generation = flywheel.abort_generation;
                if !self.abort_latched && (held || !self.shots.is_empty()) {
                    self.requested_epoch = flywheel.rev_epoch;
                    self.enter(Accelerating);
                }
            }
            Accelerating => {
                if aborted {
                    self.abort(flywheel);
                    out.intents |= FlywheelIntent::ClearFireRequest;
                    self.enter(Idle);
                } else if !held && self.shots.is_empty() {
                    // tapped and let go before spin-up
                    out.intents |= FlywheelIntent::ClearFireRequest;
                    self.enter(Idle);
                } else if flywheel.is_full_speed() && flywheel.rev_epoch != self.requested_epoch {
                    // A full-speed snapshot from the same epoch predates the
                    // request and may be stale.
                    self.enter(FullSpeedIdle);
                }
            }
            FullSpeedIdle | FullSpeedFiring => {
                if aborted {
                    self.abort(flywheel);
                    out.intents |= FlywheelIntent::ClearFireRequest;
                }
                self.step_stroke(inputs.cycle, flywheel.is_full_speed(), now, &mut out);

                let keep_revving = held && !self.abort_latched;
                if !keep_revving && self.shots.is_empty() && !self.firing {
                    out.intents |= FlywheelIntent::ClearFireRequest;
                    self.enter(Idle);
                } else if !self.shots.is_empty() || self.firing {
                    self.enter(FullSpeedFiring);
                } else {
                    self.enter(FullSpeedIdle);
                }
            }
        }

        // Level-triggered: a ClearFireRequest coalesced with this request in
        // one batch wins, so the request is repeated every tick while active.
        if self.state != Idle && !self.abort_latched {
            out.intents |= FlywheelIntent::FireRequest;
        }
        out
    }

    /// Drop queued shots after a flywheel spindown. A stroke in flight is
    /// allowed to finish.
    fn abort(&mut self, flywheel: &FlywheelSnapshot) {
        let dropped = self.shots.clear();
        tracing::info!("firing aborted by spindown, {dropped} shot(s) dropped");
        self.abort_generation = flywheel.abort_generation;
        self.abort_latched = true;
    }

    fn step_stroke(
        &mut self,
        cycle: &dyn DebouncedInput,
        may_fire: bool,
        now: Millis,
        out: &mut PusherStep,
    ) {
        match self.kind {
            PusherKind::SolenoidOpenLoop => self.step_solenoid(may_fire, now, out),
            PusherKind::MotorClosedLoop => self.step_motor(cycle, may_fire, now, out),
        }
    }

    fn step_solenoid(&mut self, may_fire: bool, now: Millis, out: &mut PusherStep) {
        let StrokePhase::Solenoid(mut phase) = self.phase else {
            return;
        };
        let elapsed = now.since(self.stroke_timer);

        if phase == SolenoidPhase::Retracting && elapsed >= self.retract_ms {
            phase = SolenoidPhase::Retracted;
        }

        if phase == SolenoidPhase::Retracted && may_fire && !self.shots.is_empty() {
            // counted when the stroke starts
            self.shots.take_one();
            self.firing = true;
            self.stroke_timer = now;
            phase = SolenoidPhase::Extending;
            out.command = Some(PusherCommand::Extend);
            tracing::debug!("solenoid extending, {} left", self.shots.count());
        } else if phase == SolenoidPhase::Extending && elapsed >= self.extend_ms {
            self.firing = false;
            self.stroke_timer = now;
            phase = SolenoidPhase::Retracting;
            out.command = Some(PusherCommand::Retract);
            tracing::debug!("solenoid retracting");
        }
        self.phase = StrokePhase::Solenoid(phase);
    }

    fn step_motor(
        &mut self,
        cycle: &dyn DebouncedInput,
        may_fire: bool,
        now: Millis,
        out: &mut PusherStep,
    ) {
        if !self.firing && may_fire && !self.shots.is_empty() {
            self.firing = true;
            self.stroke_timer = now;
            self.phase = StrokePhase::Motor(MotorPhase::Driving);
            out.command = Some(PusherCommand::DriveForward);
        } else if self.firing && self.shots.is_empty() && cycle.pressed() {
            // back at home with nothing left
            self.firing = false;
            self.phase = StrokePhase::Motor(MotorPhase::Braking);
            out.command = Some(PusherCommand::Brake);
        } else if self.firing && !self.shots.is_empty() && cycle.released() {
            // left home: one dart is on its way
            if may_fire {
                self.shots.take_one();
            }
            self.stroke_timer = now;
        } else if self.firing && now.since(self.stroke_timer) >= self.stall_ms {
            let fault = PusherFault::Stalled {
                elapsed_ms: now.since(self.stroke_timer),
                dropped_shots: self.shots.clear(),
            };
            tracing::error!("{fault}");
            self.firing = false;
            self.phase = StrokePhase::Motor(MotorPhase::Stalled);
            out.command = Some(PusherCommand::Coast);
            out.fault = Some(fault);
        }
    }

    fn enter(&mut self, next: PusherState) {
        if self.state != next {
            tracing::debug!("pusher {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
