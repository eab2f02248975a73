//! Fixed-period control loop.
//!
//! Each tick samples the switches, steps the [PusherController], forwards
//! intents to the flywheel task and refreshes the outputs.
//!
//! Ticks are due on a fixed grid and each sleep runs to the next due time, so
//! a sleep that wakes late (tokio timers have millisecond resolution) is made
//! up by a shorter one and the average period stays on target. A tick whose
//! work takes longer than the period, or that starts a whole period after it
//! was due, is an overrun: it is reported, the next tick starts immediately
//! and the grid restarts from there. There is no catch-up.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{
    actuators::{pusher_actuator, throttle_actuator},
    pusher::{PusherInputs, PusherStep},
    BlasterConfig, ChangeDetector, Clock, DebouncedInput, FlywheelEventQueue, FlywheelIntent,
    FlywheelSnapshot, InputFrame, IntentSet, Millis, OutputFrame, PusherActuator,
    PusherController, PusherKind, Switch, Throttle, ThrottleActuator,
};

/// Source of raw switch levels, sampled once per tick.
pub trait RawInputs {
    fn levels(&mut self) -> InputFrame;
}

impl RawInputs for watch::Receiver<InputFrame> {
    fn levels(&mut self) -> InputFrame {
        *self.borrow_and_update()
    }
}

pub struct ControlLoopScheduler<C: Clock, I: RawInputs> {
    clock: Arc<C>,
    period: Duration,
    inputs: I,
    trigger: Switch,
    rev: Switch,
    cycle: Switch,
    button: Switch,
    pusher: PusherController,
    pusher_kind: PusherKind,
    throttle_out: Box<dyn ThrottleActuator>,
    pusher_out: Box<dyn PusherActuator>,
    queue: Arc<FlywheelEventQueue>,
    flywheel: watch::Receiver<FlywheelSnapshot>,
    outputs: watch::Sender<OutputFrame>,
    /// When the next tick is due, on the clock's time line.
    next_due: Option<Duration>,
    overrunning: ChangeDetector<bool>,
    /// Overrun ticks in the current episode.
    episode_overruns: u64,
    worst_tick: Duration,
    total_overruns: u64,
}

impl<C: Clock, I: RawInputs> ControlLoopScheduler<C, I> {
    pub fn new(
        cfg: &BlasterConfig,
        clock: Arc<C>,
        inputs: I,
        queue: Arc<FlywheelEventQueue>,
        flywheel: watch::Receiver<FlywheelSnapshot>,
        outputs: watch::Sender<OutputFrame>,
    ) -> Self {
        let debounce = cfg.debounce_time_ms;
        let mut overrunning = ChangeDetector::new();
        overrunning.update(false);
        Self {
            clock,
            period: Duration::from_micros(cfg.target_loop_time_us),
            inputs,
            trigger: Switch::new(cfg.trigger_switch_normally_closed, debounce),
            rev: Switch::new(cfg.rev_switch_normally_closed, debounce),
            cycle: Switch::new(cfg.cycle_switch_normally_closed, debounce),
            button: Switch::new(cfg.button_normally_closed, debounce),
            pusher: PusherController::new(cfg),
            pusher_kind: cfg.pusher,
            throttle_out: throttle_actuator(cfg.esc_protocol),
            pusher_out: pusher_actuator(cfg.pusher),
            queue,
            flywheel,
            outputs,
            next_due: None,
            overrunning,
            episode_overruns: 0,
            worst_tick: Duration::ZERO,
            total_overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn pusher(&self) -> &PusherController {
        &self.pusher
    }

    /// Number of overrun ticks.
    pub fn total_overruns(&self) -> u64 {
        self.total_overruns
    }

    /// Run one tick and sleep until the next one is due.
    pub async fn tick(&mut self) -> PusherStep {
        let start = self.clock.now();
        let due = self.next_due.unwrap_or(start);
        let lateness = start.saturating_sub(due);

        let out = self.step(self.clock.now_millis());

        let work = self.clock.now().saturating_sub(start);
        let overrun = self.report_timing(lateness, work);
        self.next_due = (!overrun).then(|| due + self.period);
        if let Some(next_due) = self.next_due {
            let remaining = next_due.saturating_sub(self.clock.now());
            if !remaining.is_zero() {
                self.clock.sleep(remaining).await;
            }
        }
        out
    }

    /// The work of one tick, without any timing.
    pub fn step(&mut self, now: Millis) -> PusherStep {
        let levels = self.inputs.levels();
        self.trigger.update(levels.trigger, now);
        self.rev.update(levels.rev, now);
        self.cycle.update(levels.cycle, now);
        self.button.update(levels.button, now);

        let mut intents = IntentSet::empty();
        if self.rev.pressed() {
            intents |= FlywheelIntent::Rev;
        } else if self.rev.released() {
            intents |= FlywheelIntent::ClearRev;
        }
        if self.button.pressed() {
            intents |= FlywheelIntent::SetpointNext;
        }

        let snapshot = *self.flywheel.borrow();
        let inputs = PusherInputs {
            trigger: &self.trigger,
            rev: &self.rev,
            cycle: &self.cycle,
        };
        let out = self.pusher.step(&inputs, &snapshot, now);
        if let Some(command) = out.command {
            self.pusher_out.apply(command);
        }

        // one batch per tick
        self.queue.post_all(intents | out.intents);

        self.throttle_out.set_throttle(snapshot.throttle);
        self.publish_outputs();
        out
    }

    /// Zero throttle and release every pusher output, regardless of what
    /// the controllers want. Used on shutdown.
    pub fn stop_outputs(&mut self) {
        self.throttle_out.set_throttle(Throttle::ZERO);
        self.pusher_out = pusher_actuator(self.pusher_kind);
        self.publish_outputs();
    }

    fn publish_outputs(&mut self) {
        let frame = OutputFrame {
            esc: self.throttle_out.signal(),
            pusher: self.pusher_out.pins(),
        };
        self.outputs.send_if_modified(|current| {
            if *current == frame {
                false
            } else {
                *current = frame;
                true
            }
        });
    }

    /// Returns whether this tick is an overrun.
    fn report_timing(&mut self, lateness: Duration, work: Duration) -> bool {
        let overrun = work > self.period || lateness >= self.period;
        if overrun {
            self.episode_overruns += 1;
            self.total_overruns += 1;
            self.worst_tick = self.worst_tick.max(lateness + work);
        }
        match self.overrunning.update(overrun) {
            Some(false) => {
                tracing::warn!(
                    "control loop overrun: tick took {work:?} after starting {lateness:?} late, period is {:?}",
                    self.period
                );
            }
            Some(true) => {
                tracing::info!(
                    "control loop back on time after {} overrun tick(s), worst {:?}",
                    self.episode_overruns,
                    self.worst_tick
                );
                self.episode_overruns = 0;
                self.worst_tick = Duration::ZERO;
            }
            None => {}
        }
        overrun
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DshotValue, EscSignal, FlywheelController, FlywheelState, ManualClock, PusherCommand,
        PusherState,
    };

    /// Inputs whose sampling takes a configurable amount of (virtual) time.
    struct SlowInputs {
        clock: Arc<ManualClock>,
        cost: Duration,
        frame: InputFrame,
    }

    impl RawInputs for SlowInputs {
        fn levels(&mut self) -> InputFrame {
            self.clock.advance(self.cost);
            self.frame
        }
    }

    struct Rig {
        clock: Arc<ManualClock>,
        sched: ControlLoopScheduler<ManualClock, SlowInputs>,
        queue: Arc<FlywheelEventQueue>,
        flywheel_tx: watch::Sender<FlywheelSnapshot>,
        outputs_rx: watch::Receiver<OutputFrame>,
    }

    fn rig(cfg: &BlasterConfig) -> Rig {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(FlywheelEventQueue::new());
        let (flywheel_tx, flywheel_rx) = watch::channel(FlywheelSnapshot::default());
        let (outputs_tx, outputs_rx) = watch::channel(OutputFrame::default());
        let inputs = SlowInputs {
            clock: clock.clone(),
            cost: Duration::ZERO,
            frame: InputFrame::default(),
        };
        let sched = ControlLoopScheduler::new(
            cfg,
            clock.clone(),
            inputs,
            queue.clone(),
            flywheel_rx,
            outputs_tx,
        );
        Rig {
            clock,
            sched,
            queue,
            flywheel_tx,
            outputs_rx,
        }
    }

    #[test]
    fn rev_switch_edges_become_intents() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.step(Millis(0));
        assert!(r.queue.try_drain().is_empty());

        r.sched.inputs.frame.rev = true;
        r.sched.step(Millis(1));
        let batch = r.queue.try_drain();
        assert!(batch.contains(FlywheelIntent::Rev));
        // rev alone also spins up the pusher side
        assert!(batch.contains(FlywheelIntent::FireRequest));

        // no new edges, only the repeated fire request
        r.sched.step(Millis(2));
        assert_eq!(r.queue.try_drain(), FlywheelIntent::FireRequest);

        r.sched.inputs.frame.rev = false;
        r.sched.step(Millis(40));
        let batch = r.queue.try_drain();
        assert!(batch.contains(FlywheelIntent::ClearRev));
        assert!(batch.contains(FlywheelIntent::ClearFireRequest));
        assert!(!batch.contains(FlywheelIntent::FireRequest));
    }

    #[test]
    fn button_cycles_setpoint() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.inputs.frame.button = true;
        r.sched.step(Millis(0));
        assert_eq!(r.queue.try_drain(), FlywheelIntent::SetpointNext);
    }

    #[test]
    fn switch_polarity_from_config() {
        let cfg = BlasterConfig {
            trigger_switch_normally_closed: true,
            ..Default::default()
        };
        let mut r = rig(&cfg);
        // closed contact on a normally closed switch is "not pressed"
        r.sched.inputs.frame.trigger = true;
        r.sched.step(Millis(0));
        assert!(r.queue.try_drain().is_empty());
        r.sched.inputs.frame.trigger = false;
        r.sched.step(Millis(1));
        assert!(r.queue.try_drain().contains(FlywheelIntent::FireRequest));
    }

    #[test]
    fn outputs_follow_flywheel_and_pusher() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.inputs.frame.trigger = true;
        r.sched.step(Millis(0));
        assert_eq!(r.sched.pusher().state(), PusherState::Accelerating);
        r.flywheel_tx.send_replace(FlywheelSnapshot {
            state: FlywheelState::FullSpeed,
            throttle: Throttle::new(1000),
            rev_epoch: 1,
            ..Default::default()
        });
        r.sched.step(Millis(1));
        let out = r.sched.step(Millis(2));
        assert_eq!(out.command, Some(PusherCommand::Extend));

        let frame = *r.outputs_rx.borrow();
        assert_eq!(frame.esc, EscSignal::Dshot(DshotValue(1048)));
        assert!(frame.pusher.pusher);
    }

    #[test]
    fn motor_pusher_pins() {
        let cfg = BlasterConfig {
            pusher: PusherKind::MotorClosedLoop,
            ..Default::default()
        };
        let mut r = rig(&cfg);
        r.sched.inputs.frame.trigger = true;
        r.sched.step(Millis(0));
        r.flywheel_tx.send_replace(FlywheelSnapshot {
            state: FlywheelState::FullSpeed,
            rev_epoch: 1,
            ..Default::default()
        });
        r.sched.step(Millis(1));
        r.sched.step(Millis(2));
        let frame = *r.outputs_rx.borrow();
        assert!(frame.pusher.pusher);
        assert!(!frame.pusher.brake);
    }

    #[test]
    fn stop_outputs_zeroes_everything() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.inputs.frame.trigger = true;
        r.sched.step(Millis(0));
        r.flywheel_tx.send_replace(FlywheelSnapshot {
            state: FlywheelState::FullSpeed,
            throttle: Throttle::MAX,
            rev_epoch: 1,
            ..Default::default()
        });
        for t in 1..3 {
            r.sched.step(Millis(t));
        }
        assert!(r.outputs_rx.borrow().pusher.pusher);

        r.sched.stop_outputs();
        let frame = *r.outputs_rx.borrow();
        assert_eq!(frame.esc, EscSignal::Dshot(DshotValue(48)));
        assert_eq!(frame.pusher, Default::default());
    }

    #[tokio::test]
    async fn tick_sleeps_out_the_period() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.inputs.cost = Duration::from_micros(300);
        r.sched.tick().await;
        assert_eq!(r.clock.now(), Duration::from_millis(1));
        r.sched.tick().await;
        assert_eq!(r.clock.now(), Duration::from_millis(2));
        assert_eq!(r.sched.total_overruns(), 0);
    }

    #[tokio::test]
    async fn late_wakeup_is_made_up_by_the_next_sleep() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.inputs.cost = Duration::from_micros(300);
        r.sched.tick().await;
        // the timer fired 600 us after the due time
        r.clock.advance(Duration::from_micros(600));
        r.sched.tick().await;
        assert_eq!(r.clock.now(), Duration::from_millis(2));
        r.sched.tick().await;
        assert_eq!(r.clock.now(), Duration::from_millis(3));
        assert_eq!(r.sched.total_overruns(), 0);

        // a whole period late is a missed tick
        r.clock.advance(Duration::from_micros(1500));
        r.sched.tick().await;
        assert_eq!(r.sched.total_overruns(), 1);
        assert_eq!(r.clock.now(), Duration::from_micros(4800));
        r.sched.tick().await;
        assert_eq!(r.clock.now(), Duration::from_micros(5800));
        assert_eq!(r.sched.total_overruns(), 1);
    }

    #[tokio::test]
    async fn overrun_is_counted_without_catch_up() {
        let mut r = rig(&BlasterConfig::default());
        r.sched.inputs.cost = Duration::from_millis(3);
        r.sched.tick().await;
        r.sched.tick().await;
        // no sleep after an overrun
        assert_eq!(r.clock.now(), Duration::from_millis(6));
        assert_eq!(r.sched.total_overruns(), 2);

        r.sched.inputs.cost = Duration::ZERO;
        r.sched.tick().await;
        // the grid restarts from this tick
        assert_eq!(r.clock.now(), Duration::from_millis(7));
        assert_eq!(r.sched.total_overruns(), 2);
        assert_eq!(r.sched.episode_overruns, 0);
    }

    fn run_flywheel(r: &Rig, fw: &mut FlywheelController, now: Millis) {
        let mut batch = r.queue.try_drain();
        batch |= FlywheelIntent::PidTick;
        r.flywheel_tx.send_replace(fw.process(batch, now).snapshot);
    }

    /// Rev held until everything is at full speed, one drain per tick.
    fn rev_up(r: &mut Rig, fw: &mut FlywheelController) {
        r.sched.inputs.frame.rev = true;
        for t in 0..300 {
            r.sched.step(Millis(t));
            run_flywheel(r, fw, Millis(t));
        }
        assert_eq!(fw.state(), FlywheelState::FullSpeed);
        assert_eq!(r.sched.pusher().state(), PusherState::FullSpeedIdle);
    }

    #[test]
    fn clear_merged_with_next_fire_request_recovers() {
        let cfg = BlasterConfig::default();
        let mut r = rig(&cfg);
        let mut fw = FlywheelController::new(&cfg);
        rev_up(&mut r, &mut fw);

        // rev released, trigger pressed on the next tick, one drain for both
        r.sched.inputs.frame.rev = false;
        r.sched.step(Millis(300));
        r.sched.inputs.frame.trigger = true;
        r.sched.step(Millis(301));
        run_flywheel(&r, &mut fw, Millis(301));
        assert_eq!(fw.state(), FlywheelState::SpinningDown);

        let mut first_extend = None;
        for t in 302..3302 {
            let out = r.sched.step(Millis(t));
            if out.command == Some(PusherCommand::Extend) && first_extend.is_none() {
                first_extend = Some(t);
            }
            run_flywheel(&r, &mut fw, Millis(t));
        }
        // revved again at 302, full speed at 502
        assert_eq!(first_extend, Some(504));
        assert_eq!(fw.state(), FlywheelState::FullSpeed);
        assert_eq!(r.sched.pusher().state(), PusherState::FullSpeedIdle);
    }

    #[test]
    fn lagging_flywheel_snapshot_does_not_fire() {
        let cfg = BlasterConfig::default();
        let mut r = rig(&cfg);
        let mut fw = FlywheelController::new(&cfg);
        rev_up(&mut r, &mut fw);

        r.sched.inputs.frame.rev = false;
        r.sched.step(Millis(300));
        r.sched.inputs.frame.trigger = true;
        // the flywheel task does not get to run for a few ticks
        for t in 301..305 {
            let out = r.sched.step(Millis(t));
            assert_eq!(out.command, None, "dart pushed at {t} ms");
        }
        assert_eq!(r.sched.pusher().state(), PusherState::Accelerating);

        let mut extends = vec![];
        for t in 305..1000 {
            let out = r.sched.step(Millis(t));
            if out.command == Some(PusherCommand::Extend) {
                assert_eq!(fw.state(), FlywheelState::FullSpeed, "dart pushed at {t} ms");
                extends.push(t);
            }
            run_flywheel(&r, &mut fw, Millis(t));
        }
        // spun down at 305, revved again at 306, full speed at 506
        assert_eq!(extends, vec![508, 608, 708]);
    }
}
