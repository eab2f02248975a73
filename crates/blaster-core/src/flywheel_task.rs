//! The task owning the [FlywheelController].
//!
//! It is the only consumer of the [FlywheelEventQueue]. Each drained batch is
//! processed in one step and the resulting snapshot published on a watch
//! channel, so readers always see a consistent state.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{Clock, FlywheelController, FlywheelEventQueue, FlywheelIntent, FlywheelSnapshot};

/// Upper bound on how long the task sleeps with nothing to do. PID ticks
/// normally wake it far sooner.
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Run until every snapshot receiver is gone.
pub async fn run_flywheel_task<C: Clock>(
    mut controller: FlywheelController,
    queue: Arc<FlywheelEventQueue>,
    snapshot_tx: watch::Sender<FlywheelSnapshot>,
    clock: Arc<C>,
    measured_rpm: watch::Receiver<Option<u32>>,
) {
    tracing::debug!(
        "flywheel task started, PID period {:?}",
        controller.pid_period()
    );
    queue.post(FlywheelIntent::PidTick);

    loop {
        let batch = queue.wait_and_drain(MAX_WAIT).await;
        if batch.is_empty() {
            if snapshot_tx.is_closed() {
                break;
            }
            continue;
        }

        controller.set_measured_rpm(*measured_rpm.borrow());
        let outcome = controller.process(batch, clock.now_millis());

        if snapshot_tx.send(outcome.snapshot).is_err() {
            break;
        }

        if let Some(delay) = outcome.rearm_pid {
            let queue = queue.clone();
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep(delay).await;
                queue.post(FlywheelIntent::PidTick);
            });
        }
    }
    tracing::debug!("flywheel task stopped");
}
