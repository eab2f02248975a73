//! PID controller for the closed-loop flywheel option.

/// PID controller with integral and output clamping.
///
/// The derivative acts on the measurement, so setpoint changes do not kick
/// the output.
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f32,
    ki: f32,
    kd: f32,

    integral: f32,
    prev_measurement: Option<f32>,

    /// Symmetric clamp for both integral and output.
    limit: f32,
}

impl Pid {
    pub fn new(kp: f32, ki: f32, kd: f32, limit: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            prev_measurement: None,
            limit: limit.abs(),
        }
    }

    /// Forget integrator and derivative history.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_measurement = None;
    }

    /// `dt` is in seconds.
    pub fn update(&mut self, setpoint: f32, measurement: f32, dt: f32) -> f32 {
        let error = setpoint - measurement;

        let p = self.kp * error;

        self.integral = (self.integral + error * dt * self.ki).clamp(-self.limit, self.limit);

        let d = match self.prev_measurement {
            Some(prev) if dt > 0.0 => self.kd * (prev - measurement) / dt,
            _ => 0.0,
        };
        self.prev_measurement = Some(measurement);

        (p + self.integral + d).clamp(-self.limit, self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_clamped() {
        let mut pid = Pid::new(1.0, 0.0, 0.0, 100.0);
        assert_eq!(pid.update(10_000.0, 0.0, 0.001), 100.0);
        assert_eq!(pid.update(0.0, 10_000.0, 0.001), -100.0);
    }

    #[test]
    fn integral_winds_up_to_limit_only() {
        let mut pid = Pid::new(0.0, 1000.0, 0.0, 50.0);
        for _ in 0..1000 {
            pid.update(100.0, 0.0, 0.01);
        }
        assert_eq!(pid.update(100.0, 0.0, 0.01), 50.0);
        pid.reset();
        assert_eq!(pid.update(0.0, 0.0, 0.01), 0.0);
    }

    #[test]
    fn derivative_on_measurement() {
        let mut pid = Pid::new(0.0, 0.0, 1.0, 1000.0);
        // first update has no history
        assert_eq!(pid.update(0.0, 10.0, 1.0), 0.0);
        // measurement rose by 5 in 1 s
        assert_eq!(pid.update(0.0, 15.0, 1.0), -5.0);
    }
}
