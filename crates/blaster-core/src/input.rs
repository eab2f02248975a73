//! Debounced switch inputs.

use crate::Millis;

/// Stable switch state with edge flags for the current tick.
pub trait DebouncedInput {
    fn is_pressed(&self) -> bool;
    /// Became pressed during the latest update.
    fn pressed(&self) -> bool;
    /// Became released during the latest update.
    fn released(&self) -> bool;
}

/// Lock-out debouncer: a change is accepted at once, then further changes
/// are ignored until `debounce_ms` has passed.
#[derive(Debug, Clone)]
pub struct Switch {
    normally_closed: bool,
    debounce_ms: u64,
    stable: bool,
    last_change: Option<Millis>,
    rose: bool,
    fell: bool,
}

impl Switch {
    pub fn new(normally_closed: bool, debounce_ms: u64) -> Self {
        Self {
            normally_closed,
            debounce_ms,
            stable: false,
            last_change: None,
            rose: false,
            fell: false,
        }
    }

    /// Feed the raw contact state. Call exactly once per tick.
    pub fn update(&mut self, contact_closed: bool, now: Millis) {
        self.rose = false;
        self.fell = false;
        let pressed = contact_closed != self.normally_closed;
        if pressed == self.stable {
            return;
        }
        if let Some(last) = self.last_change {
            if now.since(last) < self.debounce_ms {
                return;
            }
        }
        self.stable = pressed;
        self.last_change = Some(now);
        if pressed {
            self.rose = true;
        } else {
            self.fell = true;
        }
    }
}

impl DebouncedInput for Switch {
    fn is_pressed(&self) -> bool {
        self.stable
    }

    fn pressed(&self) -> bool {
        self.rose
    }

    fn released(&self) -> bool {
        self.fell
    }
}
