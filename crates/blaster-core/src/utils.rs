/// Tracks a value across ticks and reports when it changes.
#[derive(Clone, Debug)]
pub struct ChangeDetector<T: PartialEq + Copy> {
    old_value: Option<T>,
}

impl<T: PartialEq + Copy> Default for ChangeDetector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq + Copy> ChangeDetector<T> {
    pub fn new() -> Self {
        Self { old_value: None }
    }

    /// Update the stored value.
    ///
    /// Returns the previous value if the value has changed vs the previous
    /// call. The first call never reports a change.
    pub fn update(&mut self, val: T) -> Option<T> {
        match self.old_value.replace(val) {
            Some(old) if old != val => Some(old),
            _ => None,
        }
    }
}

#[test]
fn test_change_detector() {
    let mut cd = ChangeDetector::new();
    assert_eq!(cd.update(1), None);
    assert_eq!(cd.update(1), None);
    assert_eq!(cd.update(2), Some(1));
    assert_eq!(cd.update(2), None);
    assert_eq!(cd.update(3), Some(2));
}
