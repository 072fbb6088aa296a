use std::time::Duration;

/// Waits the same amount of time between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    duration: Duration,
}

impl Interval {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.duration)
    }
}
