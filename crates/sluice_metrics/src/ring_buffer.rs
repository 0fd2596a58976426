//! Sliding window of the most recent samples

use std::collections::VecDeque;
use std::time::Duration;

/// Keeps at most `capacity` samples, oldest first. A full window evicts its
/// oldest sample on push.
#[derive(Debug)]
pub struct RingBuffer<T> {
    window: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    pub fn latest(&self) -> Option<&T> {
        self.window.back()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

impl RingBuffer<Duration> {
    pub fn average(&self) -> Duration {
        match self.window.len() {
            0 => Duration::ZERO,
            n => self.window.iter().sum::<Duration>() / n as u32,
        }
    }

    /// `(shortest, longest)`, or zeros when empty.
    pub fn min_max(&self) -> (Duration, Duration) {
        let mut samples = self.window.iter().copied();
        let Some(first) = samples.next() else {
            return (Duration::ZERO, Duration::ZERO);
        };
        samples.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)))
    }
}
