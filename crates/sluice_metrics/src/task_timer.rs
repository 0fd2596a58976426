//! Per-task execution timing

use super::ring_buffer::RingBuffer;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TaskTimer {
    durations: RingBuffer<Duration>,
}

impl TaskTimer {
    pub fn new(capacity: usize) -> Self {
        Self {
            durations: RingBuffer::new(capacity),
        }
    }

    pub fn begin(&self) -> Instant {
        Instant::now()
    }

    pub fn end(&mut self, started: Instant) {
        self.durations.push(started.elapsed());
    }

    pub fn samples(&self) -> usize {
        self.durations.len()
    }

    pub fn average_ms(&self) -> f64 {
        self.durations.average().as_secs_f64() * 1000.0
    }

    /// Duration of the most recent task.
    pub fn last_ms(&self) -> Option<f64> {
        self.durations.latest().map(|last| last.as_secs_f64() * 1000.0)
    }

    pub fn range_ms(&self) -> (f64, f64) {
        let (min, max) = self.durations.min_max();
        (min.as_secs_f64() * 1000.0, max.as_secs_f64() * 1000.0)
    }
}
