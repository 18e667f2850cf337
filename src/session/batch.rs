//! Bounded accumulation of readings awaiting one persistence write

use crate::domain::Reading;

#[derive(Debug)]
pub struct Batch {
    capacity: usize,
    readings: Vec<Reading>,
}

impl Batch {
    /// Capacities below 1 are treated as 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            readings: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Append a reading; returns the full batch once capacity is reached
    pub fn push(&mut self, reading: Reading) -> Option<Vec<Reading>> {
        self.readings.push(reading);
        if self.readings.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.readings,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// Whatever is left, if anything
    pub fn take_remaining(&mut self) -> Option<Vec<Reading>> {
        if self.readings.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.readings))
        }
    }
}
