//! Fixed-capacity rolling history of scalar samples.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ring of the most recent `capacity` samples. Pushing onto a full buffer
/// evicts the oldest sample, so `len() <= capacity()` always holds.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl HistoryBuffer {
    /// A zero capacity is bumped to 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

/// The metrics the dispatcher keeps history for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cpu,
    Memory,
    DiskIo,
    NetIo,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Cpu, Metric::Memory, Metric::DiskIo, Metric::NetIo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
            Metric::DiskIo => "disk_io",
            Metric::NetIo => "net_io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_evicts_oldest_on_overflow() {
        let mut buf = HistoryBuffer::new(3);
        for v in 1..=5 {
            buf.push(v as f64);
        }
        assert_eq!(buf.to_vec(), vec![3.0, 4.0, 5.0]);
        assert_eq!(buf.latest(), Some(5.0));
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut buf = HistoryBuffer::new(0);
        buf.push(1.0);
        buf.push(2.0);
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.to_vec(), vec![2.0]);
    }

    proptest! {
        #[test]
        fn prop_length_never_exceeds_capacity(
            capacity in 1usize..128,
            values in proptest::collection::vec(-1e6f64..1e6, 0..600),
        ) {
            let mut buf = HistoryBuffer::new(capacity);
            for v in &values {
                buf.push(*v);
                prop_assert!(buf.len() <= capacity);
            }
            prop_assert_eq!(buf.len(), values.len().min(capacity));
            if let Some(last) = values.last() {
                prop_assert_eq!(buf.latest(), Some(*last));
            }
        }
    }
}
