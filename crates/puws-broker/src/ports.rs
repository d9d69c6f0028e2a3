//! Session port allocation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every port in the range is taken by a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free session ports in {0}")]
pub struct PortsExhausted(pub PortRange);

/// An inclusive range of session ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 5901,
            end: 5920,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest port in the range that is not in `occupied`.
    pub fn allocate(&self, occupied: &BTreeSet<u16>) -> Result<u16, PortsExhausted> {
        (self.start..=self.end)
            .find(|port| !occupied.contains(port))
            .ok_or(PortsExhausted(*self))
    }
}
