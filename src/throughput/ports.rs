//! Port allocation for concurrent client/server pairs

use crate::error::{BenchError, BenchResult};
use std::collections::HashSet;

/// Contiguous block of TCP ports, one per client/server pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    base: u16,
    len: u16,
}

impl PortRange {
    /// Reserve `count` ports starting at `base`.
    ///
    /// Fails when the range would run past port 65535 or is empty.
    pub fn allocate(base: u16, count: usize) -> BenchResult<Self> {
        if base == 0 {
            return Err(BenchError::InvalidConfig(
                "base port must be non-zero".to_string(),
            ));
        }
        if count == 0 {
            return Err(BenchError::InvalidConfig(
                "at least one client/server pair is required".to_string(),
            ));
        }

        let fits = (base as usize)
            .checked_add(count - 1)
            .map_or(false, |last| last <= u16::MAX as usize);
        if !fits {
            return Err(BenchError::InvalidConfig(format!(
                "{} ports starting at {} run past port {}",
                count,
                base,
                u16::MAX
            )));
        }

        Ok(Self {
            base,
            len: count as u16,
        })
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        let base = self.base;
        (0..self.len).map(move |offset| base + offset)
    }
}

/// Check that no port is handed to two pairs
pub fn ensure_disjoint(ports: &[u16]) -> BenchResult<()> {
    let mut seen = HashSet::with_capacity(ports.len());
    for &port in ports {
        if !seen.insert(port) {
            return Err(BenchError::PortAllocationConflict { port });
        }
    }
    Ok(())
}
