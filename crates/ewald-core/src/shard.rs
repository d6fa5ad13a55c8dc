//! Contiguous partition of an indexed work list across the devices of one context.

use std::ops::Range;

use crate::domain::{EwaldError, EwaldResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardRange {
    pub start: usize,
    pub end: usize,
}

impl ShardRange {
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub const fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    pub const fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceShardSplitter {
    total: usize,
    devices: usize,
}

impl DeviceShardSplitter {
    pub fn new(total: usize, devices: usize) -> EwaldResult<Self> {
        if devices == 0 {
            return Err(EwaldError::configuration(
                "SHARD.NO_DEVICES",
                "a context needs at least one device",
            ));
        }
        Ok(Self { total, devices })
    }

    pub const fn total(&self) -> usize {
        self.total
    }

    pub const fn devices(&self) -> usize {
        self.devices
    }

    /// Share of device `device`: `[device * M / D, (device + 1) * M / D)`.
    pub fn share(&self, device: usize) -> ShardRange {
        let bound = |d: usize| ((d as u128 * self.total as u128) / self.devices as u128) as usize;
        ShardRange {
            start: bound(device),
            end: bound(device + 1),
        }
    }

    pub fn shares(&self) -> Vec<ShardRange> {
        (0..self.devices).map(|device| self.share(device)).collect()
    }
}
