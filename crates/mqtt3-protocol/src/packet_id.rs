use crate::error::{MqttError, Result};

/// Per-session packet identifier sequence.
///
/// Ids increase monotonically, wrap from 65535 back to 1 and never repeat an
/// id the caller reports as still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIdAllocator {
    last: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Resumes the sequence after `last`, used when restoring a session.
    #[must_use]
    pub const fn starting_after(last: u16) -> Self {
        Self { last }
    }

    #[must_use]
    pub const fn last(&self) -> u16 {
        self.last
    }

    /// Returns the next id for which `in_use` is false.
    ///
    /// # Errors
    /// Returns `PacketIdExhausted` when all 65535 ids are outstanding.
    pub fn next(&mut self, in_use: impl Fn(u16) -> bool) -> Result<u16> {
        let mut candidate = self.last;
        for _ in 0..u16::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
            if !in_use(candidate) {
                self.last = candidate;
                return Ok(candidate);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }
}
