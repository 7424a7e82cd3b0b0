use std::io::Result;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::ffi::syscall;

/// A batch of descriptors in transit between owners.
///
/// Collected descriptors close when the batch drops, so an error midway
/// through assembling a transfer cannot leak what was already gathered.
/// A completed batch is handed off whole with [`release`][Self::release].
#[derive(Default)]
pub struct PortTransfers {
    ports: Vec<OwnedFd>,
}

impl PortTransfers {
    pub fn new() -> PortTransfers {
        PortTransfers { ports: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> PortTransfers {
        PortTransfers {
            ports: Vec::with_capacity(capacity),
        }
    }

    /// Takes ownership of an already-open descriptor.
    pub fn push(&mut self, port: OwnedFd) {
        self.ports.push(port);
    }

    /// Duplicates a borrowed descriptor into the batch.
    pub fn acquire(&mut self, port: BorrowedFd<'_>) -> Result<()> {
        self.ports.push(syscall::dup_cloexec(port)?);
        Ok(())
    }

    pub fn ports(&self) -> &[OwnedFd] {
        &self.ports
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Transfers the collected descriptors out; nothing is closed.
    pub fn release(self) -> Vec<OwnedFd> {
        self.ports
    }
}

impl IntoIterator for PortTransfers {
    type Item = OwnedFd;
    type IntoIter = std::vec::IntoIter<OwnedFd>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.into_iter()
    }
}
