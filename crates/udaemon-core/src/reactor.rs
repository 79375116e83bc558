//! Descriptor registrations and the readiness wait of the event loop.

use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use crate::error::RuntimeError;
use crate::slots::{SlotId, Slots};

/// Interest/readiness mask of a descriptor (`POLLIN`, `POLLOUT`, ...).
pub type Interest = PollFlags;

/// Handle of a descriptor registration.
///
/// Valid until the registration is removed, either explicitly or because its
/// handler failed. Once removed, the handle is rejected with
/// [`RuntimeError::NotFound`] even if the slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) SlotId);

impl HandlerId {
    /// Table slot occupied by the registration.
    pub fn index(&self) -> usize {
        self.0.index
    }
}

/// Readiness information handed to a descriptor handler.
#[derive(Debug, Clone)]
pub struct Event {
    fd: RawFd,
    interest: Interest,
    readiness: PollFlags,
}

impl Event {
    pub(crate) fn new(fd: RawFd, interest: Interest, readiness: PollFlags) -> Self {
        Self {
            fd,
            interest,
            readiness,
        }
    }

    /// The descriptor that became ready.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Flags reported by the readiness wait.
    pub fn readiness(&self) -> PollFlags {
        self.readiness
    }

    /// Interest mask the descriptor is registered with.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Change the interest mask; applied once the handler returns.
    ///
    /// Clearing `POLLIN` after reading EOF keeps the handler from being
    /// called again for the same condition.
    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.contains(PollFlags::POLLIN)
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.contains(PollFlags::POLLOUT)
    }

    /// Peer hung up or the descriptor is in an error state.
    pub fn is_hangup(&self) -> bool {
        self.readiness
            .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
    }
}

#[derive(Debug)]
struct HandlerEntry<F> {
    fd: RawFd,
    interest: Interest,
    /// `None` while the handler is executing.
    callback: Option<F>,
}

/// Fixed-capacity table of descriptor registrations.
#[derive(Debug)]
pub(crate) struct HandlerTable<F> {
    slots: Slots<HandlerEntry<F>>,
}

impl<F> HandlerTable<F> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Slots::with_capacity(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: F,
    ) -> Result<HandlerId, RuntimeError> {
        if fd < 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "invalid file descriptor {}",
                fd
            )));
        }

        let entry = HandlerEntry {
            fd,
            interest,
            callback: Some(callback),
        };
        match self.slots.insert(entry) {
            Ok(id) => {
                debug!("Adding event handler for fd#{} at slot {}", fd, id.index);
                Ok(HandlerId(id))
            }
            Err(_) => Err(RuntimeError::ResourceExhausted {
                table: "handler",
                capacity: self.slots.capacity(),
            }),
        }
    }

    /// Free the slot, returning the descriptor it watched. Does not close it.
    pub(crate) fn unregister(&mut self, id: HandlerId) -> Result<RawFd, RuntimeError> {
        let entry = self.slots.remove(id.0).ok_or(RuntimeError::NotFound)?;
        debug!("Removing event handler for fd#{} at slot {}", entry.fd, id.index());
        Ok(entry.fd)
    }

    pub(crate) fn set_interest(&mut self, id: HandlerId, interest: Interest) -> Result<(), RuntimeError> {
        let entry = self.slots.get_mut(id.0).ok_or(RuntimeError::NotFound)?;
        entry.interest = interest;
        Ok(())
    }

    pub(crate) fn interest(&self, id: HandlerId) -> Option<Interest> {
        self.slots.get(id.0).map(|e| e.interest)
    }

    /// Take the callback out of a live registration for dispatch.
    pub(crate) fn take(&mut self, id: HandlerId) -> Option<(Event, F)> {
        let entry = self.slots.get_mut(id.0)?;
        let callback = entry.callback.take()?;
        Some((Event::new(entry.fd, entry.interest, PollFlags::empty()), callback))
    }

    /// Put a callback back after dispatch. Dropped if the registration was
    /// removed while it ran.
    pub(crate) fn restore(&mut self, id: HandlerId, callback: F, interest: Interest) {
        if let Some(entry) = self.slots.get_mut(id.0) {
            entry.callback = Some(callback);
            entry.interest = interest;
        }
    }

    /// Wait up to `timeout` for readiness on every registered descriptor.
    ///
    /// Returns the registrations with non-empty readiness, in slot order.
    /// An empty result means the wait timed out.
    pub(crate) fn wait(&self, timeout: PollTimeout) -> Result<Vec<(HandlerId, PollFlags)>, Errno> {
        let mut ids = Vec::with_capacity(self.slots.capacity());
        let mut fds: Vec<PollFd<'_>> = Vec::with_capacity(self.slots.capacity());
        for (id, entry) in self.slots.iter() {
            ids.push(HandlerId(id));
            // SAFETY: registrations require the descriptor to stay open until
            // it is unregistered; the borrow ends with this call.
            let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
            fds.push(PollFd::new(fd, entry.interest));
        }

        poll(&mut fds, timeout)?;

        Ok(ids
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(id, pfd)| {
                pfd.revents()
                    .filter(|revents| !revents.is_empty())
                    .map(|revents| (id, revents))
            })
            .collect())
    }

    /// Drop every registration, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        self.slots.clear()
    }
}

#[cfg(test)]
#[path = "reactor_tests.rs"]
mod tests;
