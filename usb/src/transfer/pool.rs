use crate::error::StreamError;
use crate::transfer::{BulkTransport, Completion, TransferBuffer, TransferStatus};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Consecutive event handling failures tolerated while waiting for
/// transfers to come back.
pub const MAX_WAIT_ERRORS: usize = 10;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
    Completed(TransferStatus),
}

struct Slot<S> {
    inner: S,
    state: SlotState,
}

/// A fixed set of transfers over one transport. A buffer can only be touched
/// while its transfer is not in flight.
pub struct TransferPool<B: BulkTransport> {
    transport: B,
    slots: Vec<Slot<B::Slot>>,
    transfer_size: usize,
    in_flight: Arc<AtomicUsize>,
}

impl<B: BulkTransport> TransferPool<B> {
    pub fn new(
        mut transport: B,
        queue_depth: usize,
        transfer_size: usize,
    ) -> Result<Self, StreamError> {
        if queue_depth == 0 || transfer_size == 0 {
            return Err(StreamError::InvalidState("empty"));
        }

        let mut slots = Vec::with_capacity(queue_depth);
        for index in 0..queue_depth {
            let inner = transport
                .allocate(index, transfer_size)
                .map_err(|source| StreamError::Allocation {
                    slot: index,
                    source,
                })?;
            slots.push(Slot {
                inner,
                state: SlotState::Idle,
            });
        }
        debug!(
            "Allocated {} transfers of {} bytes",
            queue_depth, transfer_size
        );

        Ok(Self {
            transport,
            slots,
            transfer_size,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.slots.len()
    }

    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    pub fn submitted_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Submitted)
            .count()
    }

    pub fn buffer(&self, index: usize) -> Option<&[u8]> {
        match self.slots.get(index) {
            Some(slot) if slot.state != SlotState::Submitted => Some(slot.inner.as_slice()),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.state != SlotState::Submitted => Some(slot.inner.as_mut_slice()),
            _ => None,
        }
    }

    pub fn submit(&mut self, index: usize) -> Result<(), StreamError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(StreamError::InvalidState("out of range"))?;
        if slot.state == SlotState::Submitted {
            return Err(StreamError::InvalidState("already submitted"));
        }

        // Counted before submission, the completion may race ahead of us.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(source) = self.transport.submit(&mut slot.inner) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(StreamError::SubmissionFailed {
                slot: index,
                source,
            });
        }
        slot.state = SlotState::Submitted;
        Ok(())
    }

    /// Submits every idle slot. On failure the ones already submitted are
    /// cancelled and drained before the error is returned.
    pub fn submit_all(&mut self) -> Result<(), StreamError> {
        for index in 0..self.slots.len() {
            if self.slots[index].state == SlotState::Submitted {
                continue;
            }
            if let Err(error) = self.submit(index) {
                warn!("Submission failed, rolling back: {}", error);
                self.cancel_all();
                self.drain()?;
                return Err(error);
            }
        }
        Ok(())
    }

    /// Requests cancellation of everything in flight, returning the number
    /// of failed requests. Transfers that already finished are not failures.
    pub fn cancel_all(&mut self) -> usize {
        let mut failures = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state != SlotState::Submitted {
                continue;
            }
            match self.transport.cancel(&mut slot.inner) {
                Ok(()) | Err(rusb::Error::NotFound) => {}
                Err(error) => {
                    warn!("Unable to cancel transfer {}: {}", index, error);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Waits for events, marking the slots of finished transfers.
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<Completion>, StreamError> {
        let mut completions = Vec::new();
        self.transport.wait(timeout, &mut completions)?;

        completions.retain(|completion| match self.slots.get_mut(completion.slot) {
            Some(slot) if slot.state == SlotState::Submitted => {
                slot.state = SlotState::Completed(completion.status);
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                true
            }
            _ => {
                warn!("Ignoring completion for idle transfer {}", completion.slot);
                false
            }
        });
        Ok(completions)
    }

    /// Waits until nothing is in flight, discarding the completions. Gives
    /// up after `MAX_WAIT_ERRORS` failed waits in a row.
    pub fn drain(&mut self) -> Result<(), StreamError> {
        let mut errors = 0;
        while self.submitted_count() > 0 {
            match self.wait(DRAIN_TIMEOUT) {
                Ok(_) => errors = 0,
                Err(error) => {
                    errors += 1;
                    warn!("Waiting for transfers failed ({}): {}", errors, error);
                    if errors >= MAX_WAIT_ERRORS {
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }
}

impl<B: BulkTransport> Drop for TransferPool<B> {
    fn drop(&mut self) {
        // Buffers must never be released while the transport can still write them.
        if self.submitted_count() > 0 {
            warn!("Transfer pool dropped with transfers in flight, cancelling");
            self.cancel_all();
            if let Err(error) = self.drain() {
                warn!("Unable to drain transfers: {}", error);
            }
        }

        let mut leaked = 0;
        for slot in self.slots.drain(..) {
            if slot.state == SlotState::Submitted {
                std::mem::forget(slot.inner);
                leaked += 1;
            }
        }
        if leaked > 0 {
            error!("Leaking {} transfers still owned by the transport", leaked);
        }
    }
}
