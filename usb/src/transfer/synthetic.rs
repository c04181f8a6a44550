// An in-process loopback transport. Capture buffers are filled from a
// generator when submitted and playback buffers are handed to a consumer, so
// the whole stream can run without hardware.
use crate::transfer::{
    BulkTransport, Completion, TransferBuffer, TransferError, TransferStatus,
};
use std::collections::VecDeque;
use std::thread::sleep;
use std::time::Duration;

type Generator = Box<dyn FnMut(&mut [u8]) + Send>;
type Consumer = Box<dyn FnMut(&[u8]) + Send>;

pub struct SyntheticSlot {
    index: usize,
    buffer: Vec<u8>,
}

impl TransferBuffer for SyntheticSlot {
    fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

#[derive(Default)]
pub struct SyntheticTransport {
    generator: Option<Generator>,
    consumer: Option<Consumer>,
    pending: VecDeque<Completion>,
    latency: Duration,
    submissions: usize,
    fail_submission: Option<usize>,
    fail_every: Option<usize>,
    waits: usize,
    fail_wait: Option<usize>,
    cancels: usize,
    fail_cancel: Option<usize>,
    short_by: usize,
}

impl SyntheticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills each submitted buffer, as a device streaming to the host would.
    pub fn with_generator<F: FnMut(&mut [u8]) + Send + 'static>(mut self, generator: F) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    /// Receives each submitted buffer, as a device accepting samples would.
    pub fn with_consumer<F: FnMut(&[u8]) + Send + 'static>(mut self, consumer: F) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Delay applied to every `wait` that has completions to deliver.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The nth submission (counting from 1) is refused.
    pub fn fail_submission(mut self, nth: usize) -> Self {
        self.fail_submission = Some(nth);
        self
    }

    /// Every nth submission completes with a transfer error.
    pub fn fail_every(mut self, nth: usize) -> Self {
        self.fail_every = Some(nth);
        self
    }

    /// The nth `wait` (counting from 1) fails without delivering anything.
    pub fn fail_wait(mut self, nth: usize) -> Self {
        self.fail_wait = Some(nth);
        self
    }

    /// The nth cancellation request (counting from 1) is refused and the
    /// transfer completes normally.
    pub fn fail_cancel(mut self, nth: usize) -> Self {
        self.fail_cancel = Some(nth);
        self
    }

    /// Completed transfers report this many bytes fewer than requested.
    pub fn short_by(mut self, bytes: usize) -> Self {
        self.short_by = bytes;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }
}

impl BulkTransport for SyntheticTransport {
    type Slot = SyntheticSlot;

    fn allocate(&mut self, index: usize, length: usize) -> Result<SyntheticSlot, rusb::Error> {
        Ok(SyntheticSlot {
            index,
            buffer: vec![0; length],
        })
    }

    fn submit(&mut self, slot: &mut SyntheticSlot) -> Result<(), rusb::Error> {
        self.submissions += 1;
        if self.fail_submission == Some(self.submissions) {
            return Err(rusb::Error::Io);
        }

        if let Some(generator) = self.generator.as_mut() {
            generator(&mut slot.buffer);
        }
        if let Some(consumer) = self.consumer.as_mut() {
            consumer(&slot.buffer);
        }

        let failed = self
            .fail_every
            .is_some_and(|nth| self.submissions % nth == 0);
        let completion = if failed {
            Completion {
                slot: slot.index,
                status: TransferStatus::Failed(TransferError::Error),
                actual_length: 0,
            }
        } else {
            Completion {
                slot: slot.index,
                status: TransferStatus::Completed,
                actual_length: slot.buffer.len().saturating_sub(self.short_by),
            }
        };
        self.pending.push_back(completion);
        Ok(())
    }

    fn cancel(&mut self, slot: &mut SyntheticSlot) -> Result<(), rusb::Error> {
        self.cancels += 1;
        if self.fail_cancel == Some(self.cancels) {
            return Err(rusb::Error::Io);
        }

        let pending = self
            .pending
            .iter_mut()
            .find(|c| c.slot == slot.index && c.status != TransferStatus::Cancelled)
            .ok_or(rusb::Error::NotFound)?;
        pending.status = TransferStatus::Cancelled;
        pending.actual_length = 0;
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), rusb::Error> {
        self.waits += 1;
        if self.fail_wait == Some(self.waits) {
            return Err(rusb::Error::Io);
        }

        if self.pending.is_empty() {
            sleep(timeout);
            return Ok(());
        }
        if !self.latency.is_zero() {
            sleep(self.latency.min(timeout));
        }
        completions.extend(self.pending.drain(..));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_fills_submitted_buffers() {
        let mut transport = SyntheticTransport::new().with_generator(|buffer| buffer.fill(0x5a));
        let mut slot = transport.allocate(0, 8).unwrap();
        transport.submit(&mut slot).unwrap();
        assert_eq!(slot.as_slice(), &[0x5a; 8]);

        let mut completions = vec![];
        transport
            .wait(Duration::from_millis(1), &mut completions)
            .unwrap();
        assert_eq!(
            completions,
            vec![Completion {
                slot: 0,
                status: TransferStatus::Completed,
                actual_length: 8
            }]
        );
    }

    #[test]
    fn cancel_after_delivery_is_not_found() {
        let mut transport = SyntheticTransport::new();
        let mut slot = transport.allocate(1, 4).unwrap();
        transport.submit(&mut slot).unwrap();
        transport.cancel(&mut slot).unwrap();
        assert_eq!(transport.cancel(&mut slot), Err(rusb::Error::NotFound));

        let mut completions = vec![];
        transport
            .wait(Duration::from_millis(1), &mut completions)
            .unwrap();
        assert_eq!(completions[0].status, TransferStatus::Cancelled);
        assert_eq!(transport.cancel(&mut slot), Err(rusb::Error::NotFound));
    }

    #[test]
    fn refused_cancel_leaves_the_transfer_running() {
        let mut transport = SyntheticTransport::new().fail_cancel(1);
        let mut slot = transport.allocate(0, 4).unwrap();
        transport.submit(&mut slot).unwrap();
        assert_eq!(transport.cancel(&mut slot), Err(rusb::Error::Io));

        let mut completions = vec![];
        transport
            .wait(Duration::from_millis(1), &mut completions)
            .unwrap();
        assert_eq!(completions[0].status, TransferStatus::Completed);
    }

    #[test]
    fn failed_wait_keeps_completions_pending() {
        let mut transport = SyntheticTransport::new().fail_wait(1);
        let mut slot = transport.allocate(0, 4).unwrap();
        transport.submit(&mut slot).unwrap();

        let mut completions = vec![];
        assert_eq!(
            transport.wait(Duration::from_millis(1), &mut completions),
            Err(rusb::Error::Io)
        );
        assert!(completions.is_empty());
        transport
            .wait(Duration::from_millis(1), &mut completions)
            .unwrap();
        assert_eq!(completions.len(), 1);
    }

    #[test]
    fn injected_failures() {
        let mut transport = SyntheticTransport::new().fail_every(2).fail_submission(3);
        let mut slot = transport.allocate(0, 4).unwrap();
        transport.submit(&mut slot).unwrap();
        transport.submit(&mut slot).unwrap();
        assert_eq!(transport.submit(&mut slot), Err(rusb::Error::Io));

        let mut completions = vec![];
        transport
            .wait(Duration::from_millis(1), &mut completions)
            .unwrap();
        let statuses: Vec<_> = completions.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                TransferStatus::Completed,
                TransferStatus::Failed(TransferError::Error)
            ]
        );
    }
}
