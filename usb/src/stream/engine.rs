use crate::error::StreamError;
use crate::stream::stats::{StatisticsCollector, StreamStats};
use crate::stream::transform::{BufferOutcome, Transform};
use crate::transfer::{BulkTransport, Completion, TransferPool, TransferStatus, MAX_WAIT_ERRORS};
use dfc_types::StreamDirection;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    EndOfStream,
    ResubmitFailed,
    /// Every transfer finished without being resubmitted.
    Drained,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub packets_per_transfer: usize,
    pub packet_size: usize,
    pub queue_depth: usize,
    pub event_timeout: Duration,
}

impl StreamConfig {
    pub fn transfer_size(&self) -> usize {
        self.packets_per_transfer * self.packet_size
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            packets_per_transfer: 16,
            packet_size: 16 * 1024,
            queue_depth: 16,
            event_timeout: Duration::from_millis(100),
        }
    }
}

/// Lets another thread stop a running stream and watch it wind down.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Keeps a pool of bulk transfers in flight for one direction, handing each
/// finished buffer to the transform before resubmitting it.
pub struct StreamEngine<B: BulkTransport> {
    pool: TransferPool<B>,
    transform: Transform,
    stats: StatisticsCollector,
    state: EngineState,
    stop: Arc<AtomicBool>,
    stop_reason: Option<StopReason>,
    event_timeout: Duration,
}

impl<B: BulkTransport> StreamEngine<B> {
    pub fn new(
        transport: B,
        config: &StreamConfig,
        transform: Transform,
        histograms: bool,
    ) -> Result<Self, StreamError> {
        let pool = TransferPool::new(transport, config.queue_depth, config.transfer_size())?;
        Ok(Self {
            pool,
            transform,
            stats: StatisticsCollector::new(histograms),
            state: EngineState::Stopped,
            stop: Arc::new(AtomicBool::new(false)),
            stop_reason: None,
            event_timeout: config.event_timeout,
        })
    }

    pub fn direction(&self) -> StreamDirection {
        self.transform.direction()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn submitted_count(&self) -> usize {
        self.pool.submitted_count()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
            in_flight: self.pool.in_flight_counter(),
        }
    }

    fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&mut self, reason: StopReason) {
        self.stop_reason.get_or_insert(reason);
        self.stop.store(true, Ordering::Release);
    }

    /// Submits every transfer. If any submission fails nothing is left in
    /// flight and the engine stays stopped.
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.state != EngineState::Stopped {
            return Err(StreamError::InvalidState("already started"));
        }

        self.state = EngineState::Starting;
        self.stop.store(false, Ordering::Release);
        self.stop_reason = None;

        if let Err(error) = self.pool.submit_all() {
            self.state = EngineState::Stopped;
            return Err(error);
        }

        info!(
            "Streaming {} with {} transfers of {} bytes",
            self.direction(),
            self.pool.queue_depth(),
            self.pool.transfer_size()
        );
        self.state = EngineState::Running;
        Ok(())
    }

    /// Handles whatever completes within `timeout`.
    pub fn poll(&mut self, timeout: Duration) -> Result<(), StreamError> {
        for completion in self.pool.wait(timeout)? {
            self.handle_completion(completion);
        }

        if self.state == EngineState::Running
            && !self.is_stop_requested()
            && self.pool.submitted_count() == 0
        {
            warn!("No transfers left in flight");
            self.request_stop(StopReason::Drained);
        }
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion.status {
            TransferStatus::Completed => {
                self.stats.record_success();

                let direction = self.transform.direction();
                let Some(buffer) = self.pool.buffer_mut(completion.slot) else {
                    warn!("Completion for unknown transfer {}", completion.slot);
                    return;
                };
                let length = match direction {
                    StreamDirection::Capture => completion.actual_length.min(buffer.len()),
                    StreamDirection::Playback => buffer.len(),
                };
                let outcome = self
                    .transform
                    .on_buffer_ready(&mut buffer[..length], &mut self.stats);
                if outcome == BufferOutcome::EndOfStream {
                    self.request_stop(StopReason::EndOfStream);
                }
            }
            TransferStatus::Cancelled => {
                debug!("Transfer {} cancelled", completion.slot);
                return;
            }
            TransferStatus::Failed(error) => {
                // The slot is retired, the rest of the queue keeps streaming.
                self.stats.record_failure();
                warn!("Transfer {} failed: {:?}", completion.slot, error);
                return;
            }
        }

        if self.state == EngineState::Running && !self.is_stop_requested() {
            if let Err(error) = self.pool.submit(completion.slot) {
                error!("Unable to resubmit: {}", error);
                self.request_stop(StopReason::ResubmitFailed);
            }
        }
    }

    /// Pumps events until a stop is requested or the stream ends on its own,
    /// then stops.
    pub fn run(&mut self) -> Result<StopReason, StreamError> {
        if self.state == EngineState::Stopped {
            self.start()?;
        }

        while !self.is_stop_requested() {
            if let Err(error) = self.poll(self.event_timeout) {
                error!("Event handling failed, stopping: {}", error);
                if let Err(stop_error) = self.stop() {
                    warn!("Unable to stop cleanly: {}", stop_error);
                }
                return Err(error);
            }
        }

        self.stop()?;
        Ok(self.stop_reason.unwrap_or(StopReason::Requested))
    }

    /// Cancels everything in flight and waits for every transfer to come
    /// back. Finished transfers that could not be cancelled are benign.
    pub fn stop(&mut self) -> Result<(), StreamError> {
        if self.state == EngineState::Stopped {
            return Ok(());
        }

        self.state = EngineState::Stopping;
        self.request_stop(StopReason::Requested);
        debug!("Stopping, {} transfers in flight", self.pool.in_flight());

        let failures = self.pool.cancel_all();
        let mut wait_errors = 0;
        while self.pool.submitted_count() > 0 {
            match self.pool.wait(self.event_timeout) {
                Ok(completions) => {
                    wait_errors = 0;
                    for completion in completions {
                        self.handle_completion(completion);
                    }
                }
                Err(error) => {
                    wait_errors += 1;
                    warn!("Waiting for cancelled transfers failed: {}", error);
                    if wait_errors >= MAX_WAIT_ERRORS {
                        // Left in Stopping, the pool keeps the stuck buffers alive.
                        return Err(error);
                    }
                }
            }
        }

        self.transform.finish();
        self.state = EngineState::Stopped;

        if failures > 0 {
            return Err(StreamError::CancelFailed(failures));
        }
        Ok(())
    }

    pub fn stats(&self, duration: Duration) -> StreamStats {
        self.stats
            .snapshot(self.direction(), duration, self.stop_reason)
    }

    pub fn statistics(&self) -> &StatisticsCollector {
        &self.stats
    }

    pub fn into_statistics(self) -> StatisticsCollector {
        self.stats
    }
}
