/*!
Serialized application of inbound control commands.

Raw control messages are queued by the transport through a [`ControlInbox`]
and consumed by a single [`ControlLoop`] thread. The queue plays the role of
a counting semaphore: every delivered message is one pending wake-up, and
each wake-up applies exactly one command. Because there is only one
consumer, no two commands are ever applied at the same time, and bursts
simply wait in the queue while the output is busy.
*/

use crate::applicator::{Applied, ControlFrameApplicator};
use crate::hardware::HardwareError;
use crate::transport::Transport;
use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use shared::{ControlCommand, ProtocolState, SharedError};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How often an idle loop re-checks the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from decoding or applying one control message
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("failed to decode control frame: {0}")]
    Decode(#[from] SharedError),

    #[error("invalid control frame: {0}")]
    Invalid(String),

    #[error("failed to apply control")]
    ApplyFailed {
        /// State to commit despite the failure
        state: ProtocolState,
        #[source]
        source: HardwareError,
    },
}

/// Create the control queue: a cloneable inbox and its single consumer end
pub fn queue() -> (ControlInbox, Receiver<Vec<u8>>) {
    let (tx, rx) = unbounded();
    (ControlInbox { tx }, rx)
}

/// Producer side of the control queue; never blocks
#[derive(Debug, Clone)]
pub struct ControlInbox {
    tx: Sender<Vec<u8>>,
}

impl ControlInbox {
    /// Queue the first `len` bytes of `bytes` as one control message.
    ///
    /// Returns false once the control loop has gone away.
    pub fn deliver(&self, bytes: &[u8], len: usize) -> bool {
        let message = bytes[..len.min(bytes.len())].to_vec();
        if self.tx.send(message).is_err() {
            warn!("Control loop stopped, dropping {} byte control message", len);
            return false;
        }
        true
    }

    /// Messages waiting to be applied
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// What the control loop is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlPhase {
    Idle = 0,
    Applying = 1,
}

/// Shared, lock-free view of the control loop phase
#[derive(Debug, Clone, Default)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn get(&self) -> ControlPhase {
        match self.0.load(Ordering::SeqCst) {
            1 => ControlPhase::Applying,
            _ => ControlPhase::Idle,
        }
    }

    fn set(&self, phase: ControlPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStats {
    pub applied: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Single consumer of the control queue
pub struct ControlLoop {
    applicator: ControlFrameApplicator,
    state: Arc<ArcSwap<ProtocolState>>,
    transport: Arc<dyn Transport>,
    queue: Receiver<Vec<u8>>,
    phase: PhaseCell,
    running: Arc<AtomicBool>,
}

impl ControlLoop {
    pub fn new(
        applicator: ControlFrameApplicator,
        state: Arc<ArcSwap<ProtocolState>>,
        transport: Arc<dyn Transport>,
        queue: Receiver<Vec<u8>>,
        phase: PhaseCell,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            applicator,
            state,
            transport,
            queue,
            phase,
            running,
        }
    }

    /// Run until the running flag is cleared or every inbox is dropped
    pub fn run(mut self) -> ControlStats {
        let mut stats = ControlStats::default();
        info!("🎛️ Control loop started");

        while self.running.load(Ordering::SeqCst) {
            match self.queue.recv_timeout(POLL_INTERVAL) {
                Ok(bytes) => self.handle(&bytes, &mut stats),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Control queue disconnected");
                    break;
                }
            }
        }

        info!("📊 Control loop final stats:");
        info!("   Applied: {}", stats.applied);
        info!("   Failed: {}", stats.failed);
        info!("   Rejected: {}", stats.rejected);
        stats
    }

    /// Decode and apply exactly one message, committing the resulting state.
    ///
    /// After an output failure the committed state keeps `output_success`
    /// cleared until the failure has been reported.
    pub fn process(&mut self, bytes: &[u8]) -> Result<Applied, ControlError> {
        self.phase.set(ControlPhase::Applying);
        let result = self.apply_bytes(bytes);
        self.phase.set(ControlPhase::Idle);
        result
    }

    fn apply_bytes(&mut self, bytes: &[u8]) -> Result<Applied, ControlError> {
        let command = ControlCommand::decode(bytes)?;
        let current: ProtocolState = **self.state.load();

        match self.applicator.apply(&command, &current) {
            Ok(applied) => {
                self.commit(&current, applied.state);
                Ok(applied)
            }
            Err(ControlError::ApplyFailed { state, source }) => {
                self.commit(&current, state);
                Err(ControlError::ApplyFailed { state, source })
            }
            Err(e) => Err(e),
        }
    }

    fn commit(&self, current: &ProtocolState, next: ProtocolState) {
        if next != *current {
            self.state.store(Arc::new(next));
        }
    }

    /// Mark the output healthy again once a failure has been reported
    fn reset_output_flag(&self) {
        let current: ProtocolState = **self.state.load();
        self.commit(
            &current,
            ProtocolState {
                output_success: true,
                ..current
            },
        );
    }

    fn handle(&mut self, bytes: &[u8], stats: &mut ControlStats) {
        match self.process(bytes) {
            Ok(applied) => {
                stats.applied += 1;
                debug!("Control applied: {:?}", applied);
            }
            Err(e @ ControlError::ApplyFailed { .. }) => {
                stats.failed += 1;
                error!("❌ {}: {:?}", e, std::error::Error::source(&e));
                self.transport.report_error(&e.to_string());
                self.reset_output_flag();
            }
            Err(e) => {
                stats.rejected += 1;
                warn!("⚠️ Rejected control message: {}", e);
                self.transport.report_error(&e.to_string());
            }
        }
    }
}
