//! Batch event consumer running on a dedicated thread.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::barrier::SequenceBarrier;
use crate::buffer::SlotArray;
use crate::sequence::Sequence;
use crate::wait::WaitError;

/// Error type surfaced by handlers; faulted sequences are skipped, not
/// retried.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for every published event.
///
/// `end_of_batch` is true exactly once per wake-up, on the latest available
/// sequence, letting handlers flush per-batch state.
pub trait EventHandler<T>: Send {
    fn on_event(&mut self, event: &T, sequence: i64, end_of_batch: bool)
        -> Result<(), HandlerError>;

    /// Invoked when `on_event` fails. Processing resumes at the next
    /// sequence; the faulted one is not retried.
    fn on_error(&mut self, sequence: i64, error: HandlerError) {
        warn!(sequence, error = %error, "event handler failed, skipping sequence");
    }

    fn on_start(&mut self) {}
    fn on_shutdown(&mut self) {}
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_HALTING: u8 = 2;

/// Consumes published events in batches on its own thread.
///
/// Start and stop are idempotent and thread-safe (CAS on the state flag).
/// Shutdown waits a bounded time for the processing thread to exit; alert
/// signals raised during shutdown are expected and swallowed.
pub struct BatchConsumer<T: Send + 'static> {
    buffer: Arc<SlotArray<T>>,
    barrier: Arc<SequenceBarrier>,
    sequence: Arc<Sequence>,
    state: Arc<AtomicU8>,
    thread: parking_lot::Mutex<Option<(std::thread::JoinHandle<()>, mpsc::Receiver<()>)>>,
    handler: parking_lot::Mutex<Option<Box<dyn EventHandler<T>>>>,
}

impl<T: Send + 'static> BatchConsumer<T> {
    pub fn new(
        buffer: Arc<SlotArray<T>>,
        barrier: SequenceBarrier,
        sequence: Arc<Sequence>,
        handler: impl EventHandler<T> + 'static,
    ) -> Self {
        Self {
            buffer,
            barrier: Arc::new(barrier),
            sequence,
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            thread: parking_lot::Mutex::new(None),
            handler: parking_lot::Mutex::new(Some(Box::new(handler))),
        }
    }

    /// The consumer's gating sequence (register it with the sequencer).
    pub fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(&self.sequence)
    }

    pub fn barrier(&self) -> Arc<SequenceBarrier> {
        Arc::clone(&self.barrier)
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    /// Start processing. Returns false if already running.
    pub fn start(&self) -> bool {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let mut handler = match self.handler.lock().take() {
            Some(h) => h,
            None => {
                // Handler consumed by a previous run that was never restarted.
                self.state.store(STATE_IDLE, Ordering::SeqCst);
                return false;
            }
        };

        self.barrier.clear_alert();

        let buffer = Arc::clone(&self.buffer);
        let barrier = Arc::clone(&self.barrier);
        let sequence = Arc::clone(&self.sequence);
        let state = Arc::clone(&self.state);
        let (exit_tx, exit_rx) = mpsc::channel();

        let join = std::thread::spawn(move || {
            handler.on_start();
            Self::run(&buffer, &barrier, &sequence, &state, handler.as_mut());
            handler.on_shutdown();
            let _ = exit_tx.send(());
        });

        *self.thread.lock() = Some((join, exit_rx));
        true
    }

    fn run(
        buffer: &SlotArray<T>,
        barrier: &SequenceBarrier,
        sequence: &Sequence,
        state: &AtomicU8,
        handler: &mut dyn EventHandler<T>,
    ) {
        let mut next = sequence.get() + 1;

        loop {
            match barrier.wait_for(next) {
                Ok(available) => {
                    while next <= available {
                        // Safety: `next..=available` was published and this
                        // consumer's gating sequence still trails it, so the
                        // slot is immutable while we read.
                        let event = unsafe { buffer.slot(next) };
                        if let Err(error) = handler.on_event(event, next, next == available) {
                            handler.on_error(next, error);
                        }
                        next += 1;
                    }
                    sequence.set(available);
                }
                Err(WaitError::Alerted) => {
                    if state.load(Ordering::SeqCst) != STATE_RUNNING {
                        break;
                    }
                    // Alert without a halt: wait for clear_alert, then resume.
                    while barrier.is_alerted() && state.load(Ordering::SeqCst) == STATE_RUNNING {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(WaitError::Timeout) => continue,
            }
        }

        debug!(sequence = sequence.get(), "batch consumer exited");
    }

    /// Signal the processing thread to stop. Idempotent.
    pub fn halt(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_HALTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.barrier.alert();
        }
    }

    /// Halt and wait up to `timeout` for the thread to exit. Returns true if
    /// the thread exited within the bound.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.halt();

        let taken = self.thread.lock().take();
        let exited = match taken {
            Some((join, exit_rx)) => match exit_rx.recv_timeout(timeout) {
                Ok(()) => {
                    let _ = join.join();
                    true
                }
                Err(_) => {
                    warn!("batch consumer did not exit within shutdown timeout");
                    false
                }
            },
            None => true,
        };

        self.state.store(STATE_IDLE, Ordering::SeqCst);
        exited
    }
}
