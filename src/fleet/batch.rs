//! Outstanding-operation counter for bulk dispatches.

use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::device::Operation;
use crate::error::{Error, Result};
use crate::events::{EventBus, FleetEvent};

/// Tracks the one batch that may be in flight.
///
/// `begin` moves the counter from zero to the batch size in one step, so a
/// second batch can never start while the first is settling. Each finished
/// action calls `settle`; the call that brings the counter back to zero emits
/// the single `BatchFinished` event.
#[derive(Debug)]
pub struct BatchTracker {
    outstanding: AtomicUsize,
    current: Mutex<Option<Operation>>,
    events: EventBus,
}

impl BatchTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            current: Mutex::new(None),
            events,
        }
    }

    /// Starts a batch of `size` operations, or fails with [`Error::Busy`].
    pub fn begin(&self, operation: Operation, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        // The label lock is held across the counter change so `settle` always
        // takes the label of the batch it finishes
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        self.outstanding
            .compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire)
            .map_err(Error::Busy)?;

        *current = Some(operation);
        debug!("Batch {} started with {} operation(s)", operation, size);
        self.events.emit(FleetEvent::BatchStarted {
            operation,
            devices: size,
        });
        Ok(())
    }

    /// Records one finished operation. Returns true if it was the last one.
    pub fn settle(&self) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                if let Some(operation) = current.take() {
                    debug!("Batch {} finished", operation);
                    self.events.emit(FleetEvent::BatchFinished { operation });
                }
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("Settled an operation while no batch was in flight");
                false
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding() != 0
    }

    /// Abandons the current batch without an event.
    pub fn reset(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        self.outstanding.store(0, Ordering::Release);
        current.take();
    }
}
