//! Call counting and failure injection for the in-memory brokers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::TransportError;

/// Transport operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    // AMQP
    Init,
    Publish,
    CreateSubscriber,
    // Log broker
    ProducerConnect,
    Send,
    ProducerDisconnect,
    ConsumerConnect,
    Subscribe,
    Run,
    ConsumerDisconnect,
}

#[derive(Debug, Default)]
struct FaultState {
    calls: HashMap<Operation, usize>,
    planned: HashMap<(Operation, usize), String>,
    always: HashMap<Operation, String>,
}

/// Failure plan shared by every handle of an in-memory broker.
///
/// ```
/// use broker_bus::memory::{Faults, Operation};
///
/// let faults = Faults::default();
/// faults.fail_on(Operation::Subscribe, 2, "Topic does not exist");
///
/// assert!(faults.check(Operation::Subscribe).is_ok());
/// assert_eq!(
///     faults.check(Operation::Subscribe).unwrap_err().message(),
///     "Topic does not exist"
/// );
/// assert!(faults.check(Operation::Subscribe).is_ok());
/// assert_eq!(faults.calls(Operation::Subscribe), 3);
/// ```
#[derive(Debug, Default)]
pub struct Faults {
    state: Mutex<FaultState>,
}

impl Faults {
    /// Make the `nth` call (1-based) of `operation` fail with `message`.
    pub fn fail_on(&self, operation: Operation, nth: usize, message: impl Into<String>) {
        self.lock().planned.insert((operation, nth), message.into());
    }

    /// Make every call of `operation` fail until [`Faults::clear`].
    pub fn fail_always(&self, operation: Operation, message: impl Into<String>) {
        self.lock().always.insert(operation, message.into());
    }

    /// Remove every planned failure for `operation`.
    pub fn clear(&self, operation: Operation) {
        let mut state = self.lock();
        state.always.remove(&operation);
        state.planned.retain(|(op, _), _| *op != operation);
    }

    /// How many times `operation` has been attempted.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Count one call of `operation` and return its planned failure, if any.
    pub fn check(&self, operation: Operation) -> Result<(), TransportError> {
        let mut state = self.lock();
        let count = state.calls.entry(operation).or_insert(0);
        *count += 1;
        let nth = *count;

        if let Some(message) = state.always.get(&operation) {
            return Err(TransportError::new(message.clone()));
        }
        match state.planned.remove(&(operation, nth)) {
            Some(message) => Err(TransportError::new(message)),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
