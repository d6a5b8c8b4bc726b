use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;

use crate::backend::spec::{BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed,
    /// The command group was captured into a graph instead of executing.
    Recorded,
}

#[derive(Debug, Clone)]
enum EventState {
    Pending,
    Complete,
    Failed(BackendError),
    Recorded,
}

struct EventInner {
    state: Mutex<EventState>,
    ready: Condvar,
}

/// Completion handle for a submission.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn with_state(state: EventState) -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(state),
                ready: Condvar::new(),
            }),
        }
    }

    pub(crate) fn pending() -> Self {
        Self::with_state(EventState::Pending)
    }

    pub(crate) fn recorded() -> Self {
        Self::with_state(EventState::Recorded)
    }

    pub(crate) fn completed(result: BackendResult<()>) -> Self {
        let event = Self::pending();
        event.resolve(result);
        event
    }

    pub(crate) fn resolve(&self, result: BackendResult<()>) {
        let mut state = self.inner.state.lock().expect("event mutex poisoned");
        *state = match result {
            Ok(()) => EventState::Complete,
            Err(err) => EventState::Failed(err),
        };
        self.inner.ready.notify_all();
    }

    pub(crate) fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn status(&self) -> EventStatus {
        match &*self.inner.state.lock().expect("event mutex poisoned") {
            EventState::Pending => EventStatus::Pending,
            EventState::Complete => EventStatus::Complete,
            EventState::Failed(_) => EventStatus::Failed,
            EventState::Recorded => EventStatus::Recorded,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() != EventStatus::Pending
    }

    /// Blocks until the submission finishes and returns the device result.
    pub(crate) fn block(&self) -> BackendResult<()> {
        let mut state = self.inner.state.lock().expect("event mutex poisoned");
        while matches!(*state, EventState::Pending) {
            state = self
                .inner
                .ready
                .wait(state)
                .expect("event mutex poisoned");
        }
        match &*state {
            EventState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Blocks until the submission finishes; reports the first device failure.
    pub fn wait(&self) -> Result<()> {
        self.block()?;
        Ok(())
    }
}
