use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use anyhow::{bail, Context as _, Result};
use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::backend::spec::BackendError;
use crate::graph::{ExecutableGraph, GraphError, GraphShared, Operation};
use crate::memory::{any_conflict, AccessMode, AccessRecord, UsmPtr};

use super::context::Context;
use super::dispatch::{dispatch, lower};
use super::event::{Event, EventStatus};
use super::handler::CommandGroupHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueProperties {
    /// Commands complete in submission order.
    pub in_order: bool,
}

struct PendingRun {
    event: Event,
    accesses: Arc<[AccessRecord]>,
}

struct QueueInner {
    id: QueueId,
    context: Context,
    properties: QueueProperties,
    recording: Mutex<Option<Weak<GraphShared>>>,
    pending: Mutex<Vec<PendingRun>>,
}

/// Submission endpoint. Executes command groups immediately unless a graph is recording it.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub fn new(context: &Context) -> Self {
        Self::with_properties(context, QueueProperties::default())
    }

    pub fn in_order(context: &Context) -> Self {
        Self::with_properties(context, QueueProperties { in_order: true })
    }

    pub fn with_properties(context: &Context, properties: QueueProperties) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: context.next_queue_id(),
                context: context.clone(),
                properties,
                recording: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn properties(&self) -> QueueProperties {
        self.inner.properties
    }

    pub fn is_in_order(&self) -> bool {
        self.inner.properties.in_order
    }

    pub fn is_recording(&self) -> bool {
        self.active_recording().is_some()
    }

    fn active_recording(&self) -> Option<Arc<GraphShared>> {
        self.inner
            .recording
            .lock()
            .expect("queue recording slot poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn attach_recording(&self, graph: &Arc<GraphShared>) -> Result<(), GraphError> {
        let mut slot = self
            .inner
            .recording
            .lock()
            .expect("queue recording slot poisoned");
        if slot.as_ref().and_then(Weak::upgrade).is_some() {
            return Err(GraphError::QueueBusy { queue: self.id() });
        }
        *slot = Some(Arc::downgrade(graph));
        Ok(())
    }

    pub(crate) fn detach_recording(&self) {
        *self
            .inner
            .recording
            .lock()
            .expect("queue recording slot poisoned") = None;
    }

    pub(crate) fn build_operation<F>(&self, cgf: F) -> Result<Operation>
    where
        F: FnOnce(&mut CommandGroupHandler<'_>) -> Result<()>,
    {
        let mut handler = CommandGroupHandler::new(self);
        cgf(&mut handler)?;
        let (payload, accesses) = handler.finish()?;
        Ok(Operation::new(
            self.inner.context.next_operation_id(),
            self.id(),
            payload,
            accesses,
        ))
    }

    /// Submits a command group. While a graph records this queue the group is captured and the
    /// returned event reports [`EventStatus::Recorded`](super::EventStatus::Recorded).
    pub fn submit<F>(&self, cgf: F) -> Result<Event>
    where
        F: FnOnce(&mut CommandGroupHandler<'_>) -> Result<()>,
    {
        let operation = self.build_operation(cgf)?;
        if let Some(graph) = self.active_recording() {
            graph.capture(operation)?;
            return Ok(Event::recorded());
        }
        let command = lower(&self.inner.context, operation.payload())
            .with_context(|| format!("failed to lower {}", operation.label()))?;
        let result = self.exclusive(operation.accesses(), || {
            dispatch(&self.inner.context, &command)
        });
        if let Err(err) = &result {
            log::debug!("{} failed: {err}", operation.label());
        }
        Ok(Event::completed(result))
    }

    /// Launches one run of `graph` on a worker thread.
    pub fn submit_graph(&self, graph: &ExecutableGraph) -> Result<Event> {
        if self.is_recording() {
            return Err(GraphError::SubmitWhileRecording { queue: self.id() }.into());
        }
        if !graph.context().same_as(&self.inner.context) {
            bail!("executable graph belongs to a different context than queue {}", self.id());
        }

        let event = Event::pending();
        let blocking = self.register(&event, graph.accesses().into());
        let run_event = event.clone();
        let run_graph = graph.clone();
        let spawned = thread::Builder::new()
            .name(format!("cmdgraph-{}", self.id()))
            .spawn(move || {
                for earlier in blocking {
                    // failures are reported through the earlier run's own event
                    let _ = earlier.block();
                }
                let result = run_graph.run();
                if let Err(err) = &result {
                    log::debug!("graph run failed: {err}");
                }
                run_event.resolve(result);
            });
        if let Err(err) = spawned {
            event.resolve(Err(BackendError::execution(format!(
                "failed to spawn graph worker thread: {err}"
            ))));
            return Err(err).context("failed to spawn graph worker thread");
        }
        Ok(event)
    }

    /// Enters `event` as outstanding work over `accesses` and returns the earlier work it must
    /// wait for. Both happen under one lock.
    fn register(&self, event: &Event, accesses: Arc<[AccessRecord]>) -> Vec<Event> {
        let mut pending = self.inner.pending.lock().expect("queue pending poisoned");
        // failed runs stay until `wait` reports them
        pending.retain(|run| run.event.status() != EventStatus::Complete);
        let blocking = pending
            .iter()
            .filter(|run| run.event.status() == EventStatus::Pending)
            .filter(|run| self.is_in_order() || any_conflict(&run.accesses, &accesses))
            .map(|run| run.event.clone())
            .collect();
        pending.push(PendingRun {
            event: event.clone(),
            accesses,
        });
        blocking
    }

    /// Runs `work` on the calling thread once earlier conflicting work has finished, holding off
    /// later conflicting work until it returns.
    fn exclusive<R>(&self, accesses: &[AccessRecord], work: impl FnOnce() -> R) -> R {
        let marker = Event::pending();
        for earlier in self.register(&marker, accesses.into()) {
            let _ = earlier.block();
        }
        let result = work();
        marker.resolve(Ok(()));
        result
    }

    /// Waits for every outstanding graph run and reports the first failure.
    pub fn wait(&self) -> Result<()> {
        let outstanding: Vec<Event> = self
            .inner
            .pending
            .lock()
            .expect("queue pending poisoned")
            .iter()
            .map(|run| run.event.clone())
            .collect();
        let mut first_error = None;
        for event in &outstanding {
            if let Err(err) = event.block() {
                first_error.get_or_insert(err);
            }
        }
        self.inner
            .pending
            .lock()
            .expect("queue pending poisoned")
            .retain(|run| !outstanding.iter().any(|seen| seen.same_as(&run.event)));
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn memcpy(&self, dst: &UsmPtr, src: &UsmPtr, bytes: u64) -> Result<Event> {
        self.submit(|cgh| cgh.memcpy(dst, src, bytes))
    }

    pub fn memcpy_2d(
        &self,
        dst: &UsmPtr,
        dst_pitch: u64,
        src: &UsmPtr,
        src_pitch: u64,
        width: u64,
        height: u64,
    ) -> Result<Event> {
        self.submit(|cgh| cgh.memcpy_2d(dst, dst_pitch, src, src_pitch, width, height))
    }

    pub fn fill<T: Pod>(&self, dst: &UsmPtr, value: T, count: usize) -> Result<Event> {
        self.submit(|cgh| cgh.fill(dst, value, count))
    }

    /// Writes host data into any allocation; never captured by a recording graph.
    pub fn copy_from_host<T: Pod>(&self, dst: &UsmPtr, data: &[T]) -> Result<()> {
        let allocator = self.inner.context.allocator();
        allocator.check(dst)?;
        let target = dst.slice(0, std::mem::size_of_val(data) as u64)?;
        self.exclusive(&[target.access(AccessMode::Write)], || {
            allocator.write_elements(&target, data)
        })?;
        Ok(())
    }

    /// Reads any allocation back to the host; never captured by a recording graph.
    pub fn copy_to_host<T: Pod>(&self, src: &UsmPtr) -> Result<Vec<T>> {
        let allocator = self.inner.context.allocator();
        allocator.check(src)?;
        let data = self.exclusive(&[src.access(AccessMode::Read)], || {
            allocator.read_elements(src)
        })?;
        Ok(data)
    }
}
