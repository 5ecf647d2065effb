//! Execute queued tasks on a worker pool and publish their outcomes.
//!
//! # Overview
//!
//! An [ObjectProcessor] decouples submission from execution. Callers [ObjectProcessor::submit] an
//! item together with a _deposit_ (arbitrary correlation state the processor never inspects). A
//! dispatcher thread drains the input queue onto a [ThreadPool], where a shared job mutates each
//! item in place. Finished items are published to an output queue; [ObjectProcessor::next] pairs
//! each one with its deposit again.
//!
//! Processors start on construction. After [ObjectProcessor::close], no new items are accepted
//! but every item already submitted still runs and can still be collected.
//!
//! A job that panics does not take the worker down: the panic is converted into an
//! [Error::Abort] by a pluggable [Converter] and published like any other failure.

use crate::Error;
use futures::{
    channel::mpsc,
    executor::{block_on, block_on_stream},
    StreamExt,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use rayon::ThreadPoolBuilder;
use std::{
    any::Any,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

/// A clone-able wrapper around a [rayon] thread pool.
pub type ThreadPool = Arc<rayon::ThreadPool>;

/// Work applied to every submitted item.
pub type Job<T> = Arc<dyn Fn(&mut T) -> Result<(), Error> + Send + Sync>;

/// Converts the payload of a panicking job into an [Error].
pub type Converter = Arc<dyn Fn(Box<dyn Any + Send>) -> Error + Send + Sync>;

/// Creates a clone-able [rayon] thread pool.
///
/// # Arguments
/// - `concurrency`: The number of tasks to execute concurrently in the pool.
pub fn create_pool(concurrency: usize) -> Result<ThreadPool, Error> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .thread_name(|i| format!("freelib-worker-{i}"))
        .build()?;
    Ok(Arc::new(pool))
}

/// Default [Converter]: a non-retryable abort carrying the panic message.
pub fn panic_to_abort(panic: Box<dyn Any + Send>) -> Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::abort(format!("job panicked: {message}"), false)
}

/// Counters shared by every processor created with the same [Metrics].
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub submitted: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub in_flight: Gauge,
}

impl Metrics {
    /// Creates metrics and registers them with `registry`.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "tasks_submitted",
            "Number of tasks submitted",
            metrics.submitted.clone(),
        );
        registry.register(
            "tasks_completed",
            "Number of tasks that completed successfully",
            metrics.completed.clone(),
        );
        registry.register(
            "tasks_failed",
            "Number of tasks that failed",
            metrics.failed.clone(),
        );
        registry.register(
            "tasks_in_flight",
            "Number of tasks currently executing",
            metrics.in_flight.clone(),
        );
        metrics
    }
}

/// Identifies one submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

/// A finished item, re-associated with its deposit.
#[derive(Debug)]
pub struct Completed<T, E> {
    pub ticket: Ticket,
    pub item: T,
    pub deposit: E,
    pub result: Result<(), Error>,
}

type Outcome<T> = (Ticket, T, Result<(), Error>);

/// Asynchronous task runner with deposit correlation.
pub struct ObjectProcessor<T, E> {
    input: Option<mpsc::UnboundedSender<(Ticket, T)>>,
    output: mpsc::UnboundedReceiver<Outcome<T>>,
    deposits: HashMap<Ticket, E>,
    next_ticket: u64,
    dispatcher: Option<JoinHandle<()>>,
    metrics: Metrics,
}

impl<T: Send + 'static, E> ObjectProcessor<T, E> {
    /// Starts a processor that converts job panics with [panic_to_abort].
    pub fn new(pool: ThreadPool, metrics: Metrics, job: Job<T>) -> Self {
        Self::with_converter(pool, metrics, job, Arc::new(panic_to_abort))
    }

    /// Starts a processor with a custom panic [Converter].
    pub fn with_converter(
        pool: ThreadPool,
        metrics: Metrics,
        job: Job<T>,
        converter: Converter,
    ) -> Self {
        let (input, input_rx) = mpsc::unbounded::<(Ticket, T)>();
        let (output_tx, output) = mpsc::unbounded::<Outcome<T>>();
        let dispatcher = {
            let metrics = metrics.clone();
            thread::spawn(move || {
                for (ticket, mut item) in block_on_stream(input_rx) {
                    let job = job.clone();
                    let converter = converter.clone();
                    let output_tx = output_tx.clone();
                    let metrics = metrics.clone();
                    metrics.in_flight.inc();
                    pool.spawn(move || {
                        let result = catch_unwind(AssertUnwindSafe(|| job(&mut item)))
                            .unwrap_or_else(|panic| Err(converter(panic)));
                        metrics.in_flight.dec();
                        match &result {
                            Ok(()) => metrics.completed.inc(),
                            Err(err) => {
                                warn!(?ticket, ?err, "task failed");
                                metrics.failed.inc()
                            }
                        };

                        // The consumer may have dropped the processor.
                        let _ = output_tx.unbounded_send((ticket, item, result));
                    });
                }
                debug!("processor input closed");
            })
        };
        Self {
            input: Some(input),
            output,
            deposits: HashMap::new(),
            next_ticket: 0,
            dispatcher: Some(dispatcher),
            metrics,
        }
    }

    /// Queues `item` for execution, remembering `deposit` until the item is collected.
    pub fn submit(&mut self, item: T, deposit: E) -> Result<Ticket, Error> {
        let Some(input) = &self.input else {
            return Err(Error::Closed);
        };
        let ticket = Ticket(self.next_ticket);
        if input.unbounded_send((ticket, item)).is_err() {
            return Err(Error::Closed);
        }
        self.next_ticket += 1;
        self.deposits.insert(ticket, deposit);
        self.metrics.submitted.inc();
        Ok(ticket)
    }

    /// Number of submitted items not yet collected.
    pub fn pending(&self) -> usize {
        self.deposits.len()
    }

    pub fn is_closed(&self) -> bool {
        self.input.is_none()
    }

    /// Stops accepting new items. Items already submitted still run.
    pub fn close(&mut self) {
        if self.input.take().is_some() {
            debug!(pending = self.deposits.len(), "closing processor");
        }
    }

    fn complete(&mut self, outcome: Outcome<T>) -> Option<Completed<T, E>> {
        let (ticket, item, result) = outcome;
        let deposit = self.deposits.remove(&ticket)?;
        Some(Completed {
            ticket,
            item,
            deposit,
            result,
        })
    }

    /// Blocks until the next item finishes.
    ///
    /// Returns `None` once every submitted item has been collected.
    pub fn next(&mut self) -> Option<Completed<T, E>> {
        if self.deposits.is_empty() {
            return None;
        }
        let outcome = block_on(self.output.next())?;
        self.complete(outcome)
    }

    /// Returns a finished item if one is ready, without blocking.
    pub fn try_next(&mut self) -> Option<Completed<T, E>> {
        match self.output.try_next() {
            Ok(Some(outcome)) => self.complete(outcome),
            _ => None,
        }
    }

    /// Closes the processor and collects every remaining item.
    pub fn drain(mut self) -> Vec<Completed<T, E>> {
        self.close();
        let mut completed = Vec::with_capacity(self.deposits.len());
        while let Some(done) = self.next() {
            completed.push(done);
        }
        completed
    }
}

impl<T, E> Drop for ObjectProcessor<T, E> {
    fn drop(&mut self) {
        self.input = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
    }
}
