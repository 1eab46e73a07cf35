//! Bounded-parallelism execution of independent jobs.
//!
//! Jobs are queued onto a dedicated rayon pool with a fixed number of worker
//! threads. Each worker reports back through a channel, and the calling
//! thread collects results into submission order, so the outcome does not
//! depend on which job finished first.
//!
//! The pool is fail-fast: once the first failure reaches the caller's thread,
//! queued jobs that have not started yet are skipped. Jobs that are already
//! running are never interrupted, and the call returns only after every
//! queued job has either finished or been skipped.

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::Instant;

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Pool size used when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Why a single job did not produce a value.
#[derive(Debug)]
pub enum JobError<E> {
    Failed(E),
    Panicked(String),
}

impl<E: Display> Display for JobError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Failed(err) => write!(f, "{err}"),
            JobError::Panicked(msg) => write!(f, "Task panicked: {msg}"),
        }
    }
}

/// Outcome of a batch with at least one failed job.
#[derive(Debug)]
pub struct BatchFailure<E> {
    /// Failures by submission index, ascending.
    pub failures: Vec<(usize, JobError<E>)>,
    /// Submission indices of jobs skipped after the first failure, ascending.
    pub cancelled: Vec<usize>,
}

impl<E: Display> Display for BatchFailure<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, err) in &self.failures {
            writeln!(f, "Job {index}: {err}")?;
        }

        if !self.cancelled.is_empty() {
            write!(f, "Never started: {:?}", self.cancelled)?;
        }

        Ok(())
    }
}

impl<E: Debug + Display> std::error::Error for BatchFailure<E> {}

enum Message<T, E> {
    Done(usize, Result<T, JobError<E>>),
    Cancelled(usize),
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let size = size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("hicflow-worker-{i}"))
            .build()?;

        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `work` for every job and return the results in job order.
    ///
    /// `label` names a job in progress output. Blocks until every job has
    /// resolved.
    pub fn execute<J, T, E, L, F>(
        &self,
        jobs: &[J],
        label: L,
        work: F,
    ) -> Result<Vec<T>, BatchFailure<E>>
    where
        J: Sync,
        T: Send,
        E: Send + Display,
        L: Fn(&J) -> String + Sync,
        F: Fn(&J) -> Result<T, E> + Sync,
    {
        let total = jobs.len();

        if total == 0 {
            return Ok(Vec::new());
        }

        let root_span = tracing::span!(Level::INFO, "compute_batch");
        if let Ok(style) = crate::utils::get_style_batch() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_length(total as u64);
        root_span.pb_set_message("Running simulations...");
        let _enter = root_span.enter();

        let pb_style = crate::utils::get_style_task().ok();
        let halted = AtomicBool::new(false);
        let started = Instant::now();

        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut failures = Vec::new();
        let mut cancelled = Vec::new();

        self.pool.in_place_scope(|s| {
            let (sender, receiver) = channel::<Message<T, E>>();

            for (index, job) in jobs.iter().enumerate() {
                let sender = sender.clone();
                let halted = &halted;
                let label = &label;
                let work = &work;
                let pb_style = pb_style.clone();
                let parent = root_span.clone();

                s.spawn(move |_| {
                    if halted.load(Ordering::SeqCst) {
                        let _ = sender.send(Message::Cancelled(index));
                        return;
                    }

                    let name = label(job);
                    let span = tracing::span!(parent: &parent, Level::INFO, "job", name = %name);
                    if let Some(style) = &pb_style {
                        span.pb_set_style(style);
                    }
                    span.pb_set_message(&format!("Running {name}"));
                    let _enter = span.enter();

                    let result =
                        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(job))) {
                            Ok(result) => result.map_err(JobError::Failed),
                            Err(panic) => Err(JobError::Panicked(panic_message(panic))),
                        };

                    let _ = sender.send(Message::Done(index, result));
                });
            }

            drop(sender);

            // The calling thread collects while the workers run.
            for message in receiver.iter().take(total) {
                root_span.pb_inc(1);

                match message {
                    Message::Done(index, Ok(value)) => slots[index] = Some(value),
                    Message::Done(index, Err(err)) => {
                        tracing::error!(job = index, "{err}");
                        halted.store(true, Ordering::SeqCst);
                        failures.push((index, err));
                    }
                    Message::Cancelled(index) => cancelled.push(index),
                }
            }
        });

        tracing::debug!(
            jobs = total,
            workers = self.size,
            "batch resolved {}",
            crate::utils::as_overhead(started)
        );

        if !failures.is_empty() {
            failures.sort_by_key(|(index, _)| *index);
            cancelled.sort_unstable();
            return Err(BatchFailure {
                failures,
                cancelled,
            });
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
