use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use crossbeam_queue::SegQueue;
use futures::{
    future::{self, BoxFuture, Either},
    stream::FuturesUnordered,
    task::{waker_ref, ArcWake, AtomicWaker},
    FutureExt, StreamExt,
};
use tracing::{info_span, Instrument};

use crate::{config::SchedulerConfig, ExecutionError};

// Number of task polls after which the driver hands control back to the runtime.
const POLL_BUDGET: usize = 64;

/// A source of batched values the scheduler flushes once resolvers stall. Implemented by
/// [`Dispatcher`](crate::Dispatcher), the trait erases its key and value types.
pub trait BatchSource: Send + Sync {
    fn name(&self) -> &str;
    fn has_pending(&self) -> bool;
    fn flush(&self) -> BoxFuture<'_, ()>;
    fn cancel(&self);
}

/// Drives the resolution tasks of one execution to completion with as few flushes as possible.
///
/// Tasks run until every one of them has either completed or is waiting. Only then are the
/// registered sources with queued keys flushed, so that all keys requested by sibling tasks end up
/// in the same batch. Keys discovered only after a value arrives form the next batch window, one
/// flush per level of dependency.
pub struct ResolutionScheduler {
    config: SchedulerConfig,
    sources: Vec<Arc<dyn BatchSource>>,
}

impl Default for ResolutionScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl ResolutionScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
        }
    }

    /// Every dispatcher the tasks load from must be registered, values of an unknown dispatcher
    /// are never flushed.
    #[must_use]
    pub fn with_source(mut self, source: impl BatchSource + 'static) -> Self {
        self.register(source);
        self
    }

    pub fn register(&mut self, source: impl BatchSource + 'static) {
        self.sources.push(Arc::new(source));
    }

    /// Runs all tasks, returning their outputs in submission order. Fails with
    /// [`ExecutionError::TimedOut`] if the configured timeout elapses first.
    pub async fn run<'a, T, F>(&self, tasks: impl IntoIterator<Item = F>) -> Result<Vec<T>, ExecutionError>
    where
        T: Send + 'a,
        F: Future<Output = T> + Send + 'a,
    {
        match self.config.timeout {
            Some(timeout) => self
                .run_until(tasks, tokio::time::sleep(timeout))
                .await
                .map_err(|_| ExecutionError::TimedOut(timeout)),
            None => self.run_until(tasks, future::pending::<()>()).await,
        }
    }

    /// Runs all tasks unless `cancel` completes first. On cancellation every value still waiting
    /// in a registered source fails with [`LoadError::Cancelled`](crate::LoadError::Cancelled) and
    /// the unfinished tasks are dropped.
    ///
    /// Flushes driven by the scheduler are dropped along with the tasks, and with them the loader
    /// futures they were awaiting. Work a loader handed off elsewhere (a spawned task, a remote
    /// query) is not stopped, whatever it returns later is discarded.
    pub async fn run_until<'a, T, F>(
        &self,
        tasks: impl IntoIterator<Item = F>,
        cancel: impl Future<Output = ()>,
    ) -> Result<Vec<T>, ExecutionError>
    where
        T: Send + 'a,
        F: Future<Output = T> + Send + 'a,
    {
        let tasks = TaskSet::new(tasks.into_iter().map(FutureExt::boxed).collect());
        let span = info_span!("resolution", tasks = tasks.len(), sources = self.sources.len());

        let execution = self.drive(tasks).instrument(span);
        futures::pin_mut!(execution, cancel);

        match future::select(execution, cancel).await {
            Either::Left((outputs, _)) => Ok(outputs),
            Either::Right(((), _)) => {
                tracing::debug!("Execution cancelled");
                for source in &self.sources {
                    source.cancel();
                }
                Err(ExecutionError::Cancelled)
            }
        }
    }

    async fn drive<'a, T>(&self, mut tasks: TaskSet<'a, T>) -> Vec<T> {
        let mut flushing = vec![false; self.sources.len()];
        let mut flushes = FuturesUnordered::new();
        let mut round = 0usize;

        loop {
            tasks.run_until_stalled().await;
            if tasks.is_done() {
                break;
            }

            for (index, source) in self.sources.iter().enumerate() {
                if !flushing[index] && source.has_pending() {
                    round += 1;
                    tracing::debug!(source = source.name(), round, "Flushing stalled source");
                    flushing[index] = true;
                    flushes.push(source.flush().map(move |()| index));
                }
            }

            if flushes.is_empty() {
                // Tasks are waiting on something else than a batch, or on a source that isn't
                // registered and will never be flushed.
                tracing::trace!(waiting = tasks.remaining, "Waiting for tasks to be woken up");
                tasks.woken().await;
                continue;
            }

            // Tasks woken by a finished flush resume right away, even if others are in flight.
            match future::select(flushes.next(), tasks.woken()).await {
                Either::Left((Some(index), _)) => flushing[index] = false,
                Either::Left((None, _)) | Either::Right(_) => {}
            }
        }

        // Nobody waits on flushes still in flight once the last task finished. Dropping them ends
        // their window, values loaded without being awaited fail as cancelled.
        if !flushes.is_empty() {
            tracing::debug!(abandoned = flushes.len(), "Dropping flushes no task waits on");
        }
        drop(flushes);

        tracing::debug!(flushes = round, "Resolution completed");
        tasks.into_outputs()
    }
}

/// Tasks to be woken are pushed by id, the scheduler itself is woken through `parent`.
struct ReadyQueue {
    ids: SegQueue<usize>,
    parent: AtomicWaker,
}

struct TaskWaker {
    id: usize,
    queued: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.queued.swap(true, Ordering::AcqRel) {
            arc_self.ready.ids.push(arc_self.id);
        }
        arc_self.ready.parent.wake();
    }
}

struct TaskSet<'a, T> {
    futures: Vec<Option<BoxFuture<'a, T>>>,
    outputs: Vec<Option<T>>,
    wakers: Vec<Arc<TaskWaker>>,
    ready: Arc<ReadyQueue>,
    remaining: usize,
}

impl<'a, T> TaskSet<'a, T> {
    fn new(futures: Vec<BoxFuture<'a, T>>) -> Self {
        let ready = Arc::new(ReadyQueue {
            ids: SegQueue::new(),
            parent: AtomicWaker::new(),
        });

        let wakers = (0..futures.len())
            .map(|id| {
                ready.ids.push(id);
                Arc::new(TaskWaker {
                    id,
                    queued: AtomicBool::new(true),
                    ready: Arc::clone(&ready),
                })
            })
            .collect();

        Self {
            outputs: futures.iter().map(|_| None).collect(),
            remaining: futures.len(),
            futures: futures.into_iter().map(Some).collect(),
            wakers,
            ready,
        }
    }

    fn len(&self) -> usize {
        self.futures.len()
    }

    fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Polls woken tasks until none is left to poll.
    fn run_until_stalled(&mut self) -> RunUntilStalled<'_, 'a, T> {
        RunUntilStalled { tasks: self }
    }

    /// Resolves once any task has been woken.
    fn woken(&self) -> impl Future<Output = ()> + Send + 'static {
        let ready = Arc::clone(&self.ready);
        future::poll_fn(move |cx| {
            ready.parent.register(cx.waker());
            if ready.ids.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
    }

    fn poll_task(&mut self, id: usize) {
        let waker = &self.wakers[id];
        waker.queued.store(false, Ordering::Release);

        let Some(future) = self.futures[id].as_mut() else {
            return;
        };

        let task_waker = waker_ref(waker);
        let mut cx = Context::from_waker(&task_waker);
        let poll = future.as_mut().poll(&mut cx);
        if let Poll::Ready(output) = poll {
            self.futures[id] = None;
            self.outputs[id] = Some(output);
            self.remaining -= 1;
        }
    }

    fn into_outputs(self) -> Vec<T> {
        self.outputs.into_iter().flatten().collect()
    }
}

struct RunUntilStalled<'s, 'a, T> {
    tasks: &'s mut TaskSet<'a, T>,
}

impl<T> Future for RunUntilStalled<'_, '_, T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.tasks.ready.parent.register(cx.waker());

        for _ in 0..POLL_BUDGET {
            let Some(id) = self.tasks.ready.ids.pop() else {
                return Poll::Ready(());
            };
            self.tasks.poll_task(id);
        }

        if self.tasks.ready.ids.is_empty() {
            Poll::Ready(())
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
