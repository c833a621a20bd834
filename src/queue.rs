use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;

use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::BuildError;

type Task = LocalBoxFuture<'static, Result<(), BuildError>>;

/// Concurrent task runner with a fixed-point drain.
///
/// Tasks may be added at any time, including from inside another task while
/// the queue is draining. [`TaskQueue::run`] resolves only once no task is
/// in flight and none was added during the final check. A plain "await all
/// currently queued" would under-wait, because a draining task routinely
/// discovers and enqueues more work.
///
/// All tasks run concurrently on the current thread; no ordering between
/// them is guaranteed and none may be relied upon.
#[derive(Clone, Default)]
pub struct TaskQueue {
    pending: Rc<RefCell<Vec<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a unit of work. Returns immediately; the task starts running
    /// once [`TaskQueue::run`] polls it.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<(), BuildError>> + 'static,
    {
        self.pending.borrow_mut().push(Box::pin(task));
    }

    /// Drive every queued and subsequently added task to completion.
    ///
    /// If a task fails, the first error is returned; tasks still in flight
    /// are dropped at their next suspension point and queued ones are
    /// cleared, so no task result is applied after rejection.
    pub async fn run(&self) -> Result<(), BuildError> {
        let mut in_flight = FuturesUnordered::new();

        let outcome = futures::future::poll_fn(|cx| {
            loop {
                in_flight.extend(self.pending.borrow_mut().drain(..));

                match in_flight.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(()))) => {}
                    Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                    // The stream is empty. If nothing new was queued by the
                    // last batch of tasks, we have reached the fixed point.
                    Poll::Ready(None) => {
                        if self.pending.borrow().is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                    }
                    // Tasks enqueued while their siblings were merely
                    // suspended start on the next pass of this loop rather
                    // than waiting for a completion.
                    Poll::Pending => {
                        if self.pending.borrow().is_empty() {
                            return Poll::Pending;
                        }
                    }
                }
            }
        })
        .await;

        if outcome.is_err() {
            self.pending.borrow_mut().clear();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[tokio::test]
    async fn run_on_empty_queue_resolves() {
        let queue = TaskQueue::new();
        queue.run().await.unwrap();
    }

    #[tokio::test]
    async fn drains_to_fixed_point_with_nested_adds() {
        let queue = TaskQueue::new();
        let hits = Rc::new(Cell::new(0));

        let inner_queue = queue.clone();
        let inner_hits = hits.clone();
        queue.add(async move {
            inner_hits.set(inner_hits.get() + 1);

            // Work discovered mid-drain must also settle before run returns.
            let nested_hits = inner_hits.clone();
            let nested_queue = inner_queue.clone();
            inner_queue.add(async move {
                tokio::task::yield_now().await;
                nested_hits.set(nested_hits.get() + 1);

                let leaf_hits = nested_hits.clone();
                nested_queue.add(async move {
                    leaf_hits.set(leaf_hits.get() + 1);
                    Ok(())
                });

                Ok(())
            });

            Ok(())
        });

        queue.run().await.unwrap();
        assert_eq!(hits.get(), 3);
    }

    #[tokio::test]
    async fn tasks_run_concurrently() {
        let queue = TaskQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let a = order.clone();
        queue.add(async move {
            a.borrow_mut().push("a:start");
            tokio::task::yield_now().await;
            a.borrow_mut().push("a:end");
            Ok(())
        });

        let b = order.clone();
        queue.add(async move {
            b.borrow_mut().push("b:start");
            Ok(())
        });

        queue.run().await.unwrap();

        // Task b finished while a was suspended.
        let order = order.borrow();
        let a_end = order.iter().position(|s| *s == "a:end").unwrap();
        let b_start = order.iter().position(|s| *s == "b:start").unwrap();
        assert!(b_start < a_end);
    }

    #[tokio::test]
    async fn task_can_await_work_it_enqueued() {
        let queue = TaskQueue::new();
        let done = Rc::new(Cell::new(false));

        let (tx, rx) = tokio::sync::oneshot::channel();
        let inner_queue = queue.clone();
        let flag = done.clone();
        queue.add(async move {
            inner_queue.add(async move {
                let _ = tx.send(());
                Ok(())
            });

            // Resolves only once the task enqueued above has run, so that
            // task must start while this one is still suspended.
            rx.await.ok();
            flag.set(true);
            Ok(())
        });

        queue.run().await.unwrap();
        assert!(done.get());
    }

    #[tokio::test]
    async fn first_error_rejects_run() {
        let queue = TaskQueue::new();

        queue.add(async { Err(BuildError::Aborted) });

        let err = queue.run().await.unwrap_err();
        assert!(err.is_abort());
    }

    #[tokio::test]
    async fn no_result_applied_after_rejection() {
        let queue = TaskQueue::new();
        let applied = Rc::new(Cell::new(false));

        // A sibling that would apply its result after a suspension point.
        let flag = applied.clone();
        queue.add(async move {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            flag.set(true);
            Ok(())
        });

        queue.add(async {
            Err(BuildError::Transform("a.js".into(), anyhow::anyhow!("boom")))
        });

        let err = queue.run().await.unwrap_err();
        assert!(matches!(err, BuildError::Transform(..)));
        assert!(!applied.get());
    }

    #[tokio::test]
    async fn queue_can_be_drained_repeatedly() {
        let queue = TaskQueue::new();
        let hits = Rc::new(Cell::new(0));

        let first = hits.clone();
        queue.add(async move {
            first.set(first.get() + 1);
            Ok(())
        });
        queue.run().await.unwrap();

        let second = hits.clone();
        queue.add(async move {
            second.set(second.get() + 1);
            Ok(())
        });
        queue.run().await.unwrap();

        assert_eq!(hits.get(), 2);
    }
}
