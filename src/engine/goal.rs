use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::core::{Payload, lock};
use crate::engine::{Dependencies, Dispatcher};
use crate::error::GoalError;

type Body<T> = Box<dyn FnOnce(&GoalContext) -> anyhow::Result<T> + Send>;
type Listener<T> = Box<dyn FnOnce(&Result<T, GoalError>) + Send>;
type Settle = Box<dyn FnOnce(Option<GoalError>) + Send>;
type Notice = Box<dyn FnOnce()>;

thread_local! {
    /// Listener calls raised while this thread is already delivering some.
    /// Queueing them keeps failure propagation through long chains off the
    /// stack.
    static BACKLOG: RefCell<Option<VecDeque<Notice>>> = const { RefCell::new(None) };
}

/// Runs `notice` now, or after the notice currently being delivered on this
/// thread.
fn notify(notice: Notice) {
    let notice = BACKLOG.with(|backlog| match backlog.borrow_mut().as_mut() {
        Some(queue) => {
            queue.push_back(notice);
            None
        }
        None => Some(notice),
    });

    let Some(notice) = notice else {
        return;
    };

    BACKLOG.with(|backlog| *backlog.borrow_mut() = Some(VecDeque::new()));
    notice();
    drain_backlog();
    BACKLOG.with(|backlog| *backlog.borrow_mut() = None);
}

/// Delivers queued notices of this thread. Returns whether any ran.
fn drain_backlog() -> bool {
    let mut ran = false;
    while let Some(notice) =
        BACKLOG.with(|backlog| backlog.borrow_mut().as_mut().and_then(VecDeque::pop_front))
    {
        notice();
        ran = true;
    }
    ran
}

fn deliver<T>(listener: Listener<T>, result: &Result<T, GoalError>) {
    if catch_unwind(AssertUnwindSafe(|| listener(result))).is_err() {
        tracing::error!("goal listener panicked");
    }
}

/// Observable lifecycle of a [`Goal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T, GoalError>),
}

struct Cell<T> {
    slot: Slot<T>,
    body: Option<Body<T>>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T> {
    label: Option<String>,
    upstream: Vec<Arc<dyn AnyGoal>>,
    dispatcher: Dispatcher,
    cancelled: Arc<AtomicBool>,
    cell: Mutex<Cell<T>>,
    done: Condvar,
}

/// Handed to a goal body while it runs.
pub struct GoalContext {
    cancelled: Arc<AtomicBool>,
}

impl GoalContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns [`GoalError::Cancelled`] once cancellation was requested.
    /// Long-running bodies should call this between units of work.
    pub fn checkpoint(&self) -> Result<(), GoalError> {
        if self.is_cancelled() {
            Err(GoalError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A type-erased view of a [`Goal`], used to declare dependencies between
/// goals of different output types.
pub trait AnyGoal: Send + Sync {
    fn label(&self) -> Option<&str>;

    fn state(&self) -> GoalState;

    fn dispatcher(&self) -> &Dispatcher;

    fn dependencies(&self) -> &[Arc<dyn AnyGoal>];

    /// Requests evaluation of this goal and everything it depends on,
    /// without waiting for it.
    fn start(self: Arc<Self>);

    /// Moves a pending goal to running and subscribes it to its
    /// dependencies. Returns false if the goal was already started.
    #[doc(hidden)]
    fn activate(self: Arc<Self>) -> bool;

    /// Releases the dependencies of a goal about to be dropped.
    #[doc(hidden)]
    fn detach(&mut self) -> Vec<Arc<dyn AnyGoal>>;

    fn cancel(&self);

    /// Registers a callback run once the goal settles, receiving the error
    /// if it did not complete.
    fn on_settle(&self, listener: Settle);
}

/// A deferred, memoized, cancellable computation.
///
/// The body runs at most once, on the first request for the result, and only
/// after every dependency has completed. If a dependency fails the goal fails
/// too without running its body, and a cancelled dependency cancels it. The
/// outcome is fixed from then on and shared by every clone of the goal.
///
/// ```rust
/// use goalforge::Goal;
///
/// let a = Goal::value(2);
/// let b = Goal::lazy(|_| Ok(3));
/// let sum = Goal::depends_on((a, b)).run(|_, (a, b)| Ok(a + b));
///
/// assert_eq!(sum.get().unwrap(), 5);
/// ```
pub struct Goal<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Goal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Goal<()> {
    /// Starts declaring a goal computed from `dependencies`.
    pub fn depends_on<D: Dependencies>(dependencies: D) -> GoalBinder<D> {
        GoalBinder {
            dependencies,
            label: None,
            dispatcher: None,
        }
    }
}

impl<T: Payload> Goal<T> {
    fn from_parts(
        label: Option<String>,
        upstream: Vec<Arc<dyn AnyGoal>>,
        dispatcher: Dispatcher,
        slot: Slot<T>,
        body: Option<Body<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                label,
                upstream,
                dispatcher,
                cancelled: Arc::new(AtomicBool::new(false)),
                cell: Mutex::new(Cell {
                    slot,
                    body,
                    listeners: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// An already completed goal.
    pub fn value(value: T) -> Self {
        Self::from_parts(None, vec![], Dispatcher::global(), Slot::Done(Ok(value)), None)
    }

    /// An already failed goal.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Self::from_parts(
            None,
            vec![],
            Dispatcher::global(),
            Slot::Done(Err(GoalError::new(error))),
            None,
        )
    }

    /// A goal without dependencies.
    pub fn lazy<F>(body: F) -> Self
    where
        F: FnOnce(&GoalContext) -> anyhow::Result<T> + Send + 'static,
    {
        Goal::depends_on(()).run(move |ctx, ()| body(ctx))
    }

    /// Shorthand for `Goal::depends_on(dependencies).run(body)`.
    pub fn new<D, F>(dependencies: D, body: F) -> Self
    where
        D: Dependencies,
        F: FnOnce(&GoalContext, D::Output) -> anyhow::Result<T> + Send + 'static,
    {
        Goal::depends_on(dependencies).run(body)
    }

    /// Runs an asynchronous body on a temporary current-thread Tokio runtime.
    #[cfg(feature = "tokio")]
    pub fn from_future<F, Fut>(callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        Goal::lazy(move |_| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(callback())
        })
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn state(&self) -> GoalState {
        self.inner.state()
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.state(),
            GoalState::Completed | GoalState::Failed | GoalState::Cancelled
        )
    }

    pub fn dependencies(&self) -> &[Arc<dyn AnyGoal>] {
        &self.inner.upstream
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Requests evaluation without waiting for the result.
    pub fn start(&self) {
        Arc::clone(&self.inner).start();
    }

    /// Evaluates the goal if needed and waits for its outcome.
    pub fn get(&self) -> Result<T, GoalError> {
        self.start();
        self.inner.wait()
    }

    /// The outcome, if the goal has already settled. Never starts evaluation.
    pub fn try_get(&self) -> Option<Result<T, GoalError>> {
        match &lock(&self.inner.cell).slot {
            Slot::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Cancels the goal. Waiters and dependents observe
    /// [`GoalError::Cancelled`], a running body sees it at its next
    /// [`GoalContext::checkpoint`]. Has no effect on a settled goal.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Registers a callback invoked exactly once when the goal settles, right
    /// away if it already has. Does not start evaluation.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, GoalError>) + Send + 'static,
    {
        self.inner.listen(Box::new(listener));
    }

    pub fn erase(&self) -> Arc<dyn AnyGoal> {
        self.inner.clone()
    }

    pub fn map<R, F>(&self, f: F) -> Goal<R>
    where
        R: Payload,
        F: FnOnce(T) -> R + Send + 'static,
    {
        Goal::depends_on(self.clone()).run(move |_, value| Ok(f(value)))
    }

    pub fn and_then<R, F>(&self, f: F) -> Goal<R>
    where
        R: Payload,
        F: FnOnce(T) -> anyhow::Result<R> + Send + 'static,
    {
        Goal::depends_on(self.clone()).run(move |_, value| f(value))
    }
}

impl<T: Payload> std::fmt::Debug for Goal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Goal")
            .field("label", &self.label())
            .field("state", &self.state())
            .field("dependencies", &self.inner.upstream.len())
            .finish()
    }
}

/// Collects every value of `goals` in order.
///
/// The joined goal fails as soon as any member fails, without waiting for
/// the others. Members still running are left alone, their results are
/// simply ignored.
pub fn join<T: Payload>(goals: impl IntoIterator<Item = Goal<T>>) -> Goal<Vec<T>> {
    Goal::depends_on(goals.into_iter().collect::<Vec<_>>())
        .label("join")
        .run(|_, values| Ok(values))
}

/// Joins `goals` and folds the collected values with `f`.
pub fn join_map<T, R, F>(goals: impl IntoIterator<Item = Goal<T>>, f: F) -> Goal<R>
where
    T: Payload,
    R: Payload,
    F: FnOnce(Vec<T>) -> anyhow::Result<R> + Send + 'static,
{
    Goal::depends_on(goals.into_iter().collect::<Vec<_>>())
        .label("join")
        .run(move |_, values| f(values))
}

/// Whether any of `goals`, or any unsettled goal they wait on, failed or
/// was cancelled. Completed goals are not looked through.
pub(crate) fn any_failed(goals: impl IntoIterator<Item = Arc<dyn AnyGoal>>) -> bool {
    let mut frontier: Vec<Arc<dyn AnyGoal>> = goals.into_iter().collect();
    let mut seen = HashSet::new();

    while let Some(goal) = frontier.pop() {
        if !seen.insert(Arc::as_ptr(&goal) as *const () as usize) {
            continue;
        }
        match goal.state() {
            GoalState::Failed | GoalState::Cancelled => return true,
            GoalState::Completed => {}
            GoalState::Pending | GoalState::Running => {
                frontier.extend(goal.dependencies().iter().cloned());
            }
        }
    }

    false
}

/// Second half of [`Goal::depends_on`].
pub struct GoalBinder<D> {
    dependencies: D,
    label: Option<String>,
    dispatcher: Option<Dispatcher>,
}

impl<D: Dependencies> GoalBinder<D> {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Overrides the pool inherited from the first dependency.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn run<R, F>(self, body: F) -> Goal<R>
    where
        R: Payload,
        F: FnOnce(&GoalContext, D::Output) -> anyhow::Result<R> + Send + 'static,
    {
        let upstream = self.dependencies.upstream();
        let dispatcher = self
            .dispatcher
            .or_else(|| upstream.first().map(|goal| goal.dispatcher().clone()))
            .unwrap_or_default();

        let dependencies = self.dependencies;
        let body: Body<R> = Box::new(move |ctx| {
            let values = dependencies.resolve()?;
            body(ctx, values)
        });

        Goal::from_parts(self.label, upstream, dispatcher, Slot::Pending, Some(body))
    }
}

impl<T: Payload> Inner<T> {
    fn name(&self) -> &str {
        self.label.as_deref().unwrap_or("<anonymous>")
    }

    fn state(&self) -> GoalState {
        match &lock(&self.cell).slot {
            Slot::Pending => GoalState::Pending,
            Slot::Running => GoalState::Running,
            Slot::Done(Ok(_)) => GoalState::Completed,
            Slot::Done(Err(GoalError::Cancelled)) => GoalState::Cancelled,
            Slot::Done(Err(_)) => GoalState::Failed,
        }
    }

    fn listen(&self, listener: Listener<T>) {
        let mut cell = lock(&self.cell);
        if let Slot::Done(result) = &cell.slot {
            let result = result.clone();
            drop(cell);
            deliver(listener, &result);
            return;
        }
        cell.listeners.push(listener);
    }

    /// Fixes the outcome. Only the first call has any effect.
    fn settle(&self, result: Result<T, GoalError>) {
        let listeners = {
            let mut cell = lock(&self.cell);
            if matches!(cell.slot, Slot::Done(_)) {
                return;
            }
            cell.slot = Slot::Done(result.clone());
            cell.body = None;
            std::mem::take(&mut cell.listeners)
        };

        self.done.notify_all();

        if let Err(error) = &result {
            tracing::debug!(goal = self.name(), %error, "goal did not complete");
        }

        if !listeners.is_empty() {
            notify(Box::new(move || {
                for listener in listeners {
                    deliver(listener, &result);
                }
            }));
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.settle(Err(GoalError::Cancelled));
    }

    fn launch(self: Arc<Self>) {
        let body = {
            let mut cell = lock(&self.cell);
            if matches!(cell.slot, Slot::Done(_)) {
                return;
            }
            cell.body.take()
        };

        let Some(body) = body else {
            return;
        };

        if self.cancelled.load(Ordering::Acquire) {
            self.settle(Err(GoalError::Cancelled));
            return;
        }

        let dispatcher = self.dispatcher.clone();
        dispatcher.spawn(move || {
            let ctx = GoalContext {
                cancelled: Arc::clone(&self.cancelled),
            };

            let result = match catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(match error.downcast::<GoalError>() {
                    Ok(error) => error,
                    Err(error) => GoalError::from(error),
                }),
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("Goal panicked: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("Goal panicked: {s}")
                    } else {
                        String::from("Goal panicked with unknown payload")
                    };
                    Err(GoalError::new(anyhow::anyhow!(msg)))
                }
            };

            self.settle(result);
        });
    }

    fn wait(&self) -> Result<T, GoalError> {
        // Inside a rayon worker we keep executing other jobs instead of
        // parking, the goal we wait for may be queued on this very pool.
        let helping = rayon::current_thread_index().is_some();
        let mut cell = lock(&self.cell);

        loop {
            if let Slot::Done(result) = &cell.slot {
                return result.clone();
            }

            // The outcome may hinge on notices queued behind the one this
            // thread is delivering.
            drop(cell);
            let delivered = drain_backlog();
            cell = lock(&self.cell);
            if delivered {
                continue;
            }

            if helping {
                drop(cell);
                let executed = matches!(rayon::yield_now(), Some(rayon::Yield::Executed));
                cell = lock(&self.cell);
                if !executed && !matches!(cell.slot, Slot::Done(_)) {
                    cell = match self.done.wait_timeout(cell, Duration::from_millis(1)) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            } else {
                cell = self.done.wait(cell).unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

impl<T> Inner<T> {
    /// Drops the body, which may hold dependencies too, then hands the
    /// upstream goals to the caller.
    fn unlink(&mut self) -> Vec<Arc<dyn AnyGoal>> {
        let cell = self.cell.get_mut().unwrap_or_else(PoisonError::into_inner);
        cell.body = None;
        std::mem::take(&mut self.upstream)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Unlinks the graph iteratively, dropping a deep chain recursively
        // would exhaust the stack.
        let mut orphans = self.unlink();
        while let Some(mut goal) = orphans.pop() {
            if let Some(inner) = Arc::get_mut(&mut goal) {
                orphans.extend(inner.detach());
            }
        }
    }
}

impl<T: Payload> AnyGoal for Inner<T> {
    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn state(&self) -> GoalState {
        Inner::state(self)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn dependencies(&self) -> &[Arc<dyn AnyGoal>] {
        &self.upstream
    }

    fn start(self: Arc<Self>) {
        // Walks the graph with an explicit frontier, a deep chain must not
        // cost a stack frame per level.
        let root: Arc<dyn AnyGoal> = self;
        let mut frontier = vec![root];
        while let Some(goal) = frontier.pop() {
            if Arc::clone(&goal).activate() {
                frontier.extend(goal.dependencies().iter().cloned());
            }
        }
    }

    fn activate(self: Arc<Self>) -> bool {
        {
            let mut cell = lock(&self.cell);
            if !matches!(cell.slot, Slot::Pending) {
                return false;
            }
            cell.slot = Slot::Running;
        }

        tracing::trace!(goal = self.name(), "starting");

        if self.upstream.is_empty() {
            self.launch();
            return true;
        }

        let remaining = Arc::new(AtomicUsize::new(self.upstream.len()));

        for dependency in &self.upstream {
            let this = Arc::clone(&self);
            let remaining = Arc::clone(&remaining);
            let upstream = dependency.label().unwrap_or("<anonymous>").to_string();

            dependency.on_settle(Box::new(move |failure| match failure {
                None => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        this.launch();
                    }
                }
                Some(GoalError::Cancelled) => this.settle(Err(GoalError::Cancelled)),
                Some(error) => this.settle(Err(GoalError::Dependency {
                    goal: upstream,
                    source: Box::new(error.into_root()),
                })),
            }));
        }

        true
    }

    fn detach(&mut self) -> Vec<Arc<dyn AnyGoal>> {
        self.unlink()
    }

    fn cancel(&self) {
        Inner::cancel(self);
    }

    fn on_settle(&self, listener: Settle) {
        self.listen(Box::new(move |result| listener(result.as_ref().err().cloned())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool() -> Dispatcher {
        Dispatcher::with_threads(4).unwrap()
    }

    #[test]
    fn test_value() {
        let goal = Goal::value(42);
        assert_eq!(goal.state(), GoalState::Completed);
        assert_eq!(goal.get().unwrap(), 42);
    }

    #[test]
    fn test_body_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let goal = Goal::lazy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(String::from("done"))
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let goal = goal.clone();
                std::thread::spawn(move || goal.get().unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), "done");
        }
        assert_eq!(goal.get().unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_until_requested() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let goal = Goal::lazy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(goal.state(), GoalState::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(goal.try_get().is_none());

        goal.get().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dependencies_first() {
        let a = Goal::lazy(|_| Ok(2));
        let b = Goal::lazy(|_| Ok(3));
        let product = Goal::depends_on((a.clone(), b.clone()))
            .label("product")
            .run(|_, (a, b)| Ok(a * b));

        assert_eq!(product.get().unwrap(), 6);
        assert_eq!(a.state(), GoalState::Completed);
        assert_eq!(b.state(), GoalState::Completed);
        assert_eq!(product.dependencies().len(), 2);
    }

    #[test]
    fn test_failure_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let a: Goal<i32> = Goal::depends_on(())
            .label("a")
            .run(|_, ()| Err(anyhow::anyhow!("broken source")));
        let b = Goal::depends_on(a)
            .label("b")
            .run(move |_, value| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(value + 1)
            });
        let c = b.map(|v| v * 2);

        let err = c.get().unwrap_err();
        assert_eq!(b.state(), GoalState::Failed);
        assert_eq!(c.state(), GoalState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.root_cause().to_string(), "broken source");
        assert!(matches!(err, GoalError::Dependency { ref goal, .. } if goal == "b"));
    }

    #[test]
    fn test_panic_is_failure() {
        let goal: Goal<i32> = Goal::lazy(|_| panic!("oops"));
        let err = goal.get().unwrap_err();
        assert!(err.to_string().contains("oops"));
        assert_eq!(goal.state(), GoalState::Failed);
    }

    #[test]
    fn test_join_ordered() {
        let goals: Vec<Goal<usize>> = (0..10)
            .map(|i| {
                Goal::depends_on(())
                    .dispatcher(pool())
                    .run(move |_, ()| {
                        std::thread::sleep(Duration::from_millis((10 - i) as u64));
                        Ok(i)
                    })
            })
            .collect();

        assert_eq!(join(goals).get().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_join_map() {
        let total = join_map((1..=3).map(Goal::value), |values| Ok(values.iter().sum::<i32>()));
        assert_eq!(total.get().unwrap(), 6);

        let new = Goal::new((Goal::value(1), Goal::value(2)), |_, (a, b)| Ok(a + b));
        assert_eq!(new.get().unwrap(), 3);
    }

    #[test]
    fn test_join_fails_fast() {
        let (release, wait) = mpsc::channel::<()>();

        let slow = Goal::depends_on(()).dispatcher(pool()).run(move |_, ()| {
            wait.recv().ok();
            Ok(1)
        });
        let broken: Goal<i32> = Goal::failed(anyhow::anyhow!("nope"));

        let joined = join([slow.clone(), broken]);
        let err = joined.get().unwrap_err();

        assert_eq!(err.root_cause().to_string(), "nope");
        assert!(!slow.is_done());

        release.send(()).unwrap();
        assert_eq!(slow.get().unwrap(), 1);
    }

    #[test]
    fn test_cancel_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let goal = Goal::lazy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        let dependent = goal.map(|v| v + 1);

        goal.cancel();

        assert!(matches!(goal.get(), Err(GoalError::Cancelled)));
        assert!(matches!(dependent.get(), Err(GoalError::Cancelled)));
        assert_eq!(dependent.state(), GoalState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_running() {
        let (started_tx, started_rx) = mpsc::channel();

        let goal: Goal<u64> = Goal::depends_on(()).dispatcher(pool()).run(move |ctx, ()| {
            started_tx.send(()).ok();
            let mut spins = 0u64;
            while !ctx.is_cancelled() {
                spins += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            ctx.checkpoint()?;
            Ok(spins)
        });

        goal.start();
        started_rx.recv().unwrap();
        goal.cancel();

        assert!(matches!(goal.get(), Err(GoalError::Cancelled)));
        assert_eq!(goal.state(), GoalState::Cancelled);
    }

    #[test]
    fn test_listeners_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let goal = Goal::lazy(|_| Ok(5));

        for _ in 0..3 {
            let hits = hits.clone();
            goal.on_complete(move |result| {
                assert_eq!(*result.as_ref().unwrap(), 5);
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        goal.get().unwrap();
        goal.get().unwrap();

        let late = hits.clone();
        goal.on_complete(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_deep_graph_on_small_pool() {
        let dispatcher = Dispatcher::with_threads(2).unwrap();
        let mut goal = Goal::depends_on(()).dispatcher(dispatcher).run(|_, ()| Ok(0u64));
        for _ in 0..500 {
            goal = goal.map(|v| v + 1);
        }
        assert_eq!(goal.get().unwrap(), 500);
    }

    #[test]
    fn test_cancel_while_waiting_on_dependencies() {
        let (release, wait) = mpsc::channel::<()>();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let slow = Goal::depends_on(()).dispatcher(pool()).run(move |_, ()| {
            wait.recv().ok();
            Ok(1)
        });
        let goal = Goal::depends_on(slow.clone()).run(move |_, value| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value + 1)
        });

        goal.start();
        assert_eq!(goal.state(), GoalState::Running);
        goal.cancel();

        // Registered after the dependent, so it runs once the dependent
        // has seen the completion.
        let (seen_tx, seen_rx) = mpsc::channel();
        slow.on_complete(move |_| {
            seen_tx.send(()).ok();
        });

        release.send(()).unwrap();
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(slow.get().unwrap(), 1);
        assert!(matches!(goal.get(), Err(GoalError::Cancelled)));
        assert_eq!(goal.state(), GoalState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_very_deep_chain() {
        let mut goal = Goal::lazy(|_| Ok(0u64));
        for _ in 0..100_000 {
            goal = goal.map(|v| v + 1);
        }
        assert_eq!(goal.get().unwrap(), 100_000);
    }

    #[test]
    fn test_very_deep_failure() {
        let root: Goal<u64> = Goal::failed(anyhow::anyhow!("deep root"));
        let mut goal = root.map(|v| v + 1);
        for _ in 0..100_000 {
            goal = goal.map(|v| v + 1);
        }

        let err = goal.get().unwrap_err();
        assert!(matches!(err, GoalError::Dependency { .. }));
        assert_eq!(err.root_cause().to_string(), "deep root");
        assert_eq!(goal.state(), GoalState::Failed);
    }

    #[test]
    fn test_unstarted_deep_chain_drops() {
        let mut goal = Goal::lazy(|_| Ok(0u64));
        for _ in 0..100_000 {
            goal = goal.map(|v| v + 1);
        }
        assert_eq!(goal.state(), GoalState::Pending);
        drop(goal);
    }

    #[test]
    fn test_panicking_listener() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        let goal = Goal::depends_on(()).dispatcher(pool()).run(|_, ()| Ok(3));

        goal.on_complete(|_| panic!("listener failed"));
        let counter = hits.clone();
        goal.on_complete(move |result| {
            counter.fetch_add(*result.as_ref().unwrap(), Ordering::SeqCst);
            done_tx.send(()).ok();
        });

        assert_eq!(goal.get().unwrap(), 3);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        goal.on_complete(|_| panic!("late listener failed"));
        assert_eq!(goal.state(), GoalState::Completed);
    }

    #[test]
    fn test_get_inside_body() {
        let dispatcher = Dispatcher::with_threads(1).unwrap();
        let other = Goal::depends_on(())
            .dispatcher(dispatcher.clone())
            .run(|_, ()| Ok(10));
        let outer = Goal::depends_on(())
            .dispatcher(dispatcher)
            .run(move |_, ()| Ok(other.get()? + 1));

        assert_eq!(outer.get().unwrap(), 11);
    }

    #[cfg(feature = "tokio")]
    #[test]
    fn test_from_future() {
        let goal = Goal::from_future(|| async { Ok(String::from("async")) });
        assert_eq!(goal.get().unwrap(), "async");
    }
}
