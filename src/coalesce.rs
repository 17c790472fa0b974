// Deferred build coalescer - debounced, shared-result execution of a build function

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// The waiter's result was dropped before the build completed (coalescer or
/// runtime shutdown, or a panicking build function)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCancelled;

type BuildFn<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type Waiter<T, E> = oneshot::Sender<Result<T, E>>;

struct State<T, E> {
    waiters: Vec<Waiter<T, E>>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner<T, E> {
    build: BuildFn<T, E>,
    delay: Duration,
    state: Mutex<State<T, E>>,
    /// Held for the duration of a build; at most one build runs at a time
    running: tokio::sync::Mutex<()>,
    builds: AtomicU64,
    closed: AtomicBool,
}

/// Wraps an asynchronous build so that every caller asking for "the next
/// result" during the debounce window is served by a single execution.
///
/// Each request restarts the debounce timer. When the timer fires, the current
/// waiters are detached from the coalescer and receive the outcome of the
/// build that follows; requests made after that point wait for the next cycle.
/// Errors are forwarded to every waiter unchanged.
pub struct Coalescer<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Coalescer<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a coalescer around `build`, debounced by `delay`
    pub fn new<F, Fut>(delay: Duration, build: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let build: BuildFn<T, E> = Arc::new(move || Box::pin(build()));

        Self {
            inner: Arc::new(Inner {
                build,
                delay,
                state: Mutex::new(State {
                    waiters: Vec::new(),
                    timer: None,
                    generation: 0,
                }),
                running: tokio::sync::Mutex::new(()),
                builds: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Wait for the result of the next build
    pub async fn request(&self) -> Result<T, E>
    where
        E: From<BuildCancelled>,
    {
        let rx = self.subscribe();
        rx.await.unwrap_or_else(|_| Err(E::from(BuildCancelled)))
    }

    /// Register `callback` to be invoked with the result of the next build
    pub fn request_with<C>(&self, callback: C)
    where
        C: FnOnce(Result<T, E>) + Send + 'static,
        E: From<BuildCancelled>,
    {
        let rx = self.subscribe();
        tokio::spawn(async move {
            callback(rx.await.unwrap_or_else(|_| Err(E::from(BuildCancelled))));
        });
    }

    /// Register a waiter for the next build and (re)start the debounce timer
    pub fn subscribe(&self) -> oneshot::Receiver<Result<T, E>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();
        state.waiters.push(tx);
        Self::restart_timer(&self.inner, &mut state);
        rx
    }

    /// Schedule a build nobody waits on (e.g. a watched file changed)
    pub fn schedule(&self) {
        let mut state = self.inner.state.lock();
        Self::restart_timer(&self.inner, &mut state);
    }

    /// Whether a debounce timer is currently armed
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    /// Number of builds executed so far
    pub fn builds(&self) -> u64 {
        self.inner.builds.load(Ordering::SeqCst)
    }

    /// Cancel the armed timer and refuse every later build
    ///
    /// Pending waiters resolve as [`BuildCancelled`]. A build already running
    /// finishes, but none is started afterwards.
    pub fn shutdown(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            self.inner.closed.store(true, Ordering::SeqCst);
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.generation += 1;
            std::mem::take(&mut state.waiters)
        };
        tracing::debug!(waiters = waiters.len(), "coalescer shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn restart_timer(inner: &Arc<Inner<T, E>>, state: &mut State<T, E>) {
        if inner.closed.load(Ordering::SeqCst) {
            // dropping the waiters cancels them
            state.waiters.clear();
            return;
        }

        // Only a sleeping timer is ever aborted: a fired timer clears the
        // handle before it starts building.
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(inner);
        let delay = inner.delay;

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(inner, generation).await;
        }));
    }

    async fn fire(inner: Arc<Inner<T, E>>, generation: u64) {
        let waiters = {
            let mut state = inner.state.lock();
            if state.generation != generation || inner.closed.load(Ordering::SeqCst) {
                return;
            }
            state.timer = None;
            std::mem::take(&mut state.waiters)
        };

        let _running = inner.running.lock().await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.builds.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(waiters = waiters.len(), "running coalesced build");

        let result = (inner.build)().await;

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}
