#![forbid(unsafe_code)]
//! Asynchronous completion handle for image I/O.
//!
//! A [`Completion`] represents the eventual outcome of exactly one dispatch
//! request: a non-negative byte count or a [`VbdError`]. It is a single-shot
//! handoff — resolved at most once, observed either by blocking on the
//! paired [`CompletionWaiter`] or by arming an event channel that receives a
//! [`CompletionEvent`] when the pipeline resolves the operation.
//!
//! The protocol:
//! - The API layer stamps the completion with its operation kind and start
//!   time ([`init_time`](Completion::init_time)) before any validity check,
//!   so even fast-fail paths carry timing metadata for diagnostics.
//! - The pipeline calls [`complete`](Completion::complete) (or
//!   [`fail`](Completion::fail)) exactly once; later resolutions are ignored.
//! - A synchronous caller blocks on [`CompletionWaiter::wait`] until the
//!   completion resolves. Waits are unbounded.
//! - A `Completion` dropped unresolved resolves itself to
//!   [`VbdError::ShuttingDown`] so a blocked waiter can never hang on a
//!   pipeline that discarded its request.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use vbd_error::VbdError;
use vbd_types::IoKind;

/// Wake event delivered through an armed event channel on resolution.
///
/// Carries the signed result convention: non-negative byte count on success,
/// `-errno` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub kind: IoKind,
    pub rc: i64,
}

#[derive(Debug)]
struct CompletionState {
    kind: Option<IoKind>,
    start: Option<Instant>,
    event_channel: Option<Sender<CompletionEvent>>,
    rc: Option<i64>,
    result: Option<Result<u64, VbdError>>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<CompletionState>,
    condvar: Condvar,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                kind: None,
                start: None,
                event_channel: None,
                rc: None,
                result: None,
            }),
            condvar: Condvar::new(),
        }
    }
}

/// Single-writer handle for one operation's outcome.
#[derive(Debug)]
pub struct Completion {
    inner: Arc<Inner>,
}

/// Blocking reader paired with one [`Completion`].
///
/// Stack-local in the synchronous path; never outlives the call that created
/// it.
#[derive(Debug)]
pub struct CompletionWaiter {
    inner: Arc<Inner>,
}

impl Completion {
    /// Create a completion with no waiter (asynchronous callers observe the
    /// outcome through an armed event channel or by polling).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner::new()),
        })
    }

    /// Create a completion and its paired blocking waiter.
    #[must_use]
    pub fn pair() -> (Arc<Self>, CompletionWaiter) {
        let inner = Arc::new(Inner::new());
        let waiter = CompletionWaiter {
            inner: Arc::clone(&inner),
        };
        (Arc::new(Self { inner }), waiter)
    }

    /// Stamp the operation kind and start time.
    ///
    /// Must run before the readiness gate so rejected operations still carry
    /// consistent type/timing metadata.
    pub fn init_time(&self, kind: IoKind) {
        let mut state = self.lock_state();
        state.kind = Some(kind);
        state.start = Some(Instant::now());
    }

    /// Arm (`Some`) or disarm (`None`) external event notification.
    ///
    /// When armed, resolution additionally pushes a [`CompletionEvent`] into
    /// the channel.
    pub fn set_event_notify(&self, channel: Option<Sender<CompletionEvent>>) {
        self.lock_state().event_channel = channel;
    }

    /// Resolve the completion. The first resolution wins; later calls are
    /// ignored.
    pub fn complete(&self, result: Result<u64, VbdError>) {
        let event = {
            let mut state = self.lock_state();
            if state.rc.is_some() {
                return;
            }
            let rc = match &result {
                Ok(n) => i64::try_from(*n).unwrap_or(i64::MAX),
                Err(err) => err.to_rc(),
            };
            state.rc = Some(rc);
            state.result = Some(result);
            tracing::trace!(kind = ?state.kind, rc, "completion resolved");
            state
                .kind
                .and_then(|kind| state.event_channel.take().map(|tx| (tx, kind, rc)))
        };
        self.inner.condvar.notify_all();

        if let Some((tx, kind, rc)) = event {
            // Receiver may be gone; notification is best-effort.
            let _ = tx.send(CompletionEvent { kind, rc });
        }
    }

    /// Resolve the completion with an error.
    pub fn fail(&self, err: VbdError) {
        self.complete(Err(err));
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock_state().rc.is_some()
    }

    /// Signed result code, if resolved.
    #[must_use]
    pub fn rc(&self) -> Option<i64> {
        self.lock_state().rc
    }

    /// Operation kind, if stamped.
    #[must_use]
    pub fn kind(&self) -> Option<IoKind> {
        self.lock_state().kind
    }

    /// Start timestamp, if stamped.
    #[must_use]
    pub fn start_time(&self) -> Option<Instant> {
        self.lock_state().start
    }

    /// Time since [`init_time`](Self::init_time), if stamped.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.lock_state().start.map(|start| start.elapsed())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CompletionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // The waiter holds its own Arc<Inner>, so a handle dropped without
        // resolution must wake it rather than strand it.
        self.complete(Err(VbdError::ShuttingDown));
    }
}

impl CompletionWaiter {
    /// Block until the paired completion resolves, then take the result.
    ///
    /// Unbounded; the pipeline (or the drop guard) always resolves the
    /// completion eventually.
    pub fn wait(self) -> Result<u64, VbdError> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            state = self
                .inner
                .condvar
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn pair_resolves_through_waiter() {
        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Write);

        let handle = thread::spawn(move || {
            comp.complete(Ok(100));
        });

        assert_eq!(waiter.wait().expect("result"), 100);
        handle.join().expect("join");
    }

    #[test]
    fn first_resolution_wins() {
        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Read);
        comp.complete(Ok(7));
        comp.fail(VbdError::NoDevice);

        assert_eq!(comp.rc(), Some(7));
        assert_eq!(waiter.wait().expect("result"), 7);
    }

    #[test]
    fn dropped_unresolved_wakes_waiter_with_shutdown() {
        let (comp, waiter) = Completion::pair();
        comp.init_time(IoKind::Flush);
        drop(comp);

        match waiter.wait() {
            Err(VbdError::ShuttingDown) => {}
            other => panic!("expected ShuttingDown, got {other:?}"),
        }
    }

    #[test]
    fn init_time_stamps_kind_and_start() {
        let comp = Completion::new();
        assert_eq!(comp.kind(), None);
        assert!(comp.start_time().is_none());

        comp.init_time(IoKind::Discard);
        assert_eq!(comp.kind(), Some(IoKind::Discard));
        assert!(comp.elapsed().is_some());
    }

    #[test]
    fn armed_event_channel_receives_resolution() {
        let (tx, rx) = mpsc::channel();
        let comp = Completion::new();
        comp.init_time(IoKind::Write);
        comp.set_event_notify(Some(tx));
        comp.complete(Ok(4096));

        let event = rx.recv().expect("event");
        assert_eq!(event.kind, IoKind::Write);
        assert_eq!(event.rc, 4096);
    }

    #[test]
    fn unarmed_completion_sends_no_event() {
        let (tx, rx) = mpsc::channel();
        let comp = Completion::new();
        comp.init_time(IoKind::Write);
        comp.set_event_notify(Some(tx));
        comp.set_event_notify(None);
        comp.complete(Ok(1));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_event_carries_negative_errno() {
        let (tx, rx) = mpsc::channel();
        let comp = Completion::new();
        comp.init_time(IoKind::Flush);
        comp.set_event_notify(Some(tx));
        comp.fail(VbdError::NoDevice);

        let event = rx.recv().expect("event");
        assert_eq!(event.rc, VbdError::NoDevice.to_rc());
        assert!(event.rc < 0);
    }
}
