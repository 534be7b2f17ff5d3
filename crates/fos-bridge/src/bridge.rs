//! Async bridge
//!
//! Host futures started by async host functions (and timers) live in a
//! per-realm [`TaskQueue`]. A drain pass runs the engine's job queue,
//! settles finished host tasks in completion order and repeats until
//! nothing moves, then reports unhandled rejections.

use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use smol::future::poll_fn;

use crate::abi::Equality;
use crate::error::{BridgeError, Result};
use crate::handle::{PromiseState, ScriptType, ValueHandle};
use crate::host::{self, HostFuture};
use crate::marshal::{FromScript, HostValue};
use crate::realm::RealmShared;
use crate::scope::Scope;

/// Reported rejections kept around for late-handled notifications
const REPORTED_HISTORY: usize = 64;

/// Statistics of a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Engine jobs executed
    pub jobs: usize,
    /// Host tasks whose results were delivered to script
    pub tasks_settled: usize,
    /// Unhandled rejections reported to the callback
    pub rejections_reported: usize,
}

// ============================================================================
// TASK QUEUE
// ============================================================================

/// What to do with a finished host future
pub(crate) enum Completion {
    /// Settle the promise returned to script
    Promise { resolve: ValueHandle, reject: ValueHandle },
    /// Call a script function with no arguments, then hand it to `then`
    /// (or release it)
    Callback {
        callback: ValueHandle,
        then: Option<AfterCallback>,
    },
}

/// Runs after a callback completion with ownership of the callback
pub(crate) type AfterCallback = Box<dyn FnOnce(&mut Scope<'_>, ValueHandle) -> Result<()>>;

pub(crate) struct PendingTask {
    id: u64,
    future: HostFuture,
    completion: Completion,
}

type Finished = (PendingTask, anyhow::Result<HostValue>);

#[derive(Default)]
pub(crate) struct TaskQueue {
    pending: Vec<PendingTask>,
    completed: VecDeque<Finished>,
    next_id: u64,
}

impl TaskQueue {
    pub(crate) fn push(&mut self, future: HostFuture, completion: Completion) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.push(PendingTask { id, future, completion });
        id
    }

    /// Drop a task that has not been delivered yet
    pub(crate) fn cancel(&mut self, id: u64) -> bool {
        let before = self.len();
        self.pending.retain(|task| task.id != id);
        self.completed.retain(|(task, _)| task.id != id);
        before != self.len()
    }

    /// Poll every pending future once, moving finished ones to the
    /// completed list. Returns how many finished.
    fn poll(&mut self, cx: &mut Context<'_>) -> usize {
        let mut finished = 0;
        let mut index = 0;
        while index < self.pending.len() {
            match self.pending[index].future.as_mut().poll(cx) {
                Poll::Ready(outcome) => {
                    let task = self.pending.remove(index);
                    self.completed.push_back((task, outcome));
                    finished += 1;
                }
                Poll::Pending => index += 1,
            }
        }
        finished
    }

    fn pop_completed(&mut self) -> Option<Finished> {
        self.completed.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.completed.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.completed.is_empty()
    }

    /// Abandon everything; the returned tasks still own their handles
    pub(crate) fn clear(&mut self) -> (Vec<PendingTask>, VecDeque<Finished>) {
        (std::mem::take(&mut self.pending), std::mem::take(&mut self.completed))
    }
}

// ============================================================================
// REJECTIONS
// ============================================================================

pub(crate) struct Rejection {
    promise: ValueHandle,
    reason: ValueHandle,
}

/// Callback for rejection notifications: `(scope, reason, handled_late)`
pub type RejectionCallback = Rc<dyn Fn(&mut Scope<'_>, &ValueHandle, bool)>;

#[derive(Default)]
pub(crate) struct RejectionTracker {
    unhandled: Vec<Rejection>,
    reported: VecDeque<Rejection>,
    handled_late: Vec<ValueHandle>,
}

impl RejectionTracker {
    pub(crate) fn unhandled_count(&self) -> usize {
        self.unhandled.len()
    }

    pub(crate) fn into_handles(self) -> Vec<ValueHandle> {
        let mut out = Vec::new();
        for rejection in self.unhandled.into_iter().chain(self.reported) {
            out.push(rejection.promise);
            out.push(rejection.reason);
        }
        out.extend(self.handled_late);
        out
    }
}

/// Engine notification from the `host_promise_rejection` import
pub(crate) fn on_rejection(scope: &mut Scope<'_>, promise: u32, reason: u32, handled: bool) -> Result<()> {
    let mut tracker = std::mem::take(&mut *scope.realm().rejections.borrow_mut());
    let outcome = track(scope, &mut tracker, promise, reason, handled);
    *scope.realm().rejections.borrow_mut() = tracker;
    outcome
}

fn track(
    scope: &mut Scope<'_>,
    tracker: &mut RejectionTracker,
    promise: u32,
    reason: u32,
    handled: bool,
) -> Result<()> {
    if !handled {
        let promise = scope.wrap_dup(promise)?;
        let reason = scope.wrap_dup(reason)?;
        tracing::trace!(realm = %scope.realm_id(), "Promise rejected without handler");
        tracker.unhandled.push(Rejection { promise, reason });
        return Ok(());
    }

    if let Some(index) = position(scope, tracker.unhandled.iter(), promise)? {
        let rejection = tracker.unhandled.remove(index);
        scope.dispose(&rejection.promise)?;
        scope.dispose(&rejection.reason)?;
    } else if let Some(index) = position(scope, tracker.reported.iter(), promise)? {
        if let Some(rejection) = tracker.reported.remove(index) {
            scope.dispose(&rejection.promise)?;
            tracker.handled_late.push(rejection.reason);
        }
    }
    Ok(())
}

fn position<'a>(
    scope: &mut Scope<'_>,
    rejections: impl Iterator<Item = &'a Rejection>,
    promise: u32,
) -> Result<Option<usize>> {
    for (index, rejection) in rejections.enumerate() {
        let raw = scope.raw(&rejection.promise)?;
        if scope.with_abi(|abi, ctx| abi.equals(ctx, raw, promise, Equality::Strict))? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Stop tracking `promise`; its rejection is being delivered to the host
fn consume_rejection(scope: &mut Scope<'_>, promise: &ValueHandle) -> Result<()> {
    let raw = scope.raw(promise)?;
    let mut tracker = std::mem::take(&mut *scope.realm().rejections.borrow_mut());
    let found = position(scope, tracker.unhandled.iter(), raw);
    let removed = match found {
        Ok(Some(index)) => Some(tracker.unhandled.remove(index)),
        _ => None,
    };
    *scope.realm().rejections.borrow_mut() = tracker;
    if let Some(rejection) = removed {
        scope.dispose(&rejection.promise)?;
        scope.dispose(&rejection.reason)?;
    }
    found.map(|_| ())
}

/// Deliver pending notifications; returns how many unhandled rejections
/// were reported
pub(crate) fn report_rejections(scope: &mut Scope<'_>) -> Result<usize> {
    let (unhandled, late) = {
        let mut tracker = scope.realm().rejections.borrow_mut();
        (
            std::mem::take(&mut tracker.unhandled),
            std::mem::take(&mut tracker.handled_late),
        )
    };
    let callback = scope.realm().on_rejection.borrow().clone();
    let count = unhandled.len();

    for rejection in &unhandled {
        notify(scope, callback.as_ref(), &rejection.reason, false)?;
    }
    for reason in late {
        notify(scope, callback.as_ref(), &reason, true)?;
        scope.dispose(&reason)?;
    }

    let mut evicted = Vec::new();
    {
        let mut tracker = scope.realm().rejections.borrow_mut();
        tracker.reported.extend(unhandled);
        while tracker.reported.len() > REPORTED_HISTORY {
            evicted.extend(tracker.reported.pop_front());
        }
    }
    for rejection in evicted {
        scope.dispose(&rejection.promise)?;
        scope.dispose(&rejection.reason)?;
    }
    Ok(count)
}

fn notify(
    scope: &mut Scope<'_>,
    callback: Option<&RejectionCallback>,
    reason: &ValueHandle,
    handled_late: bool,
) -> Result<()> {
    match callback {
        Some(callback) => callback(scope, reason, handled_late),
        None if handled_late => {
            tracing::debug!(realm = %scope.realm_id(), "Rejection handled after it was reported");
        }
        None => {
            let text = scope.dump(reason)?;
            tracing::warn!(realm = %scope.realm_id(), "Unhandled promise rejection: {}", text);
        }
    }
    Ok(())
}

// ============================================================================
// DRAINING
// ============================================================================

/// Execute queued engine jobs until the queue is empty
pub(crate) fn run_jobs(scope: &mut Scope<'_>) -> Result<usize> {
    let mut executed = 0;
    loop {
        match scope.with_abi(|abi, _| abi.job_execute())? {
            0 => return Ok(executed),
            1 => executed += 1,
            _ => {
                let (raw, phase) = scope.with_abi(|abi, ctx| abi.job_take_exception(ctx))?;
                if raw == 0 {
                    return Err(scope.exception());
                }
                return Err(scope.translate_raw(raw, phase));
            }
        }
    }
}

/// Deliver finished host tasks in completion order
fn settle_completed(scope: &mut Scope<'_>) -> Result<usize> {
    let mut settled = 0;
    loop {
        let next = scope.realm().tasks.borrow_mut().pop_completed();
        let Some((task, outcome)) = next else {
            return Ok(settled);
        };
        settle(scope, task, outcome)?;
        settled += 1;
    }
}

fn settle(scope: &mut Scope<'_>, task: PendingTask, outcome: anyhow::Result<HostValue>) -> Result<()> {
    match task.completion {
        Completion::Promise { resolve, reject } => {
            let (target, argument) = match outcome {
                Ok(value) => (&resolve, scope.value_raw(&value)),
                Err(err) => {
                    tracing::debug!(realm = %scope.realm_id(), task = task.id, "Host task failed: {:#}", err);
                    (&reject, host::error_raw(scope, &err))
                }
            };
            let result = argument.and_then(|argument| {
                let argument = scope.wrap(argument)?;
                let result = scope.invoke(target, None, std::slice::from_ref(&argument));
                scope.dispose(&argument)?;
                result
            });
            scope.dispose(&resolve)?;
            scope.dispose(&reject)?;
            scope.dispose(&result?)
        }
        Completion::Callback { callback, then } => {
            let result = scope.invoke(&callback, None, &[]);
            match then {
                Some(then) => then(scope, callback)?,
                None => scope.dispose(&callback)?,
            }
            match result {
                Ok(value) => scope.dispose(&value),
                Err(err) if is_fatal(&err) => Err(err),
                Err(err) => {
                    tracing::warn!(realm = %scope.realm_id(), task = task.id, "Callback threw: {}", err);
                    Ok(())
                }
            }
        }
    }
}

fn is_fatal(err: &BridgeError) -> bool {
    match err.as_engine() {
        Some(engine) => engine.is_interrupted() || engine.is_memory_limit() || engine.trap_code.is_some(),
        None => true,
    }
}

/// One drain pass: alternate jobs, task polling and settlement until
/// quiescent, without blocking
fn pass(scope: &mut Scope<'_>, report: &mut DrainReport) -> Result<()> {
    let mut cx = Context::from_waker(Waker::noop());
    loop {
        let jobs = run_jobs(scope)?;
        scope.realm().tasks.borrow_mut().poll(&mut cx);
        let settled = settle_completed(scope)?;
        report.jobs += jobs;
        report.tasks_settled += settled;
        if jobs == 0 && settled == 0 {
            return Ok(());
        }
    }
}

/// Synchronous drain: everything that can run without waiting
pub(crate) fn drain(realm: &Rc<RealmShared>) -> Result<DrainReport> {
    let mut scope = Scope::open(realm)?;
    let mut report = DrainReport::default();
    pass(&mut scope, &mut report)?;
    report.rejections_reported = report_rejections(&mut scope)?;
    Ok(report)
}

/// Wait until at least one pending host task finishes
async fn next_completion(realm: &Rc<RealmShared>) {
    poll_fn(|cx| {
        let mut tasks = realm.tasks.borrow_mut();
        if tasks.poll(cx) > 0 || !tasks.completed.is_empty() || tasks.pending.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await
}

/// Drain until no host task remains
pub(crate) async fn run_until_idle(realm: &Rc<RealmShared>) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    loop {
        {
            let mut scope = Scope::open(realm)?;
            pass(&mut scope, &mut report)?;
            report.rejections_reported += report_rejections(&mut scope)?;
            if realm.tasks.borrow().is_idle() {
                return Ok(report);
            }
        }
        next_completion(realm).await;
    }
}

/// Drive the realm until `value` settles, then marshal the outcome.
///
/// Non-promise values resolve immediately. Dropping the future leaves
/// pending tasks queued for a later drain.
pub(crate) async fn resolve<T: FromScript>(realm: &Rc<RealmShared>, value: ValueHandle) -> Result<T> {
    loop {
        {
            let mut scope = Scope::open(realm)?;
            let mut report = DrainReport::default();
            pass(&mut scope, &mut report)?;

            let state = if value.tag() == ScriptType::Promise {
                scope.promise_state(&value)?
            } else {
                None
            };
            match state {
                None => {
                    let out = T::from_script(&mut scope, &value);
                    scope.dispose(&value)?;
                    report_rejections(&mut scope)?;
                    return out;
                }
                Some(PromiseState::Fulfilled) => {
                    let result = scope.promise_result(&value)?;
                    let out = T::from_script(&mut scope, &result);
                    scope.dispose(&result)?;
                    scope.dispose(&value)?;
                    report_rejections(&mut scope)?;
                    return out;
                }
                Some(PromiseState::Rejected) => {
                    consume_rejection(&mut scope, &value)?;
                    let reason = scope.promise_result(&value)?;
                    let err = scope.rejection_error(&reason);
                    scope.dispose(&reason)?;
                    scope.dispose(&value)?;
                    report_rejections(&mut scope)?;
                    return Err(err);
                }
                Some(PromiseState::Pending) => {
                    report_rejections(&mut scope)?;
                    if realm.tasks.borrow().is_idle() && !scope.job_pending()? {
                        scope.dispose(&value)?;
                        return Err(BridgeError::Stalled);
                    }
                }
            }
        }
        next_completion(realm).await;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Weak;

    use super::*;
    use crate::handle::{HandleId, RealmId};

    fn detached_callback() -> Completion {
        let id = HandleId {
            realm: RealmId::next(),
            index: 0,
            generation: 0,
        };
        Completion::Callback {
            callback: ValueHandle::new(id, ScriptType::Function, Weak::new()),
            then: None,
        }
    }

    fn ready(value: f64) -> HostFuture {
        Box::pin(async move { Ok(HostValue::Number(value)) })
    }

    fn never() -> HostFuture {
        Box::pin(std::future::pending())
    }

    #[test]
    fn test_queue_completion_order() {
        // Completions are recorded in the order futures finish
        let mut queue = TaskQueue::default();
        let (tx, rx) = smol::channel::bounded::<()>(1);
        let gated: HostFuture = Box::pin(async move {
            rx.recv().await.ok();
            Ok(HostValue::Number(1.0))
        });
        queue.push_for_test(gated);
        queue.push_for_test(ready(2.0));

        let mut cx = Context::from_waker(Waker::noop());
        assert_eq!(queue.poll(&mut cx), 1);
        tx.try_send(()).unwrap();
        assert_eq!(queue.poll(&mut cx), 1);

        let first = queue.completed.pop_front().unwrap();
        let second = queue.completed.pop_front().unwrap();
        assert_eq!(first.1.unwrap(), HostValue::Number(2.0));
        assert_eq!(second.1.unwrap(), HostValue::Number(1.0));
    }

    #[test]
    fn test_cancel_pending() {
        let mut queue = TaskQueue::default();
        let id = queue.push_for_test(never());
        assert_eq!(queue.len(), 1);
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.is_idle());
    }

    impl TaskQueue {
        fn push_for_test(&mut self, future: HostFuture) -> u64 {
            self.next_id += 1;
            let id = self.next_id;
            self.pending.push(PendingTask {
                id,
                future,
                completion: detached_callback(),
            });
            id
        }
    }
}
