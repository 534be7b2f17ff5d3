//! Timer APIs
//!
//! Implements `setTimeout`, `setInterval`, `clearTimeout` and `clearInterval`
//! on top of the realm's host task queue. A timer is a host task that sleeps
//! on [`smol::Timer`]; when it fires, the drain loop calls the script
//! callback. Intervals reschedule themselves after each call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::bridge::{AfterCallback, Completion};
use crate::error::Result;
use crate::handle::{ScriptType, ValueHandle};
use crate::host::{Bindings, CallArgs, HostFuture};
use crate::marshal::HostValue;
use crate::realm::{Realm, RealmShared};
use crate::scope::Scope;

/// Timer entry
#[derive(Debug, Clone, Copy)]
struct Timer {
    /// Task currently sleeping for this timer
    task: u64,
    delay: Duration,
    repeat: bool,
}

/// Live timers of one realm
#[derive(Debug, Default)]
struct TimerManager {
    timers: HashMap<u32, Timer>,
    next_id: u32,
}

impl TimerManager {
    fn allocate(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.next_id
    }

    /// Forget a timer, returning the task to cancel
    fn clear(&mut self, id: u32) -> Option<u64> {
        self.timers.remove(&id).map(|timer| timer.task)
    }

    fn has_pending(&self) -> bool {
        !self.timers.is_empty()
    }
}

type SharedTimers = Rc<RefCell<TimerManager>>;

/// Negative, NaN and missing delays run on the next drain
fn delay_from(ms: Option<f64>) -> Duration {
    match ms {
        Some(ms) if ms.is_finite() && ms > 0.0 => Duration::from_secs_f64(ms / 1000.0),
        _ => Duration::ZERO,
    }
}

/// Queue the sleep for timer `id`
fn schedule(realm: &RealmShared, timers: &SharedTimers, id: u32, timer: Timer, callback: ValueHandle) {
    let delay = timer.delay;
    let future: HostFuture = Box::pin(async move {
        if !delay.is_zero() {
            smol::Timer::after(delay).await;
        }
        Ok(HostValue::Undefined)
    });

    let after = Rc::clone(timers);
    let then: AfterCallback = Box::new(move |scope: &mut Scope<'_>, callback: ValueHandle| -> Result<()> {
        let next = {
            let mut manager = after.borrow_mut();
            match manager.timers.get(&id).copied() {
                Some(timer) if timer.repeat => Some(timer),
                Some(_) => {
                    manager.timers.remove(&id);
                    None
                }
                None => None,
            }
        };
        match next {
            Some(timer) => {
                schedule(scope.realm(), &after, id, timer, callback);
                Ok(())
            }
            None => scope.dispose(&callback),
        }
    });

    let task = realm.tasks.borrow_mut().push(
        future,
        Completion::Callback {
            callback,
            then: Some(then),
        },
    );
    timers.borrow_mut().timers.insert(id, Timer { task, ..timer });
    tracing::trace!(realm = %realm.id, timer = id, task, "Timer scheduled in {:?}", delay);
}

fn start(scope: &mut Scope<'_>, timers: &SharedTimers, args: &CallArgs, repeat: bool) -> anyhow::Result<u32> {
    let callback = match args.get(0) {
        Some(callback) if callback.tag() == ScriptType::Function => scope.dup(callback)?,
        _ => anyhow::bail!("timer callback must be a function"),
    };
    let delay = delay_from(args.arg::<Option<f64>>(scope, 1)?);
    let id = timers.borrow_mut().allocate();
    let timer = Timer { task: 0, delay, repeat };
    schedule(scope.realm(), timers, id, timer, callback);
    Ok(id)
}

fn stop(scope: &mut Scope<'_>, timers: &SharedTimers, args: &CallArgs) -> anyhow::Result<()> {
    let Some(id) = args.arg::<Option<f64>>(scope, 0)? else {
        return Ok(());
    };
    if id < 0.0 || id.fract() != 0.0 || id > u32::MAX as f64 {
        return Ok(());
    }
    let task = timers.borrow_mut().clear(id as u32);
    if let Some(task) = task {
        scope.realm().tasks.borrow_mut().cancel(task);
        tracing::trace!(realm = %scope.realm_id(), timer = id, "Timer cleared");
    }
    Ok(())
}

/// Install timer APIs into the global object
pub fn install_timers(realm: &mut Realm) -> Result<()> {
    let timers = SharedTimers::default();
    let mut bindings = Bindings::new();

    let tm = Rc::clone(&timers);
    bindings.function("setTimeout", move |scope: &mut Scope<'_>, args: &CallArgs| {
        start(scope, &tm, args, false)
    });
    let tm = Rc::clone(&timers);
    bindings.function("setInterval", move |scope: &mut Scope<'_>, args: &CallArgs| {
        start(scope, &tm, args, true)
    });
    let tm = Rc::clone(&timers);
    bindings.function("clearTimeout", move |scope: &mut Scope<'_>, args: &CallArgs| {
        stop(scope, &tm, args)
    });
    let tm = Rc::clone(&timers);
    bindings.function("clearInterval", move |scope: &mut Scope<'_>, args: &CallArgs| {
        stop(scope, &tm, args)
    });
    bindings.function("hasPendingTimers", move |_: &mut Scope<'_>, _: &CallArgs| {
        Ok(timers.borrow().has_pending())
    });

    realm.install(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_from() {
        assert_eq!(delay_from(None), Duration::ZERO);
        assert_eq!(delay_from(Some(-5.0)), Duration::ZERO);
        assert_eq!(delay_from(Some(f64::NAN)), Duration::ZERO);
        assert_eq!(delay_from(Some(250.0)), Duration::from_millis(250));
    }

    #[test]
    fn test_timer_ids() {
        let mut manager = TimerManager::default();
        assert_eq!(manager.allocate(), 1);
        assert_eq!(manager.allocate(), 2);
        manager.timers.insert(
            2,
            Timer {
                task: 7,
                delay: Duration::ZERO,
                repeat: false,
            },
        );
        assert!(manager.has_pending());
        assert_eq!(manager.clear(2), Some(7));
        assert_eq!(manager.clear(2), None);
        assert!(!manager.has_pending());
    }

    #[cfg(feature = "native")]
    mod native {
        use crate::Runtime;

        #[test]
        fn test_set_timeout_fires_on_drain() {
            let runtime = Runtime::new().unwrap();
            let mut realm = runtime.create_realm().unwrap();
            realm.install_timers().unwrap();
            realm.eval::<()>("globalThis.fired = 0; setTimeout(() => { fired += 1 }, 0)").unwrap();
            assert_eq!(realm.eval::<f64>("fired").unwrap(), 0.0);
            realm.drain().unwrap();
            assert_eq!(realm.eval::<f64>("fired").unwrap(), 1.0);
            assert!(!realm.eval::<bool>("hasPendingTimers()").unwrap());
        }

        #[test]
        fn test_clear_timeout() {
            let runtime = Runtime::new().unwrap();
            let mut realm = runtime.create_realm().unwrap();
            realm.install_timers().unwrap();
            realm
                .eval::<()>("globalThis.fired = false; clearTimeout(setTimeout(() => { fired = true }, 0))")
                .unwrap();
            realm.drain().unwrap();
            assert!(!realm.eval::<bool>("fired").unwrap());
            assert_eq!(realm.pending_tasks(), 0);
        }

        #[test]
        fn test_interval_until_cleared() {
            let runtime = Runtime::new().unwrap();
            let mut realm = runtime.create_realm().unwrap();
            realm.install_timers().unwrap();
            realm
                .eval::<()>(
                    "globalThis.count = 0; \
                     const id = setInterval(() => { if (++count === 3) clearInterval(id) }, 1)",
                )
                .unwrap();
            smol::block_on(realm.run_until_idle()).unwrap();
            assert_eq!(realm.eval::<u32>("count").unwrap(), 3);
            assert_eq!(realm.pending_tasks(), 0);
        }

        #[test]
        fn test_timer_requires_function() {
            let runtime = Runtime::new().unwrap();
            let mut realm = runtime.create_realm().unwrap();
            realm.install_timers().unwrap();
            assert!(realm.eval::<()>("setTimeout('code', 0)").is_err());
        }
    }
}
