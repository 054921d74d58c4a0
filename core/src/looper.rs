//! Single-threaded cooperative scheduler
//!
//! Every service state mutation runs on the looper's worker thread. Events
//! are ordered by due time and then by serial, so tasks posted for the same
//! instant run in posting order.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{ModemError, Result};

/// Handle identifying a posted event, usable with [`Looper::cancel`]
pub type Serial = u64;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    events: BTreeMap<(Instant, Serial), Task>,
    next_serial: Serial,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Looper {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Looper {
    /// Spawn the worker thread
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                events: BTreeMap::new(),
                next_serial: 1,
                stopped: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker_shared))?;
        let worker_id = handle.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Queue `task` for immediate execution
    pub fn post<F>(&self, task: F) -> Serial
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_with_delay(Duration::ZERO, task)
    }

    /// Queue `task` to run once `delay` has elapsed
    pub fn post_with_delay<F>(&self, delay: Duration, task: F) -> Serial
    where
        F: FnOnce() + Send + 'static,
    {
        let when = Instant::now() + delay;
        let mut queue = self.shared.lock();
        let serial = queue.next_serial;
        queue.next_serial += 1;

        if queue.stopped {
            log::debug!("looper stopped, dropping event {}", serial);
            return serial;
        }

        queue.events.insert((when, serial), Box::new(task));
        drop(queue);
        self.shared.wakeup.notify_one();
        serial
    }

    /// Remove a pending event. Returns false when it already ran or never existed.
    pub fn cancel(&self, serial: Serial) -> bool {
        let mut queue = self.shared.lock();
        let key = queue.events.keys().find(|(_, s)| *s == serial).copied();
        match key {
            Some(key) => {
                queue.events.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Run `task` on the looper and wait for its result
    pub fn post_and_wait<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_looper_thread() {
            return Ok(task());
        }

        let (tx, rx) = mpsc::channel();
        self.post(move || {
            let _ = tx.send(task());
        });
        rx.recv().map_err(|_| ModemError::LooperStopped)
    }

    pub fn is_looper_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().events.len()
    }

    /// Ask the worker to exit; pending events are discarded
    pub fn stop(&self) {
        {
            let mut queue = self.shared.lock();
            queue.stopped = true;
        }
        self.shared.wakeup.notify_all();

        if self.is_looper_thread() {
            return;
        }
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("looper worker panicked");
            }
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        if queue.stopped {
            break;
        }

        let next = queue.events.keys().next().copied();
        let Some((when, serial)) = next else {
            queue = shared.wakeup.wait(queue).unwrap_or_else(|e| e.into_inner());
            continue;
        };

        let now = Instant::now();
        if when > now {
            queue = shared
                .wakeup
                .wait_timeout(queue, when - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            continue;
        }

        let task = queue.events.remove(&(when, serial));
        drop(queue);
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("looper event {} panicked", serial);
            }
        }
        queue = shared.lock();
    }

    let discarded = queue.events.len();
    queue.events.clear();
    if discarded > 0 {
        log::debug!("looper exiting, discarded {} pending events", discarded);
    }
}

/// Wrap `task` so it only runs while `target` is still alive.
///
/// The closure holds a weak reference; a service dropped before the event
/// fires turns the callback into a no-op.
pub fn safe_callback<T, F>(target: &Arc<T>, task: F) -> impl FnOnce() + Send + 'static
where
    T: Send + Sync + 'static,
    F: FnOnce(&Arc<T>) + Send + 'static,
{
    let weak = Arc::downgrade(target);
    move || {
        if let Some(target) = weak.upgrade() {
            task(&target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |value: u32| -> Box<dyn FnOnce() + Send> {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(value))
        };
        (log, make)
    }

    #[test]
    fn test_post_runs_in_order() {
        let looper = Looper::new("test-looper").unwrap();
        let (log, make) = recorder();
        for value in 0..5 {
            looper.post(make(value));
        }
        looper.post_and_wait(|| ()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_delayed_events_ordered_by_deadline() {
        let looper = Looper::new("test-looper").unwrap();
        let (log, make) = recorder();
        looper.post_with_delay(Duration::from_millis(120), make(2));
        looper.post_with_delay(Duration::from_millis(40), make(1));
        looper.post(make(0));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cancel_before_deadline_prevents_run() {
        let looper = Looper::new("test-looper").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let serial = looper.post_with_delay(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(looper.cancel(serial));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(looper.pending(), 0);
    }

    #[test]
    fn test_cancel_after_run_is_noop() {
        let looper = Looper::new("test-looper").unwrap();
        let serial = looper.post(|| ());
        looper.post_and_wait(|| ()).unwrap();
        assert!(!looper.cancel(serial));
        assert!(!looper.cancel(9999));
    }

    #[test]
    fn test_stop_discards_pending_events() {
        let looper = Looper::new("test-looper").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        looper.post_with_delay(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        looper.stop();
        assert_eq!(looper.pending(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(looper.post_and_wait(|| 1).is_err());
    }

    #[test]
    fn test_safe_callback_skips_dropped_target() {
        let looper = Looper::new("test-looper").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let target = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&fired);
        looper.post_with_delay(
            Duration::from_millis(50),
            safe_callback(&target, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(target);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_post_and_wait_returns_value() {
        let looper = Looper::new("test-looper").unwrap();
        assert_eq!(looper.post_and_wait(|| 6 * 7).unwrap(), 42);
    }
}
