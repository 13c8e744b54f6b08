//! Coarse locking between single-display and cross-display operations.
//!
//! A display's runtime data is normally only touched by the thread driving
//! that display, so single-display operations take no per-entry lock. They
//! only wait here while some other thread holds the cross-display lock.
//! The cross-display lock is exclusive between threads and reentrant
//! within one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: u32,
}

impl Owner {
    fn held_by_other(&self, me: ThreadId) -> bool {
        self.thread.map_or(false, |owner| owner != me)
    }
}

/// Reentrant process-wide lock that single-display operations yield to.
#[derive(Debug)]
pub struct CrossDisplayLock {
    active: AtomicBool,
    owner: Mutex<Owner>,
    released: Condvar,
    grace: Duration,
}

/// Held while a cross-display operation runs.
#[derive(Debug)]
pub struct CrossDisplayGuard<'a> {
    lock: &'a CrossDisplayLock,
}

impl CrossDisplayLock {
    /// Creates a lock that sleeps `grace` after its outermost acquisition so
    /// in-flight single-display operations can finish.
    pub fn new(grace: Duration) -> Self {
        CrossDisplayLock {
            active: AtomicBool::new(false),
            owner: Mutex::new(Owner::default()),
            released: Condvar::new(),
            grace: grace,
        }
    }

    fn owner(&self) -> MutexGuard<Owner> {
        self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_until_free<'g>(&self, mut owner: MutexGuard<'g, Owner>, me: ThreadId) -> MutexGuard<'g, Owner> {
        while owner.held_by_other(me) {
            owner = self.released.wait(owner).unwrap_or_else(|e| e.into_inner());
        }
        owner
    }

    /// Blocks while another thread holds the cross-display lock.
    ///
    /// Returns immediately when the lock is free or held by the calling
    /// thread.
    pub fn wait_single(&self) {
        if !self.active.load(Ordering::Acquire) {
            return
        }

        let me = thread::current().id();
        let owner = self.owner();
        if owner.held_by_other(me) {
            trace!("waiting for cross-display operation");
        }
        drop(self.wait_until_free(owner, me));
    }

    /// Acquires the cross-display lock, blocking other threads' cross- and
    /// single-display operations until the guard is dropped.
    pub fn lock(&self) -> CrossDisplayGuard {
        let me = thread::current().id();
        let outermost = {
            let mut owner = self.wait_until_free(self.owner(), me);
            owner.thread = Some(me);
            owner.depth += 1;
            self.active.store(true, Ordering::Release);
            owner.depth == 1
        };

        if outermost && self.grace > Duration::from_secs(0) {
            thread::sleep(self.grace);
        }

        CrossDisplayGuard {
            lock: self,
        }
    }

    /// Whether a thread other than the caller holds the lock.
    pub fn is_held_by_other(&self) -> bool {
        self.owner().held_by_other(thread::current().id())
    }

    /// Nesting depth of the lock if held by the calling thread.
    pub fn depth(&self) -> u32 {
        let owner = self.owner();
        if owner.thread == Some(thread::current().id()) {
            owner.depth
        } else {
            0
        }
    }
}

impl Default for CrossDisplayLock {
    fn default() -> Self {
        CrossDisplayLock::new(Duration::from_secs(0))
    }
}

impl<'a> Drop for CrossDisplayGuard<'a> {
    fn drop(&mut self) {
        let mut owner = self.lock.owner();
        owner.depth = owner.depth.saturating_sub(1);
        if owner.depth == 0 {
            owner.thread = None;
            self.lock.active.store(false, Ordering::Release);
            self.lock.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn reentrant_on_same_thread() {
        let lock = CrossDisplayLock::default();
        let outer = lock.lock();
        {
            let _inner = lock.lock();
            assert_eq!(lock.depth(), 2);
            lock.wait_single();
        }
        assert_eq!(lock.depth(), 1);
        drop(outer);
        assert_eq!(lock.depth(), 0);
        assert!(!lock.is_held_by_other());
    }

    #[test]
    fn excludes_single_display_operations() {
        let lock = Arc::new(CrossDisplayLock::default());
        let proceeded = Arc::new(AtomicBool::new(false));

        let guard = lock.lock();
        let worker = {
            let lock = lock.clone();
            let proceeded = proceeded.clone();
            thread::spawn(move || {
                assert!(lock.is_held_by_other());
                lock.wait_single();
                proceeded.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!proceeded.load(Ordering::SeqCst));
        drop(guard);

        worker.join().unwrap();
        assert!(proceeded.load(Ordering::SeqCst));
    }

    #[test]
    fn excludes_other_cross_display_operations() {
        let lock = Arc::new(CrossDisplayLock::default());
        let inside = Arc::new(AtomicBool::new(false));

        let guard = lock.lock();
        inside.store(true, Ordering::SeqCst);
        let worker = {
            let lock = lock.clone();
            let inside = inside.clone();
            thread::spawn(move || {
                let _guard = lock.lock();
                assert!(!inside.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(20));
        inside.store(false, Ordering::SeqCst);
        drop(guard);
        worker.join().unwrap();
    }
}
