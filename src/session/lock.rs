//! Non-blocking exclusivity for operations sharing one link.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Advisory busy flag with an owner token.
///
/// Acquisition never waits: a second caller gets `None` and must decide
/// what to do. The lock does not stop anyone who ignores that outcome.
#[derive(Debug, Default)]
pub struct SessionLock {
    busy: AtomicBool,
    owner: AtomicU64,
    next_token: AtomicU64,
}

/// Proof of ownership. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockTicket<'a> {
    lock: &'a SessionLock,
    token: u64,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> Option<LockTicket<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            log::debug!("Session busy, lock not acquired");
            return None;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.owner.store(token, Ordering::Release);
        Some(LockTicket { lock: self, token })
    }

    pub fn is_locked(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run `fut` while holding the lock.
    ///
    /// Returns `None` without polling `fut` if the lock is taken. The lock
    /// is released on every exit path, including when the returned future
    /// is dropped early.
    pub async fn try_run<F: Future>(&self, fut: F) -> Option<F::Output> {
        let _ticket = self.try_acquire()?;
        Some(fut.await)
    }

    fn release(&self, token: u64) -> bool {
        if self.owner.load(Ordering::Acquire) != token {
            return false;
        }
        self.owner.store(0, Ordering::Relaxed);
        self.busy.store(false, Ordering::Release);
        true
    }
}

impl LockTicket<'_> {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for LockTicket<'_> {
    fn drop(&mut self) {
        if !self.lock.release(self.token) {
            log::warn!("Lock ticket {} no longer owns the session", self.token);
        }
    }
}
