use std::sync::{Condvar, Mutex, PoisonError};

/// A single-waiter wake token.
///
/// `notify` sets the token and `wait` consumes it, so a notification that lands between the
/// waiter's last predicate check and its call to `wait` is not lost.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.cond.notify_one();
    }

    /// Blocks until notified, then clears the token.
    pub fn wait(&self) {
        let signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let mut signaled = self
            .cond
            .wait_while(signaled, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);
        *signaled = false;
    }
}
