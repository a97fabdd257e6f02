use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A boolean flag threads can wait on.
///
/// `set` wakes every waiter. There is no set-once rule: an event may be
/// cleared and reused.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    pub fn set(&self) {
        *self.flag.lock() = true;
        self.cvar.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cvar.wait(&mut flag);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cvar.wait_until(&mut flag, deadline).timed_out() && !*flag {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}
