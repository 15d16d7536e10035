//! A small blocking counting semaphore, used to cap simultaneous bundle
//! creations (`Config::bundle_creation_limiter`).
//!
//! The rest of this engine is synchronous — no `tokio` runtime — so pulling
//! in an async semaphore for one call site isn't worth the dependency;
//! `std::sync::{Mutex, Condvar}` already gives us what we need.

use std::sync::{Condvar, Mutex};

pub struct CountingSemaphore {
    state: Mutex<usize>,
    available: Condvar,
    capacity: usize,
}

impl CountingSemaphore {
    pub fn new(permits: usize) -> Self {
        Self { state: Mutex::new(permits), available: Condvar::new(), capacity: permits }
    }

    /// Block until a permit is available, then hold it until the returned
    /// guard is dropped.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut count = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while *count == 0 {
            count = self.available.wait(count).unwrap_or_else(|e| e.into_inner());
        }
        *count -= 1;
        SemaphorePermit { sem: self }
    }

    fn release(&self) {
        let mut count = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *count = (*count + 1).min(self.capacity);
        self.available.notify_one();
    }
}

pub struct SemaphorePermit<'a> {
    sem: &'a CountingSemaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn single_permit_serializes_two_threads() {
        let sem = Arc::new(CountingSemaphore::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let sem2 = sem.clone();
        let order2 = order.clone();
        let permit = sem.acquire();

        let handle = std::thread::spawn(move || {
            let _permit = sem2.acquire();
            order2.lock().unwrap().push("second");
        });

        std::thread::sleep(Duration::from_millis(50));
        order.lock().unwrap().push("first");
        drop(permit);
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn permit_count_never_exceeds_capacity() {
        let sem = CountingSemaphore::new(2);
        let a = sem.acquire();
        let b = sem.acquire();
        drop(a);
        drop(b);
        assert_eq!(*sem.state.lock().unwrap(), 2);
    }
}
