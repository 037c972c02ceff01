#[cfg(feature = "loom")]
pub use loom::cell::Cell;
#[cfg(not(feature = "loom"))]
pub use std::cell::Cell;

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering, fence};
#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::sync::Arc;
#[cfg(not(feature = "loom"))]
pub use std::sync::Arc;

#[cfg(feature = "loom")]
pub use loom::thread::{self, JoinHandle, Thread};
#[cfg(not(feature = "loom"))]
pub use std::thread::{self, JoinHandle, Thread};

#[cfg(not(feature = "loom"))]
pub use antidote::{Condvar, Mutex, MutexGuard};

#[cfg(feature = "loom")]
pub use loom::sync::MutexGuard;

#[cfg(feature = "loom")]
#[derive(Debug, Default)]
pub struct Mutex<T>(loom::sync::Mutex<T>);

#[cfg(feature = "loom")]
impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Self(loom::sync::Mutex::new(t))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap()
    }
}

/// Loom has no notion of time, so a timed wait degrades to a plain wait.
/// Loom 没有时间概念，因此限时等待退化为普通等待。
#[cfg(feature = "loom")]
#[derive(Debug, Default)]
pub struct Condvar(loom::sync::Condvar);

#[cfg(feature = "loom")]
impl Condvar {
    pub fn new() -> Self {
        Self(loom::sync::Condvar::new())
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.0.wait(guard).unwrap()
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        _dur: std::time::Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        (self.0.wait(guard).unwrap(), false)
    }

    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}

/// Spawn a named background thread for the domain.
/// 为域创建一个具名后台线程。
#[cfg(not(feature = "loom"))]
pub fn spawn<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(f)
}

#[cfg(feature = "loom")]
pub fn spawn<F>(_name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(loom::thread::spawn(f))
}
