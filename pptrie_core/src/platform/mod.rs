//! Platform-specific module for pptrie

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::current_cpu;
#[cfg(target_os = "windows")]
pub use windows::current_cpu;

#[cfg(not(any(unix, target_os = "windows")))]
pub fn current_cpu() -> u32 {
    0
}

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Stable numeric id of the calling thread, never reused within a process.
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}
