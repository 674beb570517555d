//! Unix-specific platform code for pptrie

/// CPU the calling thread is running on; a hint only, it may change at any time.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> u32 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as u32
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> u32 {
    0
}
