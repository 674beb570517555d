//! Windows-specific platform code for pptrie

/// CPU the calling thread is running on; a hint only, it may change at any time.
pub fn current_cpu() -> u32 {
    use windows_sys::Win32::System::Threading::GetCurrentProcessorNumber;
    unsafe { GetCurrentProcessorNumber() }
}
