//! Kernel bring-up.
//!
//! Orders the global-state initialization the subsystems rely on: the
//! logger first so later stages can report, then memory, processes
//! (which materializes the kernel process and the system token's first
//! holder), security, and IPC. Boot glue calls [`kernel_init`] exactly
//! once before enabling the syscall path.

/// Initialize all core subsystems.
pub fn kernel_init() {
    crate::logger::init();
    println!("[BOOT] Ferron core starting");

    crate::mm::init();
    crate::process::init();
    crate::security::init();
    crate::ipc::init();

    println!("[BOOT] Core services initialized");
}
