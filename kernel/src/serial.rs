//! Serial console backing the kernel `print!` macros on bare metal.

#![cfg(target_os = "none")]

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

/// COM1 base port on x86_64.
const COM1: u16 = 0x3F8;

pub struct SerialPort {
    inner: uart_16550::SerialPort,
}

impl SerialPort {
    fn new() -> Self {
        // SAFETY: COM1 is the standard first serial port; probing and
        // programming its I/O ports is the firmware-established contract.
        let mut inner = unsafe { uart_16550::SerialPort::new(COM1) };
        inner.init();
        Self { inner }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.write_str(s)
    }
}

lazy_static! {
    static ref SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new());
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    SERIAL.lock().write_fmt(args).ok();
}
