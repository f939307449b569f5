//! 16550 UART console on COM1.
//!
//! The boot stub registers this as the kernel log sink before anything else
//! runs, so early panics land on the serial line.

use core::fmt::{self, Write};

use quark_core::arch::x86_64::instructions::port::Port;
use quark_core::log::LogLevel;
use quark_core::sync::SpinLock;

/// COM1 base port.
const COM1: u16 = 0x3F8;

/// A 16550-compatible UART.
struct Uart16550 {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
}

impl Uart16550 {
    const fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            interrupt_enable: Port::new(base + 1),
            fifo_control: Port::new(base + 2),
            line_control: Port::new(base + 3),
            modem_control: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    /// Configures 115200 baud, 8n1, FIFOs on.
    ///
    /// # Safety
    ///
    /// Must only run on a machine where COM1 is a 16550-compatible UART (or
    /// absent, in which case the writes are harmless).
    unsafe fn init(&self) {
        // SAFETY: Standard 16550 bring-up sequence on the caller-vouched port.
        unsafe {
            self.interrupt_enable.write(0x00); // no interrupts
            self.line_control.write(0x80); // DLAB on
            self.data.write(0x01); // divisor low: 115200 baud
            self.interrupt_enable.write(0x00); // divisor high
            self.line_control.write(0x03); // 8n1, DLAB off
            self.fifo_control.write(0xC7); // FIFOs on, cleared, 14-byte trigger
            self.modem_control.write(0x0B); // DTR, RTS, OUT2
        }
    }

    fn write_byte(&self, byte: u8) {
        // SAFETY: Port configured by `init`; polling LSR bit 5 for a free
        // transmit holding register.
        unsafe {
            while self.line_status.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl Write for Uart16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: SpinLock<Uart16550> = SpinLock::new(Uart16550::new(COM1));

fn serial_print(args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = console.write_fmt(args);
}

fn serial_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level > quark_kernel::config::MAX_LOG_LEVEL {
        return;
    }
    let mut console = CONSOLE.lock();
    let _ = write!(console, "[{}] ", level.name());
    let _ = console.write_fmt(args);
    let _ = console.write_str("\n");
}

/// Initializes COM1 and points the kernel log macros at it.
pub fn init() {
    // SAFETY: COM1 is the conventional UART on PC hardware; single-threaded
    // early boot.
    unsafe {
        CONSOLE.lock().init();
        quark_core::log::set_print_fn(serial_print);
        quark_core::log::set_log_fn(serial_log);
    }
}
