#![no_std]

use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

static LOGGER: LockedLogger = LockedLogger(Mutex::new(Logger::new()));
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

struct LockedLogger(Mutex<Logger>);

impl log::Log for LockedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.lock().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.lock().log(record)
    }

    fn flush(&self) {}
}

// —————————————————————————————— Serial Sink ——————————————————————————————— //

#[cfg(target_arch = "x86_64")]
struct Logger {
    port: Option<uart_16550::SerialPort>,
}

#[cfg(target_arch = "x86_64")]
impl Logger {
    /// I/O port of the COM1 serial device.
    const SERIAL_PORT: u16 = 0x3F8;

    const fn new() -> Self {
        Self { port: None }
    }

    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&mut self, record: &Record) {
        use core::fmt::Write;

        let port = self.port.get_or_insert_with(|| {
            // SAFETY: COM1 lives at the architectural port address and the
            // port is only ever driven from behind the logger mutex.
            let mut port = unsafe { uart_16550::SerialPort::new(Self::SERIAL_PORT) };
            port.init();
            port
        });
        port.write_fmt(core::format_args!(
            "[{} | {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ))
        .expect("Printing to serial failed");
    }
}

#[cfg(not(target_arch = "x86_64"))]
struct Logger {}

#[cfg(not(target_arch = "x86_64"))]
impl Logger {
    const fn new() -> Self {
        Self {}
    }

    fn enabled(&self, _metadata: &Metadata) -> bool {
        false
    }

    fn log(&mut self, _record: &Record) {}
}

pub fn init(level: LevelFilter) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            log::set_logger(&LOGGER).unwrap();
            log::set_max_level(level);
        }
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}
