use core::fmt;

use hermit_sync::InterruptSpinMutex;

use crate::arch::x86_64::kernel::serial::SerialPort;

/// Serial port carrying all kernel messages.
pub(crate) static COM1: InterruptSpinMutex<Option<SerialPort>> = InterruptSpinMutex::new(None);

const SERIAL_PORT_BASE: u16 = 0x3f8;

pub(crate) fn init() {
	// Nothing to log to yet if the probe fails; the capability simply
	// stays disabled and kernel messages go nowhere.
	if let Ok(port) = unsafe { SerialPort::probe(SERIAL_PORT_BASE) } {
		*COM1.lock() = Some(port);
	}
}

pub(crate) struct Console(());

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		if let Some(port) = COM1.lock().as_mut() {
			port.write_str(s)?;
		}
		Ok(())
	}
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use fmt::Write;

	Console(()).write_fmt(args).ok();
}
