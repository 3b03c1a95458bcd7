use thiserror::Error;
use x86_64::instructions::port::Port;

#[derive(Debug, Error)]
pub enum PortError {
	#[error("no serial port present at {0:#x}")]
	NotPresent(u16),
}

/// A 16550-compatible UART.
pub struct SerialPort {
	inner: uart_16550::SerialPort,
}

impl SerialPort {
	/// Probe the scratch register before handing the port to the driver;
	/// boards without a COM port float the bus.
	///
	/// # Safety
	///
	/// `base` must be the base address of a serial port I/O region.
	pub unsafe fn probe(base: u16) -> Result<Self, PortError> {
		let mut scratch = Port::<u8>::new(base + 7);
		unsafe {
			scratch.write(0xae);
			if scratch.read() != 0xae {
				return Err(PortError::NotPresent(base));
			}
		}

		let mut inner = unsafe { uart_16550::SerialPort::new(base) };
		inner.init();

		Ok(Self { inner })
	}

	pub fn send(&mut self, byte: u8) {
		self.inner.send(byte);
	}
}

impl core::fmt::Write for SerialPort {
	fn write_str(&mut self, s: &str) -> core::fmt::Result {
		for byte in s.bytes() {
			self.send(byte);
		}
		Ok(())
	}
}
