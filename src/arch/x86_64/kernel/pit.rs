use x86_64::instructions::port::Port;

/// Base frequency of the Programmable Interval Timer.
pub const PIT_CLOCK: u64 = 1_193_182;

const PIT_CHANNEL0_DATA_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;

const PIT_BINARY_OUTPUT: u8 = 0b0000_0000;
const PIT_COUNTDOWN_MODE: u8 = 0b0000_0000;

const PIT_LOBYTE_ACCESS: u8 = 0b0001_0000;
const PIT_HIBYTE_ACCESS: u8 = 0b0010_0000;

const PIT_CHANNEL0: u8 = 0b0000_0000;

/// Read-back command for channel 0, latching the count only.
const PIT_READ_BACK_CHANNEL0: u8 = 0b1101_0010;

/// Arm channel 0 as a binary countdown from `count`. No interrupt is
/// involved; the counter is polled through [`read_counter`].
pub fn start_countdown(count: u16) {
	unsafe {
		Port::<u8>::new(PIT_COMMAND_PORT).write(
			PIT_BINARY_OUTPUT
				| PIT_COUNTDOWN_MODE
				| PIT_LOBYTE_ACCESS
				| PIT_HIBYTE_ACCESS
				| PIT_CHANNEL0,
		);

		let mut data = Port::<u8>::new(PIT_CHANNEL0_DATA_PORT);
		data.write(count as u8);
		data.write((count >> 8) as u8);
	}
}

/// Latch and read the current channel-0 count.
pub fn read_counter() -> u16 {
	unsafe {
		Port::<u8>::new(PIT_COMMAND_PORT).write(PIT_READ_BACK_CHANNEL0);

		let mut data = Port::<u8>::new(PIT_CHANNEL0_DATA_PORT);
		let low = data.read();
		let high = data.read();
		u16::from(low) | (u16::from(high) << 8)
	}
}

/// Number of microseconds a count of `ticks` represents.
pub const fn ticks_to_microseconds(ticks: u64) -> u64 {
	ticks * 1_000_000 / PIT_CLOCK
}
