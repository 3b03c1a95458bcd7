use x86_64::instructions::port::Port;

const PIC1_COMMAND_PORT: u16 = 0x20;
const PIC1_DATA_PORT: u16 = 0x21;
const PIC2_COMMAND_PORT: u16 = 0xa0;
const PIC2_DATA_PORT: u16 = 0xa1;

pub const PIC1_INTERRUPT_OFFSET: u8 = 32;
const PIC2_INTERRUPT_OFFSET: u8 = 40;

/// End-Of-Interrupt Command for an Intel 8259 Programmable Interrupt Controller (PIC).
const PIC_EOI_COMMAND: u8 = 0x20;

pub fn eoi(int_no: u8) {
	unsafe {
		// For IRQ 8-15 (mapped to interrupt numbers >= 40), we need to send an EOI to the slave PIC.
		if int_no >= PIC2_INTERRUPT_OFFSET {
			Port::<u8>::new(PIC2_COMMAND_PORT).write(PIC_EOI_COMMAND);
		}

		// In all cases, we need to send an EOI to the master PIC.
		Port::<u8>::new(PIC1_COMMAND_PORT).write(PIC_EOI_COMMAND);
	}
}

/// Remap and fully mask both legacy PICs.
///
/// Normally, IRQs 0 to 7 are mapped to IDT entries 8 to 15, colliding with
/// the CPU exceptions (entry 8 is the Double Fault). The standard
/// initialization sequence moves them out of the way before everything is
/// masked; interrupt delivery then belongs to the APIC alone.
pub fn init() {
	let mut pic1_command = Port::<u8>::new(PIC1_COMMAND_PORT);
	let mut pic1_data = Port::<u8>::new(PIC1_DATA_PORT);
	let mut pic2_command = Port::<u8>::new(PIC2_COMMAND_PORT);
	let mut pic2_data = Port::<u8>::new(PIC2_DATA_PORT);

	unsafe {
		// Reinitialize PIC1 and PIC2.
		pic1_command.write(0x11);
		pic2_command.write(0x11);

		// Map PIC1 to interrupt numbers >= 32 and PIC2 to interrupt numbers >= 40.
		pic1_data.write(PIC1_INTERRUPT_OFFSET);
		pic2_data.write(PIC2_INTERRUPT_OFFSET);

		// Configure PIC1 as master and PIC2 as slave.
		pic1_data.write(0x04);
		pic2_data.write(0x02);

		// Start them in 8086 mode.
		pic1_data.write(0x01);
		pic2_data.write(0x01);

		// Mask all interrupts on both PICs.
		pic1_data.write(0xff);
		pic2_data.write(0xff);
	}
}
