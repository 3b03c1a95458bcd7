use core::mem;
use core::ptr;

use hermit_sync::InterruptSpinMutex;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, Segment};
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;

/// An interrupt gate descriptor.
///
/// See Intel manual 3a for details, specifically section "6.14.1 64-Bit
/// Mode IDT" and "Figure 6-7. 64-Bit IDT Gate Descriptors".
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct IdtEntry {
	/// Lower 16 bits of ISR.
	base_lo: u16,
	/// Segment selector.
	selector: u16,
	/// Index into the Interrupt Stack Table (0 = do not switch stacks).
	ist_index: u8,
	/// Gate type, DPL, and present bit.
	flags: u8,
	/// Middle 16 bits of ISR.
	base_mid: u16,
	/// Upper 32 bits of ISR.
	base_hi: u32,
	/// Must be zero.
	reserved: u32,
}

const INTERRUPT_GATE: u8 = 0x0e;
const PRESENT: u8 = 1 << 7;

impl IdtEntry {
	/// A "missing" IdtEntry.
	///
	/// If the CPU tries to invoke a missing interrupt, it will instead send
	/// a General Protection fault (13), with the interrupt number and some
	/// other data stored in the error code.
	const MISSING: IdtEntry = IdtEntry {
		base_lo: 0,
		selector: 0,
		ist_index: 0,
		flags: 0,
		base_mid: 0,
		base_hi: 0,
		reserved: 0,
	};

	/// Create a present interrupt gate pointing at `handler`.
	///
	/// The code selector is read from the live CS register, so the gate
	/// always targets whatever kernel code segment is in force.
	fn new(handler: VirtAddr, ist_index: u8) -> IdtEntry {
		assert!(ist_index < 0b1000);
		assert_ne!(
			handler,
			VirtAddr::zero(),
			"a present gate must carry a handler"
		);

		let base = handler.as_u64();
		IdtEntry {
			base_lo: (base & 0xffff) as u16,
			selector: CS::get_reg().0,
			ist_index,
			flags: INTERRUPT_GATE | PRESENT,
			base_mid: ((base >> 16) & 0xffff) as u16,
			base_hi: (base >> 32) as u32,
			reserved: 0,
		}
	}
}

/// Declare an IDT of 256 entries. Although not all entries are used, the
/// rest exists as a bit of a trap. If any undefined IDT entry is hit, it
/// will cause an "Unhandled Interrupt" exception.
pub const IDT_ENTRIES: usize = 256;

#[repr(align(4096))]
struct IdtArray {
	entries: [IdtEntry; IDT_ENTRIES],
}

static IDT: InterruptSpinMutex<IdtArray> = InterruptSpinMutex::new(IdtArray {
	entries: [IdtEntry::MISSING; IDT_ENTRIES],
});

pub fn install() {
	let idt = IDT.lock();
	// The IDT lives inside a static, so the pointer stays valid after the
	// lock is released.
	let pointer = DescriptorTablePointer {
		base: VirtAddr::new(ptr::from_ref(&idt.entries) as u64),
		limit: (IDT_ENTRIES * mem::size_of::<IdtEntry>() - 1) as u16,
	};

	unsafe {
		lidt(&pointer);
	}
}

/// Set an entry in the IDT. The present bit is only ever set here, together
/// with the handler pointer.
///
/// # Arguments
///
/// * `index`     - 8-bit index of the interrupt gate to set.
/// * `handler`   - Handler function to call for this interrupt/exception.
/// * `ist_index` - Index of the Interrupt Stack Table (IST) to switch to.
///   A zero value means that the stack won't be switched, a value of 1
///   refers to the first IST entry, etc.
pub fn set_gate(index: u8, handler: usize, ist_index: u8) {
	IDT.lock().entries[index as usize] = IdtEntry::new(VirtAddr::new(handler as u64), ist_index);
}
