use alloc::boxed::Box;
use core::mem;
use core::sync::atomic::{AtomicPtr, Ordering};

use x86_64::PrivilegeLevel;
use x86_64::instructions::segmentation::{CS, DS, ES, SS, Segment};
use x86_64::instructions::tables::{lgdt, load_tss};
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::DescriptorTablePointer;
use x86_64::structures::gdt::DescriptorFlags;

use crate::config::KERNEL_STACK_SIZE;

// Fixed selector layout. The three user selectors starting at USER_CODE32
// encode the SYSRET convention: SYSRET reconstructs SS as base + 8 and (in
// 64-bit mode) CS as base + 16, which is why the unused 32-bit user code
// slot has to exist at the base.
pub const NULL: u16 = 0x00;
pub const KERNEL_CODE: u16 = 0x08;
pub const KERNEL_DATA: u16 = 0x10;
pub const TSS: u16 = 0x18;
pub const USER_CODE32: u16 = 0x28;
pub const USER_DATA: u16 = 0x30;
pub const USER_CODE64: u16 = 0x38;
pub const USER_DATA64: u16 = 0x40;

pub const USER_CODE64_RING3: u16 = USER_CODE64 | 3;
pub const USER_DATA64_RING3: u16 = USER_DATA64 | 3;

const GDT_ENTRIES: usize = 16;

/// Number of interrupt stacks in the TSS: generic, double fault, page
/// fault, and general protection fault. See also `interrupts.rs`.
pub const IST_ENTRIES: usize = 4;

pub const IST_GENERIC: u8 = 1;
pub const IST_DOUBLE_FAULT: u8 = 2;
pub const IST_PAGE_FAULT: u8 = 3;
pub const IST_GENERAL_PROTECTION: u8 = 4;

/// Size of the I/O permission bitmap: one bit per port, all ones, denying
/// every port to user mode.
const IOPB_BYTES: usize = 8192;

/// 64-bit Task State Segment with a trailing I/O permission bitmap.
///
/// See Intel Vol. 3A, 8.7 (Task Management in 64-bit Mode).
#[repr(C, packed(4))]
pub struct TaskStateSegment {
	reserved0: u32,
	/// Stacks loaded on privilege transitions to rings 0-2. Only `rsp[0]`
	/// is ever used.
	pub rsp: [u64; 3],
	reserved1: u64,
	/// Interrupt Stack Table; index 0 here is IST1.
	pub ist: [u64; 7],
	reserved2: u64,
	reserved3: u16,
	pub iomap_base: u16,
	/// All-ones IOPB plus the architectural 0xff terminator byte.
	pub iopb: [u8; IOPB_BYTES + 1],
}

impl TaskStateSegment {
	pub fn new() -> Self {
		Self {
			reserved0: 0,
			rsp: [0; 3],
			reserved1: 0,
			ist: [0; 7],
			reserved2: 0,
			reserved3: 0,
			iomap_base: mem::offset_of!(TaskStateSegment, iopb) as u16,
			iopb: [0xff; IOPB_BYTES + 1],
		}
	}
}

#[repr(C, align(4096))]
struct Gdt {
	entries: [u64; GDT_ENTRIES],
}

static GDT: AtomicPtr<Gdt> = AtomicPtr::new(core::ptr::null_mut());
static TSS_PTR: AtomicPtr<TaskStateSegment> = AtomicPtr::new(core::ptr::null_mut());

/// Encode a 16-byte 64-bit TSS descriptor (available, present, DPL 0).
fn tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
	let mut low = 0;
	low |= u64::from(limit) & 0xffff;
	low |= (base & 0xff_ffff) << 16;
	low |= 0x89 << 40;
	low |= ((u64::from(limit) >> 16) & 0xf) << 48;
	low |= ((base >> 24) & 0xff) << 56;

	(low, base >> 32)
}

/// 16-byte-aligned top of a freshly leaked stack buffer.
fn allocate_stack() -> u64 {
	let stack = Box::leak(Box::new([0u8; KERNEL_STACK_SIZE]));
	(core::ptr::from_mut(stack) as u64 + KERNEL_STACK_SIZE as u64) & !0xf
}

/// Build and load the GDT, the TSS with its interrupt stacks, and the
/// segment registers. Mutated exactly once; afterwards the tables are
/// read-only for the lifetime of the kernel.
pub fn init() {
	let tss = Box::leak(Box::new(TaskStateSegment::new()));

	// Dedicated stacks keep fatal faults off a potentially corrupt user or
	// kernel stack; rsp[0] serves ring-3 entries.
	tss.rsp[0] = allocate_stack();
	// No iterator here: the packed TSS layout forbids references into it.
	for i in 0..IST_ENTRIES {
		tss.ist[i] = allocate_stack();
	}

	let mut gdt = Box::new(Gdt {
		entries: [0; GDT_ENTRIES],
	});

	gdt.entries[(KERNEL_CODE / 8) as usize] = DescriptorFlags::KERNEL_CODE64.bits();
	gdt.entries[(KERNEL_DATA / 8) as usize] = DescriptorFlags::KERNEL_DATA.bits();

	let (tss_low, tss_high) = tss_descriptor(
		core::ptr::from_ref::<TaskStateSegment>(tss) as u64,
		mem::size_of::<TaskStateSegment>() as u32 - 1,
	);
	gdt.entries[(TSS / 8) as usize] = tss_low;
	gdt.entries[(TSS / 8) as usize + 1] = tss_high;

	gdt.entries[(USER_CODE32 / 8) as usize] = DescriptorFlags::USER_CODE32.bits();
	gdt.entries[(USER_DATA / 8) as usize] = DescriptorFlags::USER_DATA.bits();
	gdt.entries[(USER_CODE64 / 8) as usize] = DescriptorFlags::USER_CODE64.bits();
	gdt.entries[(USER_DATA64 / 8) as usize] = DescriptorFlags::USER_DATA.bits();

	let gdt = Box::leak(gdt);
	let pointer = DescriptorTablePointer {
		base: x86_64::VirtAddr::new(core::ptr::from_ref::<Gdt>(gdt) as u64),
		limit: (GDT_ENTRIES * mem::size_of::<u64>() - 1) as u16,
	};

	unsafe {
		lgdt(&pointer);

		CS::set_reg(SegmentSelector::new(KERNEL_CODE / 8, PrivilegeLevel::Ring0));
		SS::set_reg(SegmentSelector::new(KERNEL_DATA / 8, PrivilegeLevel::Ring0));
		DS::set_reg(SegmentSelector::new(KERNEL_DATA / 8, PrivilegeLevel::Ring0));
		ES::set_reg(SegmentSelector::new(KERNEL_DATA / 8, PrivilegeLevel::Ring0));

		load_tss(SegmentSelector::new(TSS / 8, PrivilegeLevel::Ring0));
	}

	GDT.store(gdt, Ordering::Relaxed);
	TSS_PTR.store(tss, Ordering::Relaxed);

	debug!("GDT and TSS loaded ({IST_ENTRIES} interrupt stacks)");
}

pub fn tss() -> &'static TaskStateSegment {
	unsafe {
		TSS_PTR
			.load(Ordering::Relaxed)
			.cast_const()
			.as_ref()
			.expect("TSS is not initialized")
	}
}
