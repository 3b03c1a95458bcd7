use alloc::boxed::Box;
use core::arch::asm;
use core::cell::Cell;
use core::mem::offset_of;
use core::ptr;

use num_enum::TryFromPrimitive;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::GsBase;

/// Saved architectural state of a process or of the kernel-main context.
///
/// The byte offsets of every field form a stable ABI with the context-switch
/// and interrupt-entry assembly; the `const` assertions at the bottom of
/// this file pin them.
#[repr(C)]
#[derive(Clone)]
pub struct RegisterFile {
	pub rax: u64,
	pub rbx: u64,
	pub rcx: u64,
	pub rdx: u64,
	pub rsi: u64,
	pub rdi: u64,
	pub rbp: u64,
	pub rsp: u64,
	pub r8: u64,
	pub r9: u64,
	pub r10: u64,
	pub r11: u64,
	pub r12: u64,
	pub r13: u64,
	pub r14: u64,
	pub r15: u64,
	pub rip: u64,
	pub rflags: u64,
	pub fs_base: u64,
	pub gs_base: u64,
	/// Non-zero if the next entry to user mode has to build an `iretq` frame
	/// because RCX/R11 carry live user values. The SYSCALL save path clears
	/// it, the interrupt save path sets it.
	pub needs_iret: u64,
	_reserved: u64,
	/// `fxsave64` area, 16-byte aligned.
	pub vector_store: VectorStore,
}

#[repr(C, align(16))]
#[derive(Clone)]
pub struct VectorStore(pub [u8; 512]);

impl RegisterFile {
	pub const fn zeroed() -> Self {
		Self {
			rax: 0,
			rbx: 0,
			rcx: 0,
			rdx: 0,
			rsi: 0,
			rdi: 0,
			rbp: 0,
			rsp: 0,
			r8: 0,
			r9: 0,
			r10: 0,
			r11: 0,
			r12: 0,
			r13: 0,
			r14: 0,
			r15: 0,
			rip: 0,
			rflags: 0,
			fs_base: 0,
			gs_base: 0,
			needs_iret: 0,
			_reserved: 0,
			vector_store: VectorStore([0; 512]),
		}
	}
}

/// The process state the CPU is multiplexed onto, stored inline in the
/// per-CPU block so the entry stubs can reach it with one `gs`-relative
/// store.
#[repr(C)]
pub struct CurrentProcess {
	pub id: u64,
	/// CR3 value of the process (physical PML4 address).
	pub page_table: u64,
	pub registers: RegisterFile,
}

/// Why control returned from user mode to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum YieldReason {
	None = 0,
	Timeout = 1,
	YieldSyscall = 2,
	SyscallRequest = 3,
	ExitRequest = 4,
	Exception = 5,
}

/// Written by the interrupt stubs, consumed by the scheduler loop.
#[repr(C)]
pub struct YieldInfo {
	pub reason: u64,
	pub exception_type: u64,
	pub error_code: u64,
	pub page_fault_address: u64,
}

/// The local APIC record of this core. `mmio_base` and `interrupt_received`
/// are written from assembly (EOI and one-shot expiry in the timer stub).
#[repr(C)]
pub struct LocalApicRecord {
	pub mmio_base: Cell<u64>,
	pub interrupt_received: Cell<u64>,
	/// APIC timer ticks per `timer_denominator` microseconds.
	pub timer_numerator: Cell<u64>,
	pub timer_denominator: Cell<u64>,
	/// Vector the LVT timer fires on.
	pub timer_vector: Cell<u64>,
}

#[repr(C)]
pub(crate) struct CoreLocal {
	this: *const Self,
	/// Process state currently loaded onto the CPU.
	pub current: CurrentProcess,
	/// Register file of the kernel-main context the scheduler runs in.
	pub kernel_main: RegisterFile,
	pub yield_info: YieldInfo,
	pub apic: LocalApicRecord,
	/// Sequential ID of this CPU core.
	core_id: u32,
	/// Owning heap allocation of the process behind [`Self::current`].
	pub current_process: Cell<*mut crate::scheduler::process::Process>,
	/// Invariant TSC ticks per `tsc_denominator` microseconds.
	pub tsc_numerator: Cell<u64>,
	pub tsc_denominator: Cell<u64>,
	/// Hook invoked from the unhandled-IRQ path (keyboard and friends).
	pub event_handler: Cell<Option<fn(u8)>>,
}

// The assembly reaches every field through `offset_of!` constants, so only
// the invariants below are load-bearing: the self pointer at offset zero and
// the 16-byte alignment of the `fxsave64` areas.
const _: () = {
	assert!(offset_of!(CoreLocal, this) == 0);
	assert!(offset_of!(RegisterFile, vector_store) % 16 == 0);
	assert!(offset_of!(RegisterFile, rax) == 0);
	assert!(offset_of!(RegisterFile, rip) == 0x80);
	assert!(offset_of!(RegisterFile, needs_iret) == 0xa0);
	assert!(offset_of!(CurrentProcess, registers) % 16 == 0);
};

impl CoreLocal {
	pub fn install() {
		assert_eq!(VirtAddr::zero(), GsBase::read());

		let this = Self {
			this: ptr::null(),
			current: CurrentProcess {
				id: 0,
				page_table: 0,
				registers: RegisterFile::zeroed(),
			},
			kernel_main: RegisterFile::zeroed(),
			yield_info: YieldInfo {
				reason: YieldReason::None as u64,
				exception_type: 0,
				error_code: 0,
				page_fault_address: 0,
			},
			apic: LocalApicRecord {
				mmio_base: Cell::new(0),
				interrupt_received: Cell::new(0),
				timer_numerator: Cell::new(0),
				timer_denominator: Cell::new(1),
				timer_vector: Cell::new(0),
			},
			core_id: 0,
			current_process: Cell::new(ptr::null_mut()),
			tsc_numerator: Cell::new(0),
			tsc_denominator: Cell::new(1),
			event_handler: Cell::new(None),
		};

		let this = Box::leak(Box::new(this));
		this.this = ptr::from_ref(this);

		GsBase::write(VirtAddr::from_ptr(this));
	}

	/// Fetch the per-CPU block with a single `gs`-relative load of the
	/// self pointer at offset zero.
	#[inline]
	pub fn get() -> &'static Self {
		debug_assert_ne!(VirtAddr::zero(), GsBase::read());
		unsafe {
			let raw: *const Self;
			asm!(
				"mov {}, gs:{}",
				out(reg) raw,
				const offset_of!(Self, this),
				options(nomem, nostack, preserves_flags),
			);
			&*raw
		}
	}

	/// Mutable access to the parts of the block the entry stubs also write.
	///
	/// # Safety
	///
	/// Only the kernel-main context may call this, and must not hold the
	/// returned reference across a switch to user mode.
	#[expect(clippy::mut_from_ref)]
	pub unsafe fn current_mut(&self) -> &'static mut CurrentProcess {
		unsafe { &mut *ptr::from_ref(&self.current).cast_mut() }
	}

	/// See [`Self::current_mut`].
	#[expect(clippy::mut_from_ref)]
	pub unsafe fn kernel_main_mut(&self) -> &'static mut RegisterFile {
		unsafe { &mut *ptr::from_ref(&self.kernel_main).cast_mut() }
	}

	pub fn yield_reason(&self) -> YieldReason {
		YieldReason::try_from(unsafe { ptr::read_volatile(&self.yield_info.reason) })
			.unwrap_or(YieldReason::None)
	}

	pub fn clear_yield_info(&self) {
		let yield_info = ptr::from_ref(&self.yield_info).cast_mut();
		unsafe {
			(*yield_info).reason = YieldReason::None as u64;
			(*yield_info).exception_type = 0;
			(*yield_info).error_code = 0;
			(*yield_info).page_fault_address = 0;
		}
	}
}

pub(crate) fn core_id() -> u32 {
	if cfg!(target_os = "none") && GsBase::read() != VirtAddr::zero() {
		CoreLocal::get().core_id
	} else {
		0
	}
}

/// Offsets into the per-CPU block shared with the assembly stubs.
pub(crate) mod offsets {
	use core::mem::offset_of;

	use super::{CoreLocal, CurrentProcess, LocalApicRecord, RegisterFile, YieldInfo};

	pub const CURRENT_ID: usize =
		offset_of!(CoreLocal, current) + offset_of!(CurrentProcess, id);
	pub const CURRENT_PAGE_TABLE: usize =
		offset_of!(CoreLocal, current) + offset_of!(CurrentProcess, page_table);
	pub const CURRENT_REGS: usize =
		offset_of!(CoreLocal, current) + offset_of!(CurrentProcess, registers);
	pub const KERNEL_REGS: usize = offset_of!(CoreLocal, kernel_main);

	pub const YIELD_REASON: usize =
		offset_of!(CoreLocal, yield_info) + offset_of!(YieldInfo, reason);
	pub const YIELD_EXCEPTION_TYPE: usize =
		offset_of!(CoreLocal, yield_info) + offset_of!(YieldInfo, exception_type);
	pub const YIELD_ERROR_CODE: usize =
		offset_of!(CoreLocal, yield_info) + offset_of!(YieldInfo, error_code);
	pub const YIELD_PAGE_FAULT_ADDRESS: usize =
		offset_of!(CoreLocal, yield_info) + offset_of!(YieldInfo, page_fault_address);

	pub const APIC_MMIO_BASE: usize =
		offset_of!(CoreLocal, apic) + offset_of!(LocalApicRecord, mmio_base);
	pub const APIC_INTERRUPT_RECEIVED: usize =
		offset_of!(CoreLocal, apic) + offset_of!(LocalApicRecord, interrupt_received);

	pub const REG_RAX: usize = offset_of!(RegisterFile, rax);
	pub const REG_RBX: usize = offset_of!(RegisterFile, rbx);
	pub const REG_RCX: usize = offset_of!(RegisterFile, rcx);
	pub const REG_RDX: usize = offset_of!(RegisterFile, rdx);
	pub const REG_RSI: usize = offset_of!(RegisterFile, rsi);
	pub const REG_RDI: usize = offset_of!(RegisterFile, rdi);
	pub const REG_RBP: usize = offset_of!(RegisterFile, rbp);
	pub const REG_RSP: usize = offset_of!(RegisterFile, rsp);
	pub const REG_R8: usize = offset_of!(RegisterFile, r8);
	pub const REG_R9: usize = offset_of!(RegisterFile, r9);
	pub const REG_R10: usize = offset_of!(RegisterFile, r10);
	pub const REG_R11: usize = offset_of!(RegisterFile, r11);
	pub const REG_R12: usize = offset_of!(RegisterFile, r12);
	pub const REG_R13: usize = offset_of!(RegisterFile, r13);
	pub const REG_R14: usize = offset_of!(RegisterFile, r14);
	pub const REG_R15: usize = offset_of!(RegisterFile, r15);
	pub const REG_RIP: usize = offset_of!(RegisterFile, rip);
	pub const REG_RFLAGS: usize = offset_of!(RegisterFile, rflags);
	pub const REG_FS_BASE: usize = offset_of!(RegisterFile, fs_base);
	pub const REG_GS_BASE: usize = offset_of!(RegisterFile, gs_base);
	pub const REG_NEEDS_IRET: usize = offset_of!(RegisterFile, needs_iret);
	pub const REG_VECTOR_STORE: usize = offset_of!(RegisterFile, vector_store);
}
