use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use core::arch::{asm, naked_asm};
use core::ffi::CStr;

use hermit_sync::InterruptTicketMutex;

use super::core_local::YieldReason;
use super::core_local::offsets::*;
use super::scheduler::save_context_interrupt;
use super::{gdt, idt};

pub use x86_64::instructions::interrupts::{disable, enable};

static IRQ_NAMES: InterruptTicketMutex<BTreeMap<u8, String>> =
	InterruptTicketMutex::new(BTreeMap::new());

pub fn add_irq_name(vector: u8, name: &'static str) {
	debug!("Register name \"{name}\" for interrupt {vector}");
	IRQ_NAMES.lock().insert(vector, name.to_string());
}

pub fn get_irq_name(vector: u8) -> Option<String> {
	IRQ_NAMES.lock().get(&vector).cloned()
}

pub fn print_information() {
	for (vector, name) in IRQ_NAMES.lock().iter() {
		info!("Interrupt vector {vector}: {name}");
	}
}

/// Enable interrupts and halt until one arrives, then disable them again.
/// The `sti` shadow makes the sequence race-free: an interrupt pending at
/// `sti` is delivered after `hlt` starts waiting.
#[inline]
pub fn wait_for_interrupt() {
	unsafe {
		asm!("sti", "hlt", "cli", options(nomem, nostack));
	}
}

/// Called from an exception stub when the faulting code segment was the
/// kernel's own. There is no process to blame, so this never returns.
extern "C" fn kernel_exception_panic(message: *const u8) -> ! {
	let message = unsafe { CStr::from_ptr(message.cast()) };
	panic!("{}", message.to_str().unwrap_or("unknown kernel exception"));
}

macro_rules! exception_stub {
	($name:ident, $message:ident, $vector:expr, $text:expr) => {
		static $message: [u8; $text.len()] = *$text;

		#[unsafe(naked)]
		unsafe extern "C" fn $name() {
			naked_asm!(
				// CS sits above the pushed RIP. Faults inside the kernel are
				// unrecoverable here.
				"cli",
				"cmp qword ptr [rsp + 8], {kernel_cs}",
				"je 3f",
				"swapgs",
				"mov gs:[{cur_rax}], rax",
				"mov qword ptr gs:[{reason}], {exception}",
				"mov qword ptr gs:[{exc_type}], {vector}",
				"mov qword ptr gs:[{error_code}], 0",
				"jmp {save}",
				"3:",
				"lea rdi, [rip + {msg}]",
				"and rsp, -16",
				"call {panic}",
				kernel_cs = const gdt::KERNEL_CODE as u64,
				cur_rax = const CURRENT_REGS + REG_RAX,
				reason = const YIELD_REASON,
				exception = const YieldReason::Exception as u64,
				exc_type = const YIELD_EXCEPTION_TYPE,
				vector = const $vector,
				error_code = const YIELD_ERROR_CODE,
				save = sym save_context_interrupt,
				msg = sym $message,
				panic = sym kernel_exception_panic,
			);
		}
	};

	($name:ident, $message:ident, $vector:expr, $text:expr, error_code) => {
		static $message: [u8; $text.len()] = *$text;

		#[unsafe(naked)]
		unsafe extern "C" fn $name() {
			naked_asm!(
				// With an error code pushed, CS sits another qword higher.
				"cli",
				"cmp qword ptr [rsp + 16], {kernel_cs}",
				"je 3f",
				"swapgs",
				"mov gs:[{cur_rax}], rax",
				"pop rax",
				"mov gs:[{error_code}], rax",
				"mov qword ptr gs:[{reason}], {exception}",
				"mov qword ptr gs:[{exc_type}], {vector}",
				"jmp {save}",
				"3:",
				"lea rdi, [rip + {msg}]",
				"and rsp, -16",
				"call {panic}",
				kernel_cs = const gdt::KERNEL_CODE as u64,
				cur_rax = const CURRENT_REGS + REG_RAX,
				reason = const YIELD_REASON,
				exception = const YieldReason::Exception as u64,
				exc_type = const YIELD_EXCEPTION_TYPE,
				vector = const $vector,
				error_code = const YIELD_ERROR_CODE,
				save = sym save_context_interrupt,
				msg = sym $message,
				panic = sym kernel_exception_panic,
			);
		}
	};
}

pub const EXC_DIVIDE_ERROR: u64 = 0;
pub const EXC_DEBUG: u64 = 1;
pub const EXC_NMI: u64 = 2;
pub const EXC_BREAKPOINT: u64 = 3;
pub const EXC_OVERFLOW: u64 = 4;
pub const EXC_BOUND_RANGE: u64 = 5;
pub const EXC_INVALID_OPCODE: u64 = 6;
pub const EXC_DEVICE_NOT_AVAILABLE: u64 = 7;
pub const EXC_DOUBLE_FAULT: u64 = 8;
pub const EXC_INVALID_TSS: u64 = 10;
pub const EXC_SEGMENT_NOT_PRESENT: u64 = 11;
pub const EXC_STACK_SEGMENT_FAULT: u64 = 12;
pub const EXC_GENERAL_PROTECTION: u64 = 13;
pub const EXC_PAGE_FAULT: u64 = 14;
pub const EXC_X87_FLOATING_POINT: u64 = 16;
pub const EXC_ALIGNMENT_CHECK: u64 = 17;
pub const EXC_MACHINE_CHECK: u64 = 18;
pub const EXC_SIMD_FLOATING_POINT: u64 = 19;
pub const EXC_VIRTUALIZATION: u64 = 20;
pub const EXC_CONTROL_PROTECTION: u64 = 21;

exception_stub!(
	divide_error_stub,
	MSG_DIVIDE_ERROR,
	EXC_DIVIDE_ERROR,
	b"Divide Error (#DE) Exception in kernel mode\0"
);
exception_stub!(
	debug_stub,
	MSG_DEBUG,
	EXC_DEBUG,
	b"Debug (#DB) Exception in kernel mode\0"
);
exception_stub!(
	nmi_stub,
	MSG_NMI,
	EXC_NMI,
	b"Non-Maskable Interrupt (NMI) Exception in kernel mode\0"
);
exception_stub!(
	breakpoint_stub,
	MSG_BREAKPOINT,
	EXC_BREAKPOINT,
	b"Breakpoint (#BP) Exception in kernel mode\0"
);
exception_stub!(
	overflow_stub,
	MSG_OVERFLOW,
	EXC_OVERFLOW,
	b"Overflow (#OF) Exception in kernel mode\0"
);
exception_stub!(
	bound_range_stub,
	MSG_BOUND_RANGE,
	EXC_BOUND_RANGE,
	b"BOUND Range Exceeded (#BR) Exception in kernel mode\0"
);
exception_stub!(
	invalid_opcode_stub,
	MSG_INVALID_OPCODE,
	EXC_INVALID_OPCODE,
	b"Invalid Opcode (#UD) Exception in kernel mode\0"
);
exception_stub!(
	device_not_available_stub,
	MSG_DEVICE_NOT_AVAILABLE,
	EXC_DEVICE_NOT_AVAILABLE,
	b"Device Not Available (#NM) Exception in kernel mode\0"
);
exception_stub!(
	double_fault_stub,
	MSG_DOUBLE_FAULT,
	EXC_DOUBLE_FAULT,
	b"Double Fault (#DF) Exception\0",
	error_code
);
exception_stub!(
	invalid_tss_stub,
	MSG_INVALID_TSS,
	EXC_INVALID_TSS,
	b"Invalid TSS (#TS) Exception in kernel mode\0",
	error_code
);
exception_stub!(
	segment_not_present_stub,
	MSG_SEGMENT_NOT_PRESENT,
	EXC_SEGMENT_NOT_PRESENT,
	b"Segment Not Present (#NP) Exception in kernel mode\0",
	error_code
);
exception_stub!(
	stack_segment_fault_stub,
	MSG_STACK_SEGMENT_FAULT,
	EXC_STACK_SEGMENT_FAULT,
	b"Stack Segment Fault (#SS) Exception in kernel mode\0",
	error_code
);
exception_stub!(
	general_protection_stub,
	MSG_GENERAL_PROTECTION,
	EXC_GENERAL_PROTECTION,
	b"General Protection (#GP) Exception in kernel mode\0",
	error_code
);
exception_stub!(
	x87_floating_point_stub,
	MSG_X87_FLOATING_POINT,
	EXC_X87_FLOATING_POINT,
	b"Floating-Point Error (#MF) Exception in kernel mode\0"
);
exception_stub!(
	alignment_check_stub,
	MSG_ALIGNMENT_CHECK,
	EXC_ALIGNMENT_CHECK,
	b"Alignment Check (#AC) Exception in kernel mode\0",
	error_code
);
exception_stub!(
	machine_check_stub,
	MSG_MACHINE_CHECK,
	EXC_MACHINE_CHECK,
	b"Machine Check (#MC) Exception\0"
);
exception_stub!(
	simd_floating_point_stub,
	MSG_SIMD_FLOATING_POINT,
	EXC_SIMD_FLOATING_POINT,
	b"SIMD Floating-Point (#XM) Exception in kernel mode\0"
);
exception_stub!(
	virtualization_stub,
	MSG_VIRTUALIZATION,
	EXC_VIRTUALIZATION,
	b"Virtualization (#VE) Exception in kernel mode\0"
);
exception_stub!(
	control_protection_stub,
	MSG_CONTROL_PROTECTION,
	EXC_CONTROL_PROTECTION,
	b"Control Protection (#CP) Exception in kernel mode\0",
	error_code
);

/// Page faults additionally latch CR2 for the scheduler's diagnostics.
static MSG_PAGE_FAULT: [u8; 44] = *b"Page Fault (#PF) Exception in kernel mode\0\0\0";

#[unsafe(naked)]
unsafe extern "C" fn page_fault_stub() {
	naked_asm!(
		"cli",
		"cmp qword ptr [rsp + 16], {kernel_cs}",
		"je 3f",
		"swapgs",
		"mov gs:[{cur_rax}], rax",
		"pop rax",
		"mov gs:[{error_code}], rax",
		"mov rax, cr2",
		"mov gs:[{pf_address}], rax",
		"mov qword ptr gs:[{reason}], {exception}",
		"mov qword ptr gs:[{exc_type}], {vector}",
		"jmp {save}",
		"3:",
		"lea rdi, [rip + {msg}]",
		"and rsp, -16",
		"call {panic}",
		kernel_cs = const gdt::KERNEL_CODE as u64,
		cur_rax = const CURRENT_REGS + REG_RAX,
		error_code = const YIELD_ERROR_CODE,
		pf_address = const YIELD_PAGE_FAULT_ADDRESS,
		reason = const YIELD_REASON,
		exception = const YieldReason::Exception as u64,
		exc_type = const YIELD_EXCEPTION_TYPE,
		vector = const EXC_PAGE_FAULT,
		save = sym save_context_interrupt,
		msg = sym MSG_PAGE_FAULT,
		panic = sym kernel_exception_panic,
	);
}

/// Default gate for the APIC vector range: acknowledge and resume. The
/// swapgs pair is only needed when the interrupt hit user mode.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn unhandled_interrupt_stub() {
	naked_asm!(
		"cmp qword ptr [rsp + 8], {kernel_cs}",
		"je 2f",
		"swapgs",
		"push rax",
		"mov rax, gs:[{apic_mmio}]",
		"mov dword ptr [rax + 0xb0], 0",
		"pop rax",
		"swapgs",
		"iretq",
		"2:",
		"push rax",
		"mov rax, gs:[{apic_mmio}]",
		"mov dword ptr [rax + 0xb0], 0",
		"pop rax",
		"iretq",
		kernel_cs = const gdt::KERNEL_CODE as u64,
		apic_mmio = const APIC_MMIO_BASE,
	);
}

/// Spurious interrupts must not be acknowledged at all.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn spurious_interrupt_stub() {
	naked_asm!("iretq");
}

/// Install gates for all 32 CPU exceptions.
///
/// Every exception runs on a dedicated TSS stack so a fault never reuses a
/// potentially corrupt user or kernel stack: double fault, page fault and
/// general protection fault each get their own, everything else shares the
/// generic one. The APIC vector range 128..=255 starts out with the
/// acknowledge-and-resume gate until a driver claims a vector.
pub fn install() {
	let set = |vector: u64, handler: unsafe extern "C" fn(), ist: u8| {
		idt::set_gate(vector as u8, handler as usize, ist);
	};

	set(EXC_DIVIDE_ERROR, divide_error_stub, gdt::IST_GENERIC);
	set(EXC_DEBUG, debug_stub, gdt::IST_GENERIC);
	set(EXC_NMI, nmi_stub, gdt::IST_GENERIC);
	set(EXC_BREAKPOINT, breakpoint_stub, gdt::IST_GENERIC);
	set(EXC_OVERFLOW, overflow_stub, gdt::IST_GENERIC);
	set(EXC_BOUND_RANGE, bound_range_stub, gdt::IST_GENERIC);
	set(EXC_INVALID_OPCODE, invalid_opcode_stub, gdt::IST_GENERIC);
	set(
		EXC_DEVICE_NOT_AVAILABLE,
		device_not_available_stub,
		gdt::IST_GENERIC,
	);
	set(EXC_DOUBLE_FAULT, double_fault_stub, gdt::IST_DOUBLE_FAULT);
	set(EXC_INVALID_TSS, invalid_tss_stub, gdt::IST_GENERIC);
	set(
		EXC_SEGMENT_NOT_PRESENT,
		segment_not_present_stub,
		gdt::IST_GENERIC,
	);
	set(
		EXC_STACK_SEGMENT_FAULT,
		stack_segment_fault_stub,
		gdt::IST_GENERIC,
	);
	set(
		EXC_GENERAL_PROTECTION,
		general_protection_stub,
		gdt::IST_GENERAL_PROTECTION,
	);
	set(EXC_PAGE_FAULT, page_fault_stub, gdt::IST_PAGE_FAULT);
	set(EXC_X87_FLOATING_POINT, x87_floating_point_stub, gdt::IST_GENERIC);
	set(EXC_ALIGNMENT_CHECK, alignment_check_stub, gdt::IST_GENERIC);
	set(EXC_MACHINE_CHECK, machine_check_stub, gdt::IST_GENERIC);
	set(
		EXC_SIMD_FLOATING_POINT,
		simd_floating_point_stub,
		gdt::IST_GENERIC,
	);
	set(EXC_VIRTUALIZATION, virtualization_stub, gdt::IST_GENERIC);
	set(
		EXC_CONTROL_PROTECTION,
		control_protection_stub,
		gdt::IST_GENERIC,
	);

	for vector in 128..=255u8 {
		idt::set_gate(vector, unhandled_interrupt_stub as usize, gdt::IST_GENERIC);
	}

	idt::install();
}

/// Human-readable name of an exception class recorded in the yield info.
pub fn exception_name(exception_type: u64) -> &'static str {
	match exception_type {
		EXC_DIVIDE_ERROR => "Divide Error (#DE)",
		EXC_DEBUG => "Debug (#DB)",
		EXC_NMI => "Non-Maskable Interrupt (NMI)",
		EXC_BREAKPOINT => "Breakpoint (#BP)",
		EXC_OVERFLOW => "Overflow (#OF)",
		EXC_BOUND_RANGE => "BOUND Range Exceeded (#BR)",
		EXC_INVALID_OPCODE => "Invalid Opcode (#UD)",
		EXC_DEVICE_NOT_AVAILABLE => "Device Not Available (#NM)",
		EXC_DOUBLE_FAULT => "Double Fault (#DF)",
		EXC_INVALID_TSS => "Invalid TSS (#TS)",
		EXC_SEGMENT_NOT_PRESENT => "Segment Not Present (#NP)",
		EXC_STACK_SEGMENT_FAULT => "Stack Segment Fault (#SS)",
		EXC_GENERAL_PROTECTION => "General Protection (#GP)",
		EXC_PAGE_FAULT => "Page Fault (#PF)",
		EXC_X87_FLOATING_POINT => "Floating-Point Error (#MF)",
		EXC_ALIGNMENT_CHECK => "Alignment Check (#AC)",
		EXC_MACHINE_CHECK => "Machine Check (#MC)",
		EXC_SIMD_FLOATING_POINT => "SIMD Floating-Point (#XM)",
		EXC_VIRTUALIZATION => "Virtualization (#VE)",
		EXC_CONTROL_PROTECTION => "Control Protection (#CP)",
		_ => "Unknown",
	}
}
