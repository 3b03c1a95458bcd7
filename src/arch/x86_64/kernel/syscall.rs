use core::arch::naked_asm;

use x86_64::registers::model_specific::{LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::{PrivilegeLevel, VirtAddr};

use super::core_local::YieldReason;
use super::core_local::offsets::*;
use super::gdt;
use super::scheduler::save_context_syscall;
use crate::syscalls::table::{NO_SYSCALLS, SYSHANDLER_TABLE};

/// Program STAR/LSTAR/FMASK for SYSCALL/SYSRET.
///
/// FMASK clears every maskable RFLAGS bit on kernel entry (bit 1 is the
/// always-one reserved bit); in particular interrupts stay off until the
/// process is resumed.
pub fn init() {
	let cs_sysret = SegmentSelector::new(gdt::USER_CODE64 / 8, PrivilegeLevel::Ring3);
	let ss_sysret = SegmentSelector::new(gdt::USER_DATA / 8, PrivilegeLevel::Ring3);
	let cs_syscall = SegmentSelector::new(gdt::KERNEL_CODE / 8, PrivilegeLevel::Ring0);
	let ss_syscall = SegmentSelector::new(gdt::KERNEL_DATA / 8, PrivilegeLevel::Ring0);

	Star::write(cs_sysret, ss_sysret, cs_syscall, ss_syscall)
		.expect("GDT layout violates the SYSRET selector convention");
	LStar::write(VirtAddr::new(syscall_handler as u64));
	SFMask::write(RFlags::from_bits_retain(!0x2));
}

/// LSTAR entry point.
///
/// Bounds-checks RAX against the table and tail-jumps to the handler slot.
/// RAX (the call number) and R10 (clobbered as the jump scratch register)
/// are parked in the register file up front; handlers that stay on the fast
/// path restore R10 themselves before `sysretq`.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn syscall_handler() {
	naked_asm!(
		"swapgs",
		"cmp rax, {count}",
		"jae 3f",
		"mov gs:[{cur_rax}], rax",
		"mov gs:[{cur_r10}], r10",
		"lea r10, [rip + {table}]",
		"mov r10, [r10 + rax * 8]",
		"jmp r10",
		"3:",
		"mov rax, -1",
		"swapgs",
		"sysretq",
		count = const NO_SYSCALLS as u64,
		cur_rax = const CURRENT_REGS + REG_RAX,
		cur_r10 = const CURRENT_REGS + REG_R10,
		table = sym SYSHANDLER_TABLE,
	);
}

/// `get_pid`: answered from the per-CPU block without leaving assembly.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn sys_get_pid_entry() {
	naked_asm!(
		"mov rax, gs:[{cur_id}]",
		"mov r10, gs:[{cur_r10}]",
		"swapgs",
		"sysretq",
		cur_id = const CURRENT_ID,
		cur_r10 = const CURRENT_REGS + REG_R10,
	);
}

/// Unknown index inside the table bounds: `-1`, stay in user mode.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn sys_invalid_entry() {
	naked_asm!(
		"mov r10, gs:[{cur_r10}]",
		"mov rax, -1",
		"swapgs",
		"sysretq",
		cur_r10 = const CURRENT_REGS + REG_R10,
	);
}

macro_rules! yielding_syscall_entry {
	($name:ident, $reason:expr) => {
		#[unsafe(naked)]
		pub(crate) unsafe extern "C" fn $name() {
			naked_asm!(
				"mov qword ptr gs:[{reason}], {value}",
				"jmp {save}",
				reason = const YIELD_REASON,
				value = const $reason as u64,
				save = sym save_context_syscall,
			);
		}
	};
}

// The saved RAX doubles as the call number the dispatcher indexes with.
yielding_syscall_entry!(sys_debug_entry, YieldReason::SyscallRequest);
yielding_syscall_entry!(sys_yield_entry, YieldReason::YieldSyscall);
yielding_syscall_entry!(sys_exit_entry, YieldReason::ExitRequest);
