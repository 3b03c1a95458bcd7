//! Context switches between the kernel-main context and user processes.
//!
//! Both directions work exclusively through `gs`-relative accesses into the
//! per-CPU block; the byte offsets are compile-time constants derived with
//! `offset_of!` (see `core_local::offsets`). Any layout change there changes
//! these stubs with it.

use core::arch::naked_asm;

use super::core_local::offsets::*;
use super::gdt;

const IA32_FS_BASE: u32 = 0xc000_0100;
const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;

/// xAPIC end-of-interrupt register, relative to the MMIO base.
const APIC_EOI_OFFSET: u32 = 0xb0;

/// Enter the process currently installed in the per-CPU block.
///
/// Saves the kernel-main context (callee-saved registers, return address,
/// FS base, vector state), loads the process's CR3 and register file, and
/// leaves through `sysretq`, or through a synthetic `iretq` frame when the
/// process was last suspended by an interrupt. Control returns here -- with
/// the kernel context restored by the save tail -- once the process yields.
///
/// # Safety
///
/// The per-CPU block must hold a complete, entrant process state, and
/// interrupts must be disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to_user() {
	naked_asm!(
		// Save the kernel-main context. The return address doubles as the
		// RIP the save tail jumps back to.
		"pop rax",
		"mov gs:[{km_rip}], rax",
		"mov gs:[{km_rsp}], rsp",
		"mov gs:[{km_rbx}], rbx",
		"mov gs:[{km_rbp}], rbp",
		"mov gs:[{km_r12}], r12",
		"mov gs:[{km_r13}], r13",
		"mov gs:[{km_r14}], r14",
		"mov gs:[{km_r15}], r15",
		"mov ecx, {fs_base_msr}",
		"rdmsr",
		"shl rdx, 32",
		"or rax, rdx",
		"mov gs:[{km_fs}], rax",
		"mov rax, qword ptr gs:[0]",
		"fxsave64 [rax + {km_vec}]",
		// Install the process address space.
		"mov rax, gs:[{cur_cr3}]",
		"mov cr3, rax",
		// User FS base, and user GS base parked in IA32_KERNEL_GS_BASE so
		// the swapgs below activates it.
		"mov rax, gs:[{cur_fs}]",
		"mov rdx, rax",
		"shr rdx, 32",
		"mov ecx, {fs_base_msr}",
		"wrmsr",
		"mov rax, gs:[{cur_gs}]",
		"mov rdx, rax",
		"shr rdx, 32",
		"mov ecx, {kgs_base_msr}",
		"wrmsr",
		"mov rax, qword ptr gs:[0]",
		"fxrstor64 [rax + {cur_vec}]",
		"mov rax, gs:[{cur_iret}]",
		"test rax, rax",
		"jnz 2f",
		// SYSRET protocol: RIP from RCX, RFLAGS from R11.
		"mov rcx, gs:[{cur_rip}]",
		"mov r11, gs:[{cur_rflags}]",
		"mov rsp, gs:[{cur_rsp}]",
		"mov rax, gs:[{cur_rax}]",
		"mov rbx, gs:[{cur_rbx}]",
		"mov rdx, gs:[{cur_rdx}]",
		"mov rsi, gs:[{cur_rsi}]",
		"mov rdi, gs:[{cur_rdi}]",
		"mov rbp, gs:[{cur_rbp}]",
		"mov r8, gs:[{cur_r8}]",
		"mov r9, gs:[{cur_r9}]",
		"mov r10, gs:[{cur_r10}]",
		"mov r12, gs:[{cur_r12}]",
		"mov r13, gs:[{cur_r13}]",
		"mov r14, gs:[{cur_r14}]",
		"mov r15, gs:[{cur_r15}]",
		"swapgs",
		"sysretq",
		// RCX/R11 carry live user values, so build an interrupt frame
		// {SS, RSP, RFLAGS, CS, RIP} and leave with iretq.
		"2:",
		"push {user_ss}",
		"push qword ptr gs:[{cur_rsp}]",
		"push qword ptr gs:[{cur_rflags}]",
		"push {user_cs}",
		"push qword ptr gs:[{cur_rip}]",
		"mov rax, gs:[{cur_rax}]",
		"mov rbx, gs:[{cur_rbx}]",
		"mov rcx, gs:[{cur_rcx}]",
		"mov rdx, gs:[{cur_rdx}]",
		"mov rsi, gs:[{cur_rsi}]",
		"mov rdi, gs:[{cur_rdi}]",
		"mov rbp, gs:[{cur_rbp}]",
		"mov r8, gs:[{cur_r8}]",
		"mov r9, gs:[{cur_r9}]",
		"mov r10, gs:[{cur_r10}]",
		"mov r11, gs:[{cur_r11}]",
		"mov r12, gs:[{cur_r12}]",
		"mov r13, gs:[{cur_r13}]",
		"mov r14, gs:[{cur_r14}]",
		"mov r15, gs:[{cur_r15}]",
		"swapgs",
		"iretq",
		km_rip = const KERNEL_REGS + REG_RIP,
		km_rsp = const KERNEL_REGS + REG_RSP,
		km_rbx = const KERNEL_REGS + REG_RBX,
		km_rbp = const KERNEL_REGS + REG_RBP,
		km_r12 = const KERNEL_REGS + REG_R12,
		km_r13 = const KERNEL_REGS + REG_R13,
		km_r14 = const KERNEL_REGS + REG_R14,
		km_r15 = const KERNEL_REGS + REG_R15,
		km_fs = const KERNEL_REGS + REG_FS_BASE,
		km_vec = const KERNEL_REGS + REG_VECTOR_STORE,
		cur_cr3 = const CURRENT_PAGE_TABLE,
		cur_fs = const CURRENT_REGS + REG_FS_BASE,
		cur_gs = const CURRENT_REGS + REG_GS_BASE,
		cur_vec = const CURRENT_REGS + REG_VECTOR_STORE,
		cur_iret = const CURRENT_REGS + REG_NEEDS_IRET,
		cur_rip = const CURRENT_REGS + REG_RIP,
		cur_rflags = const CURRENT_REGS + REG_RFLAGS,
		cur_rsp = const CURRENT_REGS + REG_RSP,
		cur_rax = const CURRENT_REGS + REG_RAX,
		cur_rbx = const CURRENT_REGS + REG_RBX,
		cur_rcx = const CURRENT_REGS + REG_RCX,
		cur_rdx = const CURRENT_REGS + REG_RDX,
		cur_rsi = const CURRENT_REGS + REG_RSI,
		cur_rdi = const CURRENT_REGS + REG_RDI,
		cur_rbp = const CURRENT_REGS + REG_RBP,
		cur_r8 = const CURRENT_REGS + REG_R8,
		cur_r9 = const CURRENT_REGS + REG_R9,
		cur_r10 = const CURRENT_REGS + REG_R10,
		cur_r11 = const CURRENT_REGS + REG_R11,
		cur_r12 = const CURRENT_REGS + REG_R12,
		cur_r13 = const CURRENT_REGS + REG_R13,
		cur_r14 = const CURRENT_REGS + REG_R14,
		cur_r15 = const CURRENT_REGS + REG_R15,
		fs_base_msr = const IA32_FS_BASE,
		kgs_base_msr = const IA32_KERNEL_GS_BASE,
		user_cs = const gdt::USER_CODE64_RING3 as u64,
		user_ss = const gdt::USER_DATA64_RING3 as u64,
	);
}

/// Common save body for returns driven by an interrupt or exception.
///
/// Entered by the stubs with GS already swapped, RAX already parked in the
/// register file, and a pushed error code (if any) already consumed, so the
/// interrupt frame {RIP, CS, RFLAGS, RSP, SS} sits on top of the stack.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn save_context_interrupt() -> ! {
	naked_asm!(
		"mov gs:[{cur_rbx}], rbx",
		"mov gs:[{cur_rcx}], rcx",
		"mov gs:[{cur_rdx}], rdx",
		"mov gs:[{cur_rsi}], rsi",
		"mov gs:[{cur_rdi}], rdi",
		"mov gs:[{cur_rbp}], rbp",
		"mov gs:[{cur_r8}], r8",
		"mov gs:[{cur_r9}], r9",
		"mov gs:[{cur_r10}], r10",
		"mov gs:[{cur_r11}], r11",
		"mov gs:[{cur_r12}], r12",
		"mov gs:[{cur_r13}], r13",
		"mov gs:[{cur_r14}], r14",
		"mov gs:[{cur_r15}], r15",
		"pop rax",
		"mov gs:[{cur_rip}], rax",
		"pop rax",
		"pop rax",
		"mov gs:[{cur_rflags}], rax",
		"pop rax",
		"mov gs:[{cur_rsp}], rax",
		"mov qword ptr gs:[{cur_iret}], 1",
		"jmp {tail}",
		cur_rbx = const CURRENT_REGS + REG_RBX,
		cur_rcx = const CURRENT_REGS + REG_RCX,
		cur_rdx = const CURRENT_REGS + REG_RDX,
		cur_rsi = const CURRENT_REGS + REG_RSI,
		cur_rdi = const CURRENT_REGS + REG_RDI,
		cur_rbp = const CURRENT_REGS + REG_RBP,
		cur_r8 = const CURRENT_REGS + REG_R8,
		cur_r9 = const CURRENT_REGS + REG_R9,
		cur_r10 = const CURRENT_REGS + REG_R10,
		cur_r11 = const CURRENT_REGS + REG_R11,
		cur_r12 = const CURRENT_REGS + REG_R12,
		cur_r13 = const CURRENT_REGS + REG_R13,
		cur_r14 = const CURRENT_REGS + REG_R14,
		cur_r15 = const CURRENT_REGS + REG_R15,
		cur_rip = const CURRENT_REGS + REG_RIP,
		cur_rflags = const CURRENT_REGS + REG_RFLAGS,
		cur_rsp = const CURRENT_REGS + REG_RSP,
		cur_iret = const CURRENT_REGS + REG_NEEDS_IRET,
		tail = sym save_context_tail,
	);
}

/// Common save body for returns driven by a yielding system call.
///
/// Entered by the SYSCALL handlers with GS already swapped and RAX/R10
/// already parked by the entry stub. RCX holds the user RIP and R11 the
/// user RFLAGS per the SYSCALL protocol; RSP is still the user stack.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn save_context_syscall() -> ! {
	naked_asm!(
		"mov gs:[{cur_rbx}], rbx",
		"mov gs:[{cur_rdx}], rdx",
		"mov gs:[{cur_rsi}], rsi",
		"mov gs:[{cur_rdi}], rdi",
		"mov gs:[{cur_rbp}], rbp",
		"mov gs:[{cur_r8}], r8",
		"mov gs:[{cur_r9}], r9",
		"mov gs:[{cur_r12}], r12",
		"mov gs:[{cur_r13}], r13",
		"mov gs:[{cur_r14}], r14",
		"mov gs:[{cur_r15}], r15",
		"mov gs:[{cur_rip}], rcx",
		"mov gs:[{cur_rflags}], r11",
		"mov gs:[{cur_rsp}], rsp",
		"mov qword ptr gs:[{cur_iret}], 0",
		"jmp {tail}",
		cur_rbx = const CURRENT_REGS + REG_RBX,
		cur_rdx = const CURRENT_REGS + REG_RDX,
		cur_rsi = const CURRENT_REGS + REG_RSI,
		cur_rdi = const CURRENT_REGS + REG_RDI,
		cur_rbp = const CURRENT_REGS + REG_RBP,
		cur_r8 = const CURRENT_REGS + REG_R8,
		cur_r9 = const CURRENT_REGS + REG_R9,
		cur_r12 = const CURRENT_REGS + REG_R12,
		cur_r13 = const CURRENT_REGS + REG_R13,
		cur_r14 = const CURRENT_REGS + REG_R14,
		cur_r15 = const CURRENT_REGS + REG_R15,
		cur_rip = const CURRENT_REGS + REG_RIP,
		cur_rflags = const CURRENT_REGS + REG_RFLAGS,
		cur_rsp = const CURRENT_REGS + REG_RSP,
		cur_iret = const CURRENT_REGS + REG_NEEDS_IRET,
		tail = sym save_context_tail,
	);
}

/// Symmetric inverse of the prologue of [`switch_to_user`]: stash the user
/// FS/GS bases and vector state, restore the kernel-main context, and jump
/// back into the scheduler loop.
#[unsafe(naked)]
unsafe extern "C" fn save_context_tail() -> ! {
	naked_asm!(
		"mov ecx, {fs_base_msr}",
		"rdmsr",
		"shl rdx, 32",
		"or rax, rdx",
		"mov gs:[{cur_fs}], rax",
		// The user GS base sits in IA32_KERNEL_GS_BASE after the swap.
		"mov ecx, {kgs_base_msr}",
		"rdmsr",
		"shl rdx, 32",
		"or rax, rdx",
		"mov gs:[{cur_gs}], rax",
		"mov rax, qword ptr gs:[0]",
		"fxsave64 [rax + {cur_vec}]",
		"fxrstor64 [rax + {km_vec}]",
		"mov rax, gs:[{km_fs}]",
		"mov rdx, rax",
		"shr rdx, 32",
		"mov ecx, {fs_base_msr}",
		"wrmsr",
		"mov rbx, gs:[{km_rbx}]",
		"mov rbp, gs:[{km_rbp}]",
		"mov r12, gs:[{km_r12}]",
		"mov r13, gs:[{km_r13}]",
		"mov r14, gs:[{km_r14}]",
		"mov r15, gs:[{km_r15}]",
		"mov rsp, gs:[{km_rsp}]",
		"mov rax, gs:[{km_rip}]",
		"jmp rax",
		cur_fs = const CURRENT_REGS + REG_FS_BASE,
		cur_gs = const CURRENT_REGS + REG_GS_BASE,
		cur_vec = const CURRENT_REGS + REG_VECTOR_STORE,
		km_vec = const KERNEL_REGS + REG_VECTOR_STORE,
		km_fs = const KERNEL_REGS + REG_FS_BASE,
		km_rbx = const KERNEL_REGS + REG_RBX,
		km_rbp = const KERNEL_REGS + REG_RBP,
		km_r12 = const KERNEL_REGS + REG_R12,
		km_r13 = const KERNEL_REGS + REG_R13,
		km_r14 = const KERNEL_REGS + REG_R14,
		km_r15 = const KERNEL_REGS + REG_R15,
		km_rsp = const KERNEL_REGS + REG_RSP,
		km_rip = const KERNEL_REGS + REG_RIP,
		fs_base_msr = const IA32_FS_BASE,
		kgs_base_msr = const IA32_KERNEL_GS_BASE,
	);
}

/// LVT timer entry. Preemption only applies to user mode: a tick that lands
/// in the kernel just flags one-shot expiry (for the `sti; hlt; cli` sleep
/// loop) and resumes; a tick in user mode records a timeout and falls into
/// the common save body.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn timer_interrupt_stub() {
	naked_asm!(
		"cmp qword ptr [rsp + 8], {kernel_cs}",
		"jne 2f",
		"push rax",
		"mov qword ptr gs:[{apic_received}], 1",
		"mov rax, gs:[{apic_mmio}]",
		"mov dword ptr [rax + {eoi}], 0",
		"pop rax",
		"iretq",
		"2:",
		"swapgs",
		"mov gs:[{cur_rax}], rax",
		"mov qword ptr gs:[{yield_reason}], {timeout}",
		"mov qword ptr gs:[{apic_received}], 1",
		"mov rax, gs:[{apic_mmio}]",
		"mov dword ptr [rax + {eoi}], 0",
		"jmp {save}",
		kernel_cs = const gdt::KERNEL_CODE as u64,
		apic_received = const APIC_INTERRUPT_RECEIVED,
		apic_mmio = const APIC_MMIO_BASE,
		eoi = const APIC_EOI_OFFSET,
		cur_rax = const CURRENT_REGS + REG_RAX,
		yield_reason = const YIELD_REASON,
		timeout = const crate::arch::x86_64::kernel::core_local::YieldReason::Timeout as u64,
		save = sym save_context_interrupt,
	);
}
