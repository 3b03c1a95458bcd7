pub mod table;

use alloc::string::String;
use alloc::vec::Vec;
use core::slice;

use memory_addresses::VirtAddr;

use crate::arch::x86_64::mm::paging::{BASE_PAGE_SIZE, LOWER_HALF_END};
use crate::scheduler::process::Process;

/// Upper bound on a single debug message.
const DEBUG_MESSAGE_LIMIT: u64 = 4096;

/// Handle a system call that made its process yield.
///
/// The fast-path calls (`get_pid`, and unknown indices) never get here;
/// they are answered in the entry assembly. What arrives is the saved RAX
/// as the call number with the arguments still in the register file. The
/// return value ends up in the process's RAX for the next SYSRET.
pub fn dispatch(process: &mut Process) -> u64 {
	match process.registers.rax as usize {
		table::SYSNO_DEBUG => sys_debug(process),
		_ => u64::MAX,
	}
}

/// `debug(ptr, len)`: log a message from user memory, returns 0.
fn sys_debug(process: &Process) -> u64 {
	let pointer = process.registers.rdi;
	let length = process.registers.rsi;

	if length > DEBUG_MESSAGE_LIMIT {
		return u64::MAX;
	}
	let Some(end) = pointer.checked_add(length) else {
		return u64::MAX;
	};
	if end > LOWER_HALF_END {
		return u64::MAX;
	}

	let Some(bytes) = copy_from_user(process, pointer, length as usize) else {
		return u64::MAX;
	};

	info!("[{}] {}", process.id, String::from_utf8_lossy(&bytes));
	0
}

/// Copy a user buffer page by page through the process's own mapper, so
/// the read works no matter which CR3 is live.
fn copy_from_user(process: &Process, pointer: u64, length: usize) -> Option<Vec<u8>> {
	let space = process.address_space()?;
	let mut bytes = Vec::with_capacity(length);
	let mut current = pointer;
	let end = pointer + length as u64;

	while current < end {
		let page_end = (current & !(BASE_PAGE_SIZE as u64 - 1)) + BASE_PAGE_SIZE as u64;
		let chunk = end.min(page_end) - current;

		let physical = space.translate(VirtAddr::new(current))?;
		let source = crate::arch::x86_64::mm::temp_map(physical).as_ptr::<u8>();
		bytes.extend_from_slice(unsafe { slice::from_raw_parts(source, chunk as usize) });

		current += chunk;
	}

	Some(bytes)
}
