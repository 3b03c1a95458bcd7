use alloc::boxed::Box;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use elf::ElfBytes;
use elf::abi::{EM_X86_64, ET_EXEC, PF_W, PF_X, PT_GNU_STACK, PT_LOAD};
use elf::endian::LittleEndian;
use memory_addresses::{PhysAddr, VirtAddr};
use thiserror::Error;

use crate::arch::x86_64::kernel::core_local::RegisterFile;
use crate::arch::x86_64::mm::paging::{BASE_PAGE_SIZE, LOWER_HALF_END, PageTableEntryFlags};
use crate::arch::x86_64::mm::usermem::UserAddressSpace;
use crate::config::USER_STACK_RESERVATION;
use crate::mm::AllocError;

#[derive(Debug, Error)]
pub enum LoadError {
	#[error("not a loadable ELF image")]
	InvalidElf,
	#[error("image was built for a different CPU architecture")]
	WrongCpuArchitecture,
	#[error("image is not a static executable")]
	NotExecutable,
	#[error("segment at {0:#x} leaves the user address range")]
	SegmentOutOfRange(u64),
	#[error(transparent)]
	Alloc(#[from] AllocError),
}

/// Unique identifier for a process (i.e. `pid`), monotonically increasing.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct ProcessId(u64);

impl ProcessId {
	pub const fn into(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ProcessId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

fn next_process_id() -> ProcessId {
	ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
}

/// Priority of a process. 0 is served first.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Priority(u8);

impl Priority {
	pub const fn into(self) -> u8 {
		self.0
	}

	pub const fn from(x: u8) -> Self {
		Priority(x)
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

pub const HIGH_PRIO: Priority = Priority::from(0);
pub const NORMAL_PRIO: Priority = Priority::from(128);
pub const LOW_PRIO: Priority = Priority::from(255);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
	Kernel,
	User,
}

/// A schedulable process.
///
/// `prev`/`next` are the intrusive run-queue links; both are `None` exactly
/// while the process is not enqueued.
pub struct Process {
	pub id: ProcessId,
	pub kind: ProcessKind,
	pub priority: Priority,
	/// Saved architectural state while the process is not running.
	pub registers: RegisterFile,
	/// Address space; `None` for kernel-kind processes, which share the
	/// kernel mapper.
	space: Option<UserAddressSpace>,
	pub stack_range: (VirtAddr, usize),
	pub stack_flags: PageTableEntryFlags,
	pub(crate) prev: Option<NonNull<Process>>,
	pub(crate) next: Option<NonNull<Process>>,
}

/// Leaf flags equivalent to an ELF segment's `p_flags`.
fn flags_from_elf(p_flags: u32) -> PageTableEntryFlags {
	let mut flags = PageTableEntryFlags::PRESENT | PageTableEntryFlags::USER_ACCESSIBLE;
	if p_flags & PF_W != 0 {
		flags.insert(PageTableEntryFlags::WRITABLE);
	}
	if p_flags & PF_X == 0 {
		flags.insert(PageTableEntryFlags::EXECUTE_DISABLE);
	}
	flags
}

impl Process {
	/// Build a user process from a statically linked ELF-64 executable.
	///
	/// Every `PT_LOAD` segment is copied into a fresh address space and
	/// then re-protected with the segment's own flags; a `PT_GNU_STACK`
	/// entry overrides the write/execute bits of the initial stack. The
	/// 4 KiB stack page sits on the first page boundary past the highest
	/// program segment, leaving the configured reservation above it free.
	pub fn from_elf(file: &[u8]) -> Result<Box<Process>, LoadError> {
		let elf =
			ElfBytes::<LittleEndian>::minimal_parse(file).map_err(|_| LoadError::InvalidElf)?;

		if elf.ehdr.e_machine != EM_X86_64 {
			return Err(LoadError::WrongCpuArchitecture);
		}
		if elf.ehdr.e_type != ET_EXEC {
			return Err(LoadError::NotExecutable);
		}

		let segments = elf.segments().ok_or(LoadError::InvalidElf)?;

		let mut space = UserAddressSpace::new()?;
		let mut highest_end = 0u64;
		let mut stack_flags = PageTableEntryFlags::PRESENT
			| PageTableEntryFlags::WRITABLE
			| PageTableEntryFlags::USER_ACCESSIBLE
			| PageTableEntryFlags::EXECUTE_DISABLE;

		for ph in segments.iter() {
			match ph.p_type {
				PT_LOAD => {
					let end = ph
						.p_vaddr
						.checked_add(ph.p_memsz)
						.ok_or(LoadError::SegmentOutOfRange(ph.p_vaddr))?;
					if end > LOWER_HALF_END - USER_STACK_RESERVATION {
						return Err(LoadError::SegmentOutOfRange(ph.p_vaddr));
					}

					let data = elf.segment_data(&ph).map_err(|_| LoadError::InvalidElf)?;
					space.map_copy_from_buffer(
						VirtAddr::new(ph.p_vaddr),
						ph.p_memsz as usize,
						data,
					)?;
					space.change_flags_relaxing(
						VirtAddr::new(ph.p_vaddr),
						flags_from_elf(ph.p_flags),
						ph.p_memsz as usize,
					);

					highest_end = highest_end.max(end);
				}
				PT_GNU_STACK => {
					stack_flags = flags_from_elf(ph.p_flags);
				}
				_ => {}
			}
		}

		if highest_end == 0 {
			return Err(LoadError::InvalidElf);
		}

		let stack_page =
			VirtAddr::new(highest_end.next_multiple_of(BASE_PAGE_SIZE as u64));
		space.map_copy_from_buffer(stack_page, BASE_PAGE_SIZE, &[])?;
		space.change_flags_relaxing(stack_page, stack_flags, BASE_PAGE_SIZE);

		let mut registers = RegisterFile::zeroed();
		registers.rip = elf.ehdr.e_entry;
		// Top of the stack page, minus one slot, keeping the 8-byte
		// alignment an entry point expects.
		registers.rsp = (stack_page + BASE_PAGE_SIZE as u64 - 8u64).as_u64();
		registers.rflags = 0x202;

		Ok(Box::new(Process {
			id: next_process_id(),
			kind: ProcessKind::User,
			priority: NORMAL_PRIO,
			registers,
			space: Some(space),
			stack_range: (stack_page, BASE_PAGE_SIZE),
			stack_flags,
			prev: None,
			next: None,
		}))
	}

	pub fn address_space(&self) -> Option<&UserAddressSpace> {
		self.space.as_ref()
	}

	/// CR3 value the process runs under.
	pub fn page_table_root(&self) -> PhysAddr {
		match &self.space {
			Some(space) => space.root(),
			None => crate::arch::x86_64::mm::kernel_space().lock().root(),
		}
	}

	#[cfg(all(test, not(target_os = "none")))]
	pub(crate) fn dummy(priority: Priority) -> Box<Process> {
		Box::new(Process {
			id: next_process_id(),
			kind: ProcessKind::Kernel,
			priority,
			registers: RegisterFile::zeroed(),
			space: None,
			stack_range: (VirtAddr::zero(), 0),
			stack_flags: PageTableEntryFlags::BLANK,
			prev: None,
			next: None,
		})
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn elf_flag_conversion() {
		// R-- : present, user, no write, no execute
		let flags = flags_from_elf(0b100);
		assert!(flags.contains(PageTableEntryFlags::PRESENT));
		assert!(flags.contains(PageTableEntryFlags::USER_ACCESSIBLE));
		assert!(!flags.contains(PageTableEntryFlags::WRITABLE));
		assert!(flags.contains(PageTableEntryFlags::EXECUTE_DISABLE));

		// R-X : executable clears the NX bit
		let flags = flags_from_elf(0b101);
		assert!(!flags.contains(PageTableEntryFlags::EXECUTE_DISABLE));

		// RW- : writable data
		let flags = flags_from_elf(0b110);
		assert!(flags.contains(PageTableEntryFlags::WRITABLE));
		assert!(flags.contains(PageTableEntryFlags::EXECUTE_DISABLE));
	}

	#[test]
	fn process_ids_ascend() {
		let first = next_process_id();
		let second = next_process_id();
		assert!(second > first);
	}

	#[test]
	fn rejects_foreign_architecture() {
		// A minimal ELF header claiming EM_AARCH64 (183).
		let mut image = [0u8; 64];
		image[..4].copy_from_slice(b"\x7fELF");
		image[4] = 2; // 64-bit
		image[5] = 1; // little endian
		image[6] = 1; // version
		image[16] = 2; // ET_EXEC
		image[18] = 183;
		image[20] = 1; // e_version

		assert!(matches!(
			Process::from_elf(&image),
			Err(LoadError::WrongCpuArchitecture)
		));
	}
}
