use core::fmt;

use memory_addresses::{PhysAddr, VirtAddr};

use crate::arch::x86_64::mm::physicalmem;
use crate::mm::AllocError;

/// Number of offset bits of a virtual address for a 4 KiB page.
pub const PAGE_BITS: usize = 12;

/// Number of bits of the index in each table (PML4, PDPT, PD, PT).
pub const PAGE_MAP_BITS: usize = 9;

/// A mask where PAGE_MAP_BITS are set to calculate a table index.
pub const PAGE_MAP_MASK: u64 = 0x1ff;

/// Size of a 4 KiB base page.
pub const BASE_PAGE_SIZE: usize = 4096;

/// Size of a 2 MiB page referenced by a PD entry with the HUGE_PAGE flag.
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Number of entries in each table.
pub const TABLE_ENTRIES: usize = 1 << PAGE_MAP_BITS;

/// First virtual address of the upper (kernel) half.
pub const UPPER_HALF_START: u64 = 0xffff_8000_0000_0000;

/// First non-canonical address above the lower (user) half.
pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Start of the bootloader-provided linear mapping of physical memory.
pub const DIRECT_MAP_START: u64 = 0xffff_9000_0000_0000;

/// Mask of the physical frame bits within a page-table entry (bits 12..52).
const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags::bitflags! {
	/// Possible flags for an entry in either table (PML4, PDPT, PD, PT)
	///
	/// See Intel Vol. 3A, Tables 4-14 through 4-19
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageTableEntryFlags: u64 {
		/// Set if this entry is valid and points to a page or table.
		const PRESENT = 1 << 0;

		/// Set if memory referenced by this entry shall be writable.
		const WRITABLE = 1 << 1;

		/// Set if memory referenced by this entry shall be accessible from user-mode (Ring 3).
		const USER_ACCESSIBLE = 1 << 2;

		/// Set if Write-Through caching shall be enabled for memory referenced by this entry.
		/// Otherwise, Write-Back caching is used.
		const WRITE_THROUGH = 1 << 3;

		/// Set if caching shall be disabled for memory referenced by this entry.
		const CACHE_DISABLE = 1 << 4;

		/// Set if software has accessed this entry (for memory access or address translation).
		const ACCESSED = 1 << 5;

		/// Only for page entries: Set if software has written to the memory referenced by this entry.
		const DIRTY = 1 << 6;

		/// Only for page entries in PDPT or PD: Set if this entry references a 1 GiB (PDPT) or 2 MiB (PD) page.
		const HUGE_PAGE = 1 << 7;

		/// Only for page entries: Set if this address translation is global for all tasks and does not need to
		/// be flushed from the TLB when CR3 is reset.
		const GLOBAL = 1 << 8;

		/// Set if code execution shall be disabled for memory referenced by this entry.
		const EXECUTE_DISABLE = 1 << 63;
	}
}

impl PageTableEntryFlags {
	/// An empty set of flags for unused/zeroed table entries.
	pub const BLANK: PageTableEntryFlags = PageTableEntryFlags::empty();

	/// Flags set on every freshly installed parent table (the restrictive
	/// bits live in the leaves).
	pub const PARENT: PageTableEntryFlags = PageTableEntryFlags::PRESENT
		.union(PageTableEntryFlags::WRITABLE)
		.union(PageTableEntryFlags::USER_ACCESSIBLE);

	pub fn device(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::CACHE_DISABLE);
		self
	}

	pub fn normal(&mut self) -> &mut Self {
		self.remove(PageTableEntryFlags::CACHE_DISABLE);
		self
	}

	pub fn read_only(&mut self) -> &mut Self {
		self.remove(PageTableEntryFlags::WRITABLE);
		self
	}

	pub fn writable(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::WRITABLE);
		self
	}

	pub fn user(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::USER_ACCESSIBLE);
		self
	}

	pub fn execute_disable(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::EXECUTE_DISABLE);
		self
	}

	pub fn execute_enable(&mut self) -> &mut Self {
		self.remove(PageTableEntryFlags::EXECUTE_DISABLE);
		self
	}
}

/// An entry in either table (PML4, PDPT, PD, PT)
#[derive(Clone, Copy, Default)]
#[repr(transparent)]
pub struct PageTableEntry {
	/// Physical memory address this entry refers, combined with flags from PageTableEntryFlags.
	physical_address_and_flags: u64,
}

impl PageTableEntry {
	pub const fn zero() -> Self {
		Self {
			physical_address_and_flags: 0,
		}
	}

	/// Return the stored physical frame address (bits 12..52).
	pub fn address(self) -> PhysAddr {
		PhysAddr::new(self.physical_address_and_flags & ADDRESS_MASK)
	}

	pub fn flags(self) -> PageTableEntryFlags {
		PageTableEntryFlags::from_bits_truncate(self.physical_address_and_flags)
	}

	pub fn is_present(self) -> bool {
		self.flags().contains(PageTableEntryFlags::PRESENT)
	}

	pub fn is_huge(self) -> bool {
		self.flags().contains(PageTableEntryFlags::HUGE_PAGE)
	}

	pub fn is_user(self) -> bool {
		self.flags().contains(PageTableEntryFlags::USER_ACCESSIBLE)
	}

	/// Mark this as a valid (present) entry and set address translation and flags.
	///
	/// The PRESENT flag is set automatically, undefined bits in `flags` are
	/// discarded.
	pub fn set(&mut self, physical_address: PhysAddr, flags: PageTableEntryFlags) {
		debug_assert!(
			physical_address.as_u64() % BASE_PAGE_SIZE as u64 == 0,
			"physical address is not on a 4 KiB page boundary (physical_address = {physical_address:p})"
		);

		let flags_to_set = flags | PageTableEntryFlags::PRESENT;
		self.physical_address_and_flags = physical_address.as_u64() | flags_to_set.bits();
	}

	/// Reset this entry to the all-zero non-present pattern.
	pub fn clear(&mut self) {
		self.physical_address_and_flags = 0;
	}

	pub const fn from_raw(raw: u64) -> Self {
		Self {
			physical_address_and_flags: raw,
		}
	}

	pub const fn raw(self) -> u64 {
		self.physical_address_and_flags
	}
}

impl fmt::Debug for PageTableEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PageTableEntry")
			.field("address", &self.address())
			.field("flags", &self.flags())
			.finish()
	}
}

/// Representation of any page table (PML4, PDPT, PD, PT) in memory.
#[repr(C, align(4096))]
pub struct PageTable {
	pub entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
	pub fn zero(&mut self) {
		for entry in &mut self.entries {
			entry.clear();
		}
	}
}

/// Returns the index of `virtual_address` in the table at the given level
/// (from 0 for PT through 3 for PML4).
#[inline]
pub fn table_index(virtual_address: VirtAddr, level: usize) -> usize {
	(virtual_address.as_u64() >> PAGE_BITS >> (level * PAGE_MAP_BITS) & PAGE_MAP_MASK) as usize
}

/// Translate a physical address into the bootloader's linear mapping.
///
/// Only valid for frames below the mapped size announced in the boot
/// arguments; higher frames have to go through the temporary window.
#[inline]
pub fn phys_to_virt(physical_address: PhysAddr) -> VirtAddr {
	debug_assert!(
		physical_address.as_usize() < crate::env::direct_mapped_size(),
		"physical address {physical_address:p} is beyond the linear mapping"
	);
	VirtAddr::new(DIRECT_MAP_START + physical_address.as_u64())
}

/// Access the page table stored in the given physical frame.
///
/// # Safety
///
/// The frame must hold a page table owned by the calling mapper.
pub unsafe fn table_at(frame: PhysAddr) -> &'static mut PageTable {
	unsafe { &mut *phys_to_virt(frame).as_mut_ptr::<PageTable>() }
}

/// Flushes the page including `virtual_address` from the TLB of this CPU.
#[inline]
pub(crate) fn flush_from_tlb(virtual_address: VirtAddr) {
	#[cfg(target_os = "none")]
	x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virtual_address.as_u64()));
	#[cfg(not(target_os = "none"))]
	let _ = virtual_address;
}

/// Returns whether the given virtual address is a valid one in the x86-64 memory model.
///
/// Current x86-64 supports only 48-bit for virtual memory addresses.
/// This is enforced by requiring bits 63 through 48 to replicate bit 47
/// (cf. Intel Vol. 1, 3.3.7.1).
#[inline]
pub fn is_canonical(virtual_address: u64) -> bool {
	virtual_address < LOWER_HALF_END || virtual_address >= UPPER_HALF_START
}

/// A four-level mapper rooted at one PML4 frame.
///
/// The kernel owns exactly one of these (held by `physicalmem` right after
/// boot, see `mm::init`); every user process owns another through
/// `usermem::UserAddressSpace`.
pub struct Mapper {
	root: PhysAddr,
}

impl Mapper {
	/// # Safety
	///
	/// `root` must reference a valid, linearly mapped PML4 frame.
	pub const unsafe fn from_root(root: PhysAddr) -> Self {
		Self { root }
	}

	#[inline]
	pub fn root(&self) -> PhysAddr {
		self.root
	}

	pub fn root_table(&self) -> &'static mut PageTable {
		unsafe { table_at(self.root) }
	}

	/// Walk down to the page table (level 0) covering `virtual_address`,
	/// reserving and zero-filling missing parent tables.
	///
	/// Freshly installed parents carry `PRESENT | WRITABLE | USER_ACCESSIBLE`;
	/// the restrictive bits are enforced at the leaves.
	fn walk_create(
		&mut self,
		virtual_address: VirtAddr,
	) -> Result<&'static mut PageTable, AllocError> {
		let mut table = self.root_table();

		for level in (1..=3).rev() {
			let index = table_index(virtual_address, level);
			let entry = &mut table.entries[index];

			if !entry.is_present() {
				let frame = physicalmem::reserve_page()?;
				unsafe {
					table_at(frame).zero();
				}
				entry.set(frame, PageTableEntryFlags::PARENT);
				flush_from_tlb(virtual_address);
			}

			debug_assert!(
				!entry.is_huge(),
				"huge page in the way of a 4 KiB mapping at {virtual_address:p}"
			);
			table = unsafe { table_at(entry.address()) };
		}

		Ok(table)
	}

	/// Walk down to the page table (level 0) covering `virtual_address`
	/// without modifying anything. Returns `None` if the path is incomplete
	/// or blocked by a huge page.
	fn walk(&self, virtual_address: VirtAddr) -> Option<&'static mut PageTable> {
		let mut table = self.root_table();

		for level in (1..=3).rev() {
			let entry = table.entries[table_index(virtual_address, level)];
			if !entry.is_present() || entry.is_huge() {
				return None;
			}
			table = unsafe { table_at(entry.address()) };
		}

		Some(table)
	}

	/// Map the physical range `[physical_address, physical_address + size)`
	/// at `virtual_address`.
	///
	/// The covered page count is computed from the page-aligned *physical*
	/// interval; callers have to pass addresses with equal page offsets.
	pub fn map_range(
		&mut self,
		physical_address: PhysAddr,
		virtual_address: VirtAddr,
		flags: PageTableEntryFlags,
		size: usize,
	) -> Result<(), AllocError> {
		assert!(size > 0);
		debug_assert_eq!(
			physical_address.as_u64() % BASE_PAGE_SIZE as u64,
			virtual_address.as_u64() % BASE_PAGE_SIZE as u64,
			"physical and virtual address have different page offsets"
		);
		assert!(
			is_canonical(virtual_address.as_u64())
				&& is_canonical(virtual_address.as_u64() + size as u64 - 1),
			"mapping wraps the canonical boundary at {virtual_address:p} + {size:#x}"
		);

		#[cfg(feature = "mm-trace")]
		log::trace!("Mapping {physical_address:p} to {virtual_address:p} ({size:#x} bytes)");

		let first_page = physical_address.align_down(BASE_PAGE_SIZE as u64);
		let last_page = (physical_address + size as u64 - 1u64).align_down(BASE_PAGE_SIZE as u64);
		let count = ((last_page - first_page) / BASE_PAGE_SIZE as u64 + 1) as usize;

		let virt_base = virtual_address.align_down(BASE_PAGE_SIZE as u64);
		let leaf_flags = PageTableEntryFlags::from_bits_truncate(flags.bits());

		for i in 0..count {
			let page = virt_base + (i * BASE_PAGE_SIZE) as u64;
			let frame = first_page + (i * BASE_PAGE_SIZE) as u64;

			let table = self.walk_create(page)?;
			table.entries[table_index(page, 0)].set(frame, leaf_flags);
			flush_from_tlb(page);
		}

		Ok(())
	}

	/// Remove the 4 KiB mapping at `virtual_address` and release the mapped
	/// frame. Returns whether a mapping existed.
	///
	/// Empty parent tables are not collapsed here; the user mapper walks
	/// them separately.
	pub fn unmap_page(&mut self, virtual_address: VirtAddr) -> bool {
		let mut table = self.root_table();

		for level in (1..=3).rev() {
			let entry = table.entries[table_index(virtual_address, level)];
			if !entry.is_present() {
				return false;
			}
			assert!(
				!entry.is_huge(),
				"unmapping through a huge page at {virtual_address:p} is unsupported"
			);
			table = unsafe { table_at(entry.address()) };
		}

		let entry = &mut table.entries[table_index(virtual_address, 0)];
		if !entry.is_present() {
			return false;
		}

		physicalmem::free_page(entry.address());
		entry.clear();
		flush_from_tlb(virtual_address);

		true
	}

	/// Rewrite the flags of every present leaf in the given range. Parent
	/// tables are left untouched.
	pub fn change_flags(
		&mut self,
		virtual_address: VirtAddr,
		flags: PageTableEntryFlags,
		size: usize,
	) {
		let leaf_flags = PageTableEntryFlags::from_bits_truncate(flags.bits());

		for page in pages(virtual_address, size) {
			if let Some(table) = self.walk(page) {
				let entry = &mut table.entries[table_index(page, 0)];
				if entry.is_present() {
					entry.set(entry.address(), leaf_flags);
					flush_from_tlb(page);
				}
			}
		}
	}

	/// Like [`change_flags`], but additionally merges `PRESENT`, `WRITABLE`
	/// and `USER_ACCESSIBLE` from the new leaf flags into every parent on the
	/// path, and, with `relax_parent_nx`, clears the parents' EXECUTE_DISABLE
	/// bit when the new leaf flags allow execution.
	///
	/// The kernel mapper never relaxes parent NX; the user mapper does (its
	/// parents sit beneath a PML4 inherited from the kernel).
	///
	/// [`change_flags`]: Self::change_flags
	pub fn change_flags_relaxing(
		&mut self,
		virtual_address: VirtAddr,
		flags: PageTableEntryFlags,
		size: usize,
		relax_parent_nx: bool,
	) {
		let leaf_flags = PageTableEntryFlags::from_bits_truncate(flags.bits());
		let merged = leaf_flags
			& (PageTableEntryFlags::PRESENT
				| PageTableEntryFlags::WRITABLE
				| PageTableEntryFlags::USER_ACCESSIBLE);
		let allow_execute = !leaf_flags.contains(PageTableEntryFlags::EXECUTE_DISABLE);

		for page in pages(virtual_address, size) {
			let mut table = self.root_table();
			let mut complete = true;

			for level in (1..=3).rev() {
				let entry = &mut table.entries[table_index(page, level)];
				if !entry.is_present() {
					complete = false;
					break;
				}

				let mut parent_flags = entry.flags() | merged;
				if relax_parent_nx && allow_execute {
					parent_flags.remove(PageTableEntryFlags::EXECUTE_DISABLE);
				}
				entry.set(entry.address(), parent_flags);

				table = unsafe { table_at(entry.address()) };
			}

			if complete {
				let entry = &mut table.entries[table_index(page, 0)];
				if entry.is_present() {
					entry.set(entry.address(), leaf_flags);
				}
			}
			flush_from_tlb(page);
		}
	}

	/// Returns whether every page in the range is present and carries all
	/// of the given flags.
	pub fn check_flags(
		&self,
		virtual_address: VirtAddr,
		size: usize,
		flags: PageTableEntryFlags,
	) -> bool {
		let wanted = PageTableEntryFlags::from_bits_truncate(flags.bits());

		pages(virtual_address, size).all(|page| match self.walk(page) {
			Some(table) => {
				let entry = table.entries[table_index(page, 0)];
				entry.is_present() && entry.flags().contains(wanted)
			}
			None => false,
		})
	}

	/// Translate a virtual memory address to a physical one.
	///
	/// Huge pages are translated through (detection only, cf. the bootloader
	/// mapping the kernel image in 2 MiB pages); everything else walks down
	/// to the leaf level.
	pub fn translate(&self, virtual_address: VirtAddr) -> Option<PhysAddr> {
		let mut table = self.root_table();

		for level in (1..=3).rev() {
			let entry = table.entries[table_index(virtual_address, level)];
			if !entry.is_present() {
				return None;
			}
			if entry.is_huge() {
				let huge_size = 1u64 << (PAGE_BITS + level * PAGE_MAP_BITS);
				let offset = virtual_address.as_u64() & (huge_size - 1);
				return Some(entry.address() + offset);
			}
			table = unsafe { table_at(entry.address()) };
		}

		let entry = table.entries[table_index(virtual_address, 0)];
		entry
			.is_present()
			.then(|| entry.address() + (virtual_address.as_u64() & (BASE_PAGE_SIZE as u64 - 1)))
	}
}

/// Iterate over the 4 KiB pages covering `[virtual_address, virtual_address + size)`.
fn pages(virtual_address: VirtAddr, size: usize) -> impl Iterator<Item = VirtAddr> {
	let first = virtual_address.align_down(BASE_PAGE_SIZE as u64);
	let count = if size == 0 {
		0
	} else {
		let last = (virtual_address + size as u64 - 1u64).align_down(BASE_PAGE_SIZE as u64);
		((last - first) / BASE_PAGE_SIZE as u64 + 1) as usize
	};

	(0..count).map(move |i| first + (i * BASE_PAGE_SIZE) as u64)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::*;

	#[test]
	fn entry_round_trip() {
		// Every defined flag plus a frame address must survive decode/encode.
		let patterns = [
			0u64,
			PageTableEntryFlags::PRESENT.bits() | 0x1000,
			(PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE).bits() | 0xdead_b000,
			(PageTableEntryFlags::PRESENT
				| PageTableEntryFlags::USER_ACCESSIBLE
				| PageTableEntryFlags::EXECUTE_DISABLE)
				.bits() | 0x000f_ffff_ffff_f000,
			(PageTableEntryFlags::PRESENT
				| PageTableEntryFlags::ACCESSED
				| PageTableEntryFlags::DIRTY
				| PageTableEntryFlags::GLOBAL)
				.bits() | 0x12_3456_7000,
		];

		for raw in patterns {
			let entry = PageTableEntry::from_raw(raw);
			let rebuilt = entry.address().as_u64() | entry.flags().bits();
			assert_eq!(rebuilt, raw, "pattern {raw:#x} did not round-trip");
		}
	}

	#[test]
	fn entry_accessors() {
		let mut entry = PageTableEntry::zero();
		assert!(!entry.is_present());
		assert_eq!(entry.raw(), 0);

		entry.set(
			PhysAddr::new(0x7fff_f000),
			PageTableEntryFlags::WRITABLE | PageTableEntryFlags::EXECUTE_DISABLE,
		);
		assert!(entry.is_present());
		assert!(!entry.is_huge());
		assert!(!entry.is_user());
		assert_eq!(entry.address(), PhysAddr::new(0x7fff_f000));

		entry.clear();
		assert_eq!(entry.raw(), 0, "non-present entries preserve the zero pattern");
	}

	#[test]
	fn table_indices() {
		let virtual_address = VirtAddr::new(0x0000_1234_5678_9000);
		let reassembled = (table_index(virtual_address, 3) << 39)
			| (table_index(virtual_address, 2) << 30)
			| (table_index(virtual_address, 1) << 21)
			| (table_index(virtual_address, 0) << 12);
		assert_eq!(reassembled as u64, virtual_address.as_u64());
	}

	#[test]
	fn canonical_boundaries() {
		assert!(is_canonical(0));
		assert!(is_canonical(0x0000_7fff_ffff_ffff));
		assert!(!is_canonical(0x0000_8000_0000_0000));
		assert!(!is_canonical(0xffff_7fff_ffff_ffff));
		assert!(is_canonical(0xffff_8000_0000_0000));
		assert!(is_canonical(u64::MAX));
	}

	#[test]
	fn page_iteration() {
		let covered: Vec<_> = pages(VirtAddr::new(0x1fff), 2).collect();
		assert_eq!(covered, [VirtAddr::new(0x1000), VirtAddr::new(0x2000)]);

		let covered: Vec<_> = pages(VirtAddr::new(0x4000), 0x1000).collect();
		assert_eq!(covered, [VirtAddr::new(0x4000)]);
	}
}
