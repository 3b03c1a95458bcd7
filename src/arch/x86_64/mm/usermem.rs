use core::{cmp, ptr};

use memory_addresses::{PhysAddr, VirtAddr};

use crate::arch::x86_64::mm::paging::{
	self, BASE_PAGE_SIZE, LOWER_HALF_END, Mapper, PageTableEntryFlags, TABLE_ENTRIES, table_at,
	table_index,
};
use crate::arch::x86_64::mm::physicalmem;
use crate::mm::AllocError;

/// A per-process address space.
///
/// The lower 256 PML4 slots belong to the process; the upper 256 are copied
/// verbatim from the kernel's PML4 at construction and are never mutated
/// afterwards, so every process observes static kernel mappings without any
/// synchronization.
pub struct UserAddressSpace {
	mapper: Mapper,
}

impl UserAddressSpace {
	pub fn new() -> Result<Self, AllocError> {
		let root = physicalmem::reserve_page()?;
		let table = unsafe { table_at(root) };

		for entry in &mut table.entries[..TABLE_ENTRIES / 2] {
			entry.clear();
		}
		let kernel_root = super::kernel_space().lock().root_table();
		table.entries[TABLE_ENTRIES / 2..]
			.copy_from_slice(&kernel_root.entries[TABLE_ENTRIES / 2..]);

		Ok(Self {
			mapper: unsafe { Mapper::from_root(root) },
		})
	}

	/// Physical address of this space's PML4, suitable for CR3.
	#[inline]
	pub fn root(&self) -> PhysAddr {
		self.mapper.root()
	}

	/// Map `size` bytes at `virtual_address` and fill them from `buffer`.
	///
	/// `size.div_ceil(4096)` fresh frames are mapped. Each page receives
	/// `min(buffer.len() - written, 4096 - start_offset)` bytes; the
	/// remainder of every page, and every page past the buffer, is
	/// zero-filled. The start offset of the first page is
	/// `virtual_address & 0xfff`.
	pub fn map_copy_from_buffer(
		&mut self,
		virtual_address: VirtAddr,
		size: usize,
		buffer: &[u8],
	) -> Result<(), AllocError> {
		assert!(
			virtual_address.as_u64() + size as u64 <= LOWER_HALF_END,
			"user mapping at {virtual_address:p} + {size:#x} leaves the lower half"
		);

		let base = virtual_address.align_down(BASE_PAGE_SIZE as u64);
		let mut start_offset = (virtual_address.as_u64() & 0xfff) as usize;
		let mut written = 0;

		for i in 0..size.div_ceil(BASE_PAGE_SIZE) {
			let frame = physicalmem::reserve_page()?;
			// The frame may sit beyond the linear mapping; the temporary
			// window covers that case.
			let contents = super::temp_map(frame).as_mut_ptr::<u8>();

			let chunk = cmp::min(
				buffer.len().saturating_sub(written),
				BASE_PAGE_SIZE - start_offset,
			);
			unsafe {
				ptr::write_bytes(contents, 0, BASE_PAGE_SIZE);
				ptr::copy_nonoverlapping(
					buffer.as_ptr().add(written),
					contents.add(start_offset),
					chunk,
				);
			}
			written += chunk;
			start_offset = 0;

			self.mapper.map_range(
				frame,
				base + (i * BASE_PAGE_SIZE) as u64,
				PageTableEntryFlags::PRESENT
					| PageTableEntryFlags::WRITABLE
					| PageTableEntryFlags::USER_ACCESSIBLE,
				BASE_PAGE_SIZE,
			)?;
		}

		Ok(())
	}

	pub fn map_range(
		&mut self,
		physical_address: PhysAddr,
		virtual_address: VirtAddr,
		flags: PageTableEntryFlags,
		size: usize,
	) -> Result<(), AllocError> {
		assert!(virtual_address.as_u64() + size as u64 <= LOWER_HALF_END);
		self.mapper
			.map_range(physical_address, virtual_address, flags, size)
	}

	pub fn change_flags(
		&mut self,
		virtual_address: VirtAddr,
		flags: PageTableEntryFlags,
		size: usize,
	) {
		self.mapper.change_flags(virtual_address, flags, size);
	}

	/// Rewrite leaf flags and relax the parents on the way: the R/W/U union
	/// is merged in, and parent NX is cleared when the leaves become
	/// executable. The kernel mapper never does the latter.
	pub fn change_flags_relaxing(
		&mut self,
		virtual_address: VirtAddr,
		flags: PageTableEntryFlags,
		size: usize,
	) {
		self.mapper
			.change_flags_relaxing(virtual_address, flags, size, true);
	}

	pub fn check_flags(
		&self,
		virtual_address: VirtAddr,
		size: usize,
		flags: PageTableEntryFlags,
	) -> bool {
		self.mapper.check_flags(virtual_address, size, flags)
	}

	pub fn translate(&self, virtual_address: VirtAddr) -> Option<PhysAddr> {
		self.mapper.translate(virtual_address)
	}

	/// Remove the mapping at `virtual_address` and release every
	/// intermediate table that became empty on the way back up. The mapped
	/// frame itself is only released with `free_leaf`.
	pub fn unmap_page_recursive(&mut self, virtual_address: VirtAddr, free_leaf: bool) -> bool {
		assert!(virtual_address.as_u64() < LOWER_HALF_END);

		// Parent chain from the PML4 down to the PT, recorded for the
		// upward walk.
		let mut path = [(PhysAddr::zero(), 0usize); 3];
		let mut frame = self.mapper.root();

		for (slot, level) in (1..=3).rev().enumerate() {
			let table = unsafe { table_at(frame) };
			let index = table_index(virtual_address, level);
			let entry = table.entries[index];
			if !entry.is_present() {
				return false;
			}
			assert!(!entry.is_huge(), "huge pages are unsupported in user mappings");
			path[slot] = (frame, index);
			frame = entry.address();
		}

		let page_table = unsafe { table_at(frame) };
		let leaf = &mut page_table.entries[table_index(virtual_address, 0)];
		if !leaf.is_present() {
			return false;
		}
		if free_leaf {
			physicalmem::free_page(leaf.address());
		}
		leaf.clear();
		paging::flush_from_tlb(virtual_address);

		let mut child = frame;
		for (parent, index) in path.iter().rev() {
			let table = unsafe { table_at(child) };
			if table.entries.iter().any(|entry| entry.raw() != 0) {
				break;
			}
			physicalmem::free_page(child);
			unsafe { table_at(*parent) }.entries[*index].clear();
			child = *parent;
		}

		true
	}

	/// Walk the lower half and release every present parent and leaf frame,
	/// then the PML4 itself. The shared kernel mappings in the upper half
	/// are never touched.
	fn deinit(&mut self) {
		fn release_table(frame: PhysAddr, level: usize) {
			let table = unsafe { table_at(frame) };
			for entry in &mut table.entries {
				if entry.is_present() {
					if level > 0 {
						release_table(entry.address(), level - 1);
					}
					physicalmem::free_page(entry.address());
					entry.clear();
				}
			}
		}

		let root = self.mapper.root_table();
		for entry in &mut root.entries[..TABLE_ENTRIES / 2] {
			if entry.is_present() {
				release_table(entry.address(), 2);
				physicalmem::free_page(entry.address());
				entry.clear();
			}
		}

		physicalmem::free_page(self.mapper.root());
	}
}

impl Drop for UserAddressSpace {
	fn drop(&mut self) {
		self.deinit();
	}
}
