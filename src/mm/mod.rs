pub mod allocator;

use thiserror::Error;

use crate::arch::x86_64::mm::paging::{BASE_PAGE_SIZE, PageTableEntryFlags};
use crate::arch::x86_64::mm::{kernel_space, physicalmem, virtualmem};
use crate::config::KERNEL_HEAP_SIZE;

/// Failure of the page allocator or one of the mappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
	#[error("out of physical memory")]
	OutOfMemory,
}

/// Bring up the physical frame bitmap, the kernel mapper and the heap.
///
/// Called once by the boot processor before anything allocates.
pub fn init() {
	physicalmem::init();
	crate::arch::x86_64::mm::init();

	let heap_start = virtualmem::allocate(KERNEL_HEAP_SIZE)
		.expect("no virtual window left for the kernel heap");

	{
		let mut space = kernel_space().lock();
		let mut flags = PageTableEntryFlags::PRESENT | PageTableEntryFlags::GLOBAL;
		flags.writable().execute_disable();

		for i in 0..KERNEL_HEAP_SIZE / BASE_PAGE_SIZE {
			let frame = physicalmem::reserve_page()
				.expect("out of physical memory while mapping the kernel heap");
			space
				.map_range(frame, heap_start + (i * BASE_PAGE_SIZE) as u64, flags, BASE_PAGE_SIZE)
				.expect("failed to map the kernel heap");
		}
	}

	unsafe {
		crate::ALLOCATOR.init(heap_start.as_mut_ptr(), KERNEL_HEAP_SIZE);
	}

	info!(
		"Kernel heap: {} MiB at {heap_start:p}",
		KERNEL_HEAP_SIZE >> 20
	);
	physicalmem::print_information();
}
