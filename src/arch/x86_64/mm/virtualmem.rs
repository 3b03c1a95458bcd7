use free_list::{FreeList, PageLayout, PageRange};
use hermit_sync::InterruptTicketMutex;
use memory_addresses::VirtAddr;

use crate::arch::x86_64::mm::paging::BASE_PAGE_SIZE;
use crate::mm::AllocError;

/// Start of the upper-half window region handed out for MMIO mappings, the
/// kernel heap and the temporary mapping page.
pub const KERNEL_WINDOW_START: usize = 0xffff_a000_0000_0000;

/// Size of the window region (64 GiB).
pub const KERNEL_WINDOW_SIZE: usize = 64 * 1024 * 1024 * 1024;

static KERNEL_FREE_LIST: InterruptTicketMutex<FreeList<16>> =
	InterruptTicketMutex::new(FreeList::new());

pub fn init() {
	let range = PageRange::new(KERNEL_WINDOW_START, KERNEL_WINDOW_START + KERNEL_WINDOW_SIZE)
		.unwrap();

	unsafe {
		KERNEL_FREE_LIST.lock().deallocate(range).unwrap();
	}
}

pub fn allocate(size: usize) -> Result<VirtAddr, AllocError> {
	assert!(size > 0);
	assert_eq!(
		size % BASE_PAGE_SIZE,
		0,
		"Size {size:#x} is not a multiple of {BASE_PAGE_SIZE:#x}"
	);

	let layout = PageLayout::from_size(size).unwrap();

	Ok(VirtAddr::new(
		KERNEL_FREE_LIST
			.lock()
			.allocate(layout)
			.map_err(|_| AllocError::OutOfMemory)?
			.start() as u64,
	))
}

pub fn deallocate(virtual_address: VirtAddr, size: usize) {
	assert!(size > 0);
	assert_eq!(
		size % BASE_PAGE_SIZE,
		0,
		"Size {size:#x} is not a multiple of {BASE_PAGE_SIZE:#x}"
	);

	let start = virtual_address.as_usize();
	let range = PageRange::new(start, start + size).unwrap();

	unsafe {
		KERNEL_FREE_LIST.lock().deallocate(range).unwrap();
	}
}
