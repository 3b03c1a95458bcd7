pub mod paging;
pub mod physicalmem;
pub mod usermem;
pub mod virtualmem;

use hermit_sync::{InterruptSpinMutex, OnceCell};
use memory_addresses::{PhysAddr, VirtAddr};

use self::paging::{BASE_PAGE_SIZE, Mapper, PageTableEntryFlags};
use crate::env;
use crate::mm::AllocError;

/// The kernel's view of the address space, rooted at the PML4 the bootloader
/// handed over. Everything mapped here before the first user process is
/// created is visible to every process through the shared upper half.
static KERNEL_SPACE: OnceCell<InterruptSpinMutex<Mapper>> = OnceCell::new();

/// Fixed 4 KiB window remapped on demand for frames beyond the linear mapping.
static TEMP_WINDOW: OnceCell<VirtAddr> = OnceCell::new();

pub fn kernel_space() -> &'static InterruptSpinMutex<Mapper> {
	KERNEL_SPACE
		.get()
		.expect("kernel address space is not initialized")
}

pub fn init() {
	let root = PhysAddr::new(env::boot_args().page_table_ptr);
	KERNEL_SPACE
		.set(InterruptSpinMutex::new(unsafe { Mapper::from_root(root) }))
		.unwrap_or_else(|_| panic!("kernel address space initialized twice"));

	virtualmem::init();

	let window = virtualmem::allocate(BASE_PAGE_SIZE).unwrap();
	TEMP_WINDOW.set(window).unwrap();
}

/// Make the frame containing `physical_address` accessible and return the
/// matching virtual address.
///
/// Frames below the bootloader's linear mapping are served from it; anything
/// above goes through the temporary window, which stays valid until the next
/// call.
pub fn temp_map(physical_address: PhysAddr) -> VirtAddr {
	if physical_address.as_usize() < env::direct_mapped_size() {
		return paging::phys_to_virt(physical_address);
	}

	let window = *TEMP_WINDOW.get().expect("temporary window is not initialized");
	let frame = physical_address.align_down(BASE_PAGE_SIZE as u64);

	kernel_space()
		.lock()
		.map_range(
			frame,
			window,
			PageTableEntryFlags::PRESENT
				| PageTableEntryFlags::WRITABLE
				| PageTableEntryFlags::EXECUTE_DISABLE,
			BASE_PAGE_SIZE,
		)
		.expect("remapping the temporary window cannot allocate");

	window + (physical_address.as_u64() & (BASE_PAGE_SIZE as u64 - 1))
}

/// Point CR3 back at the kernel's own PML4.
///
/// # Safety
///
/// Must only be called from the kernel-main context; any lower-half
/// translations die with the switch.
pub unsafe fn switch_to_kernel_root() {
	#[cfg(target_os = "none")]
	{
		use x86_64::registers::control::{Cr3, Cr3Flags};
		use x86_64::structures::paging::PhysFrame;

		let root = kernel_space().lock().root();
		let frame =
			PhysFrame::from_start_address(x86_64::PhysAddr::new(root.as_u64())).unwrap();
		unsafe {
			Cr3::write(frame, Cr3Flags::empty());
		}
	}
}

/// Map `size` bytes of MMIO registers at `physical_address` into a fresh
/// kernel window with caching disabled.
pub fn map_device(physical_address: PhysAddr, size: usize) -> Result<VirtAddr, AllocError> {
	let offset = physical_address.as_u64() & (BASE_PAGE_SIZE as u64 - 1);
	let aligned_size = (offset as usize + size).next_multiple_of(BASE_PAGE_SIZE);
	let window = virtualmem::allocate(aligned_size)?;

	let mut flags = PageTableEntryFlags::PRESENT;
	flags.device().writable().execute_disable();

	kernel_space().lock().map_range(
		physical_address.align_down(BASE_PAGE_SIZE as u64),
		window,
		flags,
		aligned_size,
	)?;

	Ok(window + offset)
}
