//! Kernel heap allocator, a [`talc`] arena claimed from pages reserved out
//! of the physical frame bitmap.

use core::alloc::{GlobalAlloc, Layout};

use hermit_sync::RawInterruptTicketMutex;
use talc::{ErrOnOom, Span, Talc, Talck};

pub struct LockedAllocator(Talck<RawInterruptTicketMutex, ErrOnOom>);

impl LockedAllocator {
	pub const fn new() -> Self {
		Self(Talc::new(ErrOnOom).lock())
	}

	/// # Safety
	///
	/// The memory in `[heap_bottom, heap_bottom + heap_size)` must be mapped,
	/// writable, and unused by anything else.
	pub unsafe fn init(&self, heap_bottom: *mut u8, heap_size: usize) {
		let arena = Span::from_base_size(heap_bottom, heap_size);
		unsafe {
			self.0
				.lock()
				.claim(arena)
				.expect("failed to claim the kernel heap arena");
		}
	}
}

unsafe impl GlobalAlloc for LockedAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		unsafe { self.0.alloc(layout) }
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		unsafe { self.0.dealloc(ptr, layout) }
	}

	unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
		unsafe { self.0.realloc(ptr, layout, new_size) }
	}
}
