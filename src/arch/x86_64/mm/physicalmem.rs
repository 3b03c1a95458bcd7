use core::slice;

use align_address::Align;
use hermit_sync::InterruptSpinMutex;
use memory_addresses::PhysAddr;

use crate::arch::x86_64::mm::paging::{self, BASE_PAGE_SIZE};
use crate::env::{self, MemoryKind};
use crate::mm::AllocError;

/// One bit per physical 4 KiB frame; a set bit marks the frame as reserved.
///
/// Bit 7 (the most significant bit) of byte `i` covers frame `8 * i`, so the
/// byte scan below hands out low addresses first.
pub struct FrameBitmap {
	bits: *mut u8,
	bitmap_bytes: usize,
	num_pages: usize,
	num_pages_free: usize,
}

// The bitmap is only ever touched under the FRAME_BITMAP lock.
unsafe impl Send for FrameBitmap {}

impl FrameBitmap {
	pub const fn empty() -> Self {
		Self {
			bits: core::ptr::null_mut(),
			bitmap_bytes: 0,
			num_pages: 0,
			num_pages_free: 0,
		}
	}

	/// Take ownership of `bitmap_bytes(num_pages)` bytes at `bits` and mark
	/// every frame as reserved, including the padding bits past `num_pages`.
	///
	/// # Safety
	///
	/// `bits` must be valid for writes of that many bytes for the lifetime
	/// of the bitmap.
	pub unsafe fn from_raw_parts(bits: *mut u8, num_pages: usize) -> Self {
		let bitmap_bytes = Self::bitmap_bytes(num_pages);
		unsafe {
			slice::from_raw_parts_mut(bits, bitmap_bytes).fill(0xff);
		}

		Self {
			bits,
			bitmap_bytes,
			num_pages,
			num_pages_free: 0,
		}
	}

	pub const fn bitmap_bytes(num_pages: usize) -> usize {
		num_pages.div_ceil(8)
	}

	#[inline]
	fn bytes(&mut self) -> &mut [u8] {
		if self.bitmap_bytes == 0 {
			return &mut [];
		}
		unsafe { slice::from_raw_parts_mut(self.bits, self.bitmap_bytes) }
	}

	#[inline]
	pub fn num_pages(&self) -> usize {
		self.num_pages
	}

	#[inline]
	pub fn num_pages_free(&self) -> usize {
		self.num_pages_free
	}

	/// Number of zero bits below `num_pages`. Slow; diagnostics and tests.
	pub fn count_free(&mut self) -> usize {
		let num_pages = self.num_pages;
		self.bytes()
			.iter()
			.enumerate()
			.map(|(i, byte)| {
				(0..8)
					.filter(|bit| i * 8 + bit < num_pages && byte & (0x80 >> bit) == 0)
					.count()
			})
			.sum()
	}

	/// Reserve the free frame with the lowest address.
	///
	/// Scans byte by byte and picks the most-significant zero bit of the
	/// first byte that still has one.
	pub fn reserve_page(&mut self) -> Result<PhysAddr, AllocError> {
		let num_pages = self.num_pages;
		let position = self
			.bytes()
			.iter()
			.position(|byte| *byte != 0xff)
			.ok_or(AllocError::OutOfMemory)?;

		let byte = &mut self.bytes()[position];
		let bit = (!*byte).leading_zeros() as usize;
		let index = position * 8 + bit;
		if index >= num_pages {
			return Err(AllocError::OutOfMemory);
		}

		*byte |= 0x80 >> bit;
		self.num_pages_free -= 1;

		Ok(PhysAddr::new((index * BASE_PAGE_SIZE) as u64))
	}

	/// Release a frame. Out-of-range addresses are a silent no-op.
	pub fn free_page(&mut self, physical_address: PhysAddr) {
		let index = physical_address.as_usize() / BASE_PAGE_SIZE;
		if index >= self.num_pages {
			return;
		}

		let mask = 0x80 >> (index % 8);
		let byte = &mut self.bytes()[index / 8];
		if *byte & mask != 0 {
			*byte &= !mask;
			self.num_pages_free += 1;
		}
	}

	/// Mark a frame range as free during seeding.
	pub fn mark_free(&mut self, first_page: usize, count: usize) {
		for index in first_page..(first_page + count).min(self.num_pages) {
			let mask = 0x80 >> (index % 8);
			let byte = &mut self.bytes()[index / 8];
			if *byte & mask != 0 {
				*byte &= !mask;
				self.num_pages_free += 1;
			}
		}
	}

	/// Mark a frame range as reserved during seeding.
	pub fn mark_reserved(&mut self, first_page: usize, count: usize) {
		for index in first_page..(first_page + count).min(self.num_pages) {
			let mask = 0x80 >> (index % 8);
			let byte = &mut self.bytes()[index / 8];
			if *byte & mask == 0 {
				*byte |= mask;
				self.num_pages_free -= 1;
			}
		}
	}
}

static FRAME_BITMAP: InterruptSpinMutex<FrameBitmap> =
	InterruptSpinMutex::new(FrameBitmap::empty());

/// Seed the bitmap from the bootloader memory map.
///
/// The bitmap itself is placed at the start of the first usable region large
/// enough to hold it; the frames containing it stay reserved, as do frame 0
/// and everything the memory map does not declare usable.
pub fn init() {
	let memory_map = env::memory_map();

	let highest_usable_end = memory_map
		.iter()
		.filter(|region| region.kind() == Some(MemoryKind::Usable))
		.map(|region| region.base + region.length)
		.max()
		.expect("no usable RAM in the bootloader memory map");
	let num_pages = (highest_usable_end as usize) / BASE_PAGE_SIZE;

	let bitmap_size = FrameBitmap::bitmap_bytes(num_pages).align_up(BASE_PAGE_SIZE);
	let bitmap_base = memory_map
		.iter()
		.filter(|region| region.kind() == Some(MemoryKind::Usable))
		.map(|region| {
			let base = (region.base as usize).align_up(BASE_PAGE_SIZE);
			(base, region.base as usize + region.length as usize)
		})
		.find(|(base, end)| {
			base + bitmap_size <= *end && base + bitmap_size <= env::direct_mapped_size()
		})
		.map(|(base, _end)| base)
		.expect("no usable region can hold the frame bitmap");

	let bits = paging::phys_to_virt(PhysAddr::new(bitmap_base as u64)).as_mut_ptr::<u8>();
	let mut bitmap = unsafe { FrameBitmap::from_raw_parts(bits, num_pages) };

	for region in memory_map {
		if region.kind() == Some(MemoryKind::Usable) {
			let first_page = (region.base as usize).div_ceil(BASE_PAGE_SIZE);
			let last_page = (region.base + region.length) as usize / BASE_PAGE_SIZE;
			bitmap.mark_free(first_page, last_page.saturating_sub(first_page));
		}
	}

	// The null frame stays reserved to keep PhysAddr(0) unambiguous.
	bitmap.mark_reserved(0, 1);
	bitmap.mark_reserved(bitmap_base / BASE_PAGE_SIZE, bitmap_size / BASE_PAGE_SIZE);

	info!(
		"Physical frame bitmap at {bitmap_base:#x} covers {} pages ({} free)",
		bitmap.num_pages(),
		bitmap.num_pages_free()
	);

	*FRAME_BITMAP.lock() = bitmap;
}

pub fn reserve_page() -> Result<PhysAddr, AllocError> {
	FRAME_BITMAP.lock().reserve_page()
}

pub fn free_page(physical_address: PhysAddr) {
	FRAME_BITMAP.lock().free_page(physical_address);
}

pub fn total_pages() -> usize {
	FRAME_BITMAP.lock().num_pages()
}

pub fn free_pages() -> usize {
	FRAME_BITMAP.lock().num_pages_free()
}

pub fn print_information() {
	let mut bitmap = FRAME_BITMAP.lock();
	info!(
		"Physical memory: {} of {} pages free",
		bitmap.num_pages_free(),
		bitmap.num_pages()
	);
	debug_assert_eq!(bitmap.count_free(), bitmap.num_pages_free());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec;

	use super::*;

	fn bitmap_with_free_pages(num_pages: usize) -> (FrameBitmap, alloc::vec::Vec<u8>) {
		let mut storage = vec![0u8; FrameBitmap::bitmap_bytes(num_pages)];
		let mut bitmap = unsafe { FrameBitmap::from_raw_parts(storage.as_mut_ptr(), num_pages) };
		bitmap.mark_free(0, num_pages);
		(bitmap, storage)
	}

	#[test]
	fn reserve_free_reserve_cycle() {
		let (mut bitmap, _storage) = bitmap_with_free_pages(1024);
		assert_eq!(bitmap.num_pages_free(), 1024);

		let first = bitmap.reserve_page().unwrap();
		let second = bitmap.reserve_page().unwrap();
		let third = bitmap.reserve_page().unwrap();
		assert!(first < second && second < third, "addresses must ascend");

		bitmap.free_page(second);
		assert_eq!(
			bitmap.reserve_page().unwrap(),
			second,
			"the freed frame is handed out again first"
		);
		assert_eq!(bitmap.num_pages_free(), 1022);
	}

	#[test]
	fn free_count_matches_zero_bits() {
		let (mut bitmap, _storage) = bitmap_with_free_pages(100);
		for _ in 0..37 {
			bitmap.reserve_page().unwrap();
		}
		bitmap.free_page(PhysAddr::new(0x3000));

		assert_eq!(bitmap.count_free(), bitmap.num_pages_free());
	}

	#[test]
	fn reserve_then_free_is_balanced() {
		let (mut bitmap, _storage) = bitmap_with_free_pages(64);
		let before = bitmap.num_pages_free();

		let frame = bitmap.reserve_page().unwrap();
		bitmap.free_page(frame);

		assert_eq!(bitmap.num_pages_free(), before);
	}

	#[test]
	fn out_of_range_free_is_ignored() {
		let (mut bitmap, _storage) = bitmap_with_free_pages(16);
		let before = bitmap.num_pages_free();

		bitmap.free_page(PhysAddr::new(0x100_0000));

		assert_eq!(bitmap.num_pages_free(), before);
	}

	#[test]
	fn padding_bits_stay_reserved() {
		// 10 pages leave 6 padding bits in the second byte.
		let (mut bitmap, _storage) = bitmap_with_free_pages(10);

		for _ in 0..10 {
			bitmap.reserve_page().unwrap();
		}
		assert_eq!(bitmap.reserve_page(), Err(AllocError::OutOfMemory));
	}

	#[test]
	fn exhaustion_reports_out_of_memory() {
		let (mut bitmap, _storage) = bitmap_with_free_pages(8);
		for _ in 0..8 {
			bitmap.reserve_page().unwrap();
		}
		assert_eq!(bitmap.reserve_page(), Err(AllocError::OutOfMemory));
	}
}
