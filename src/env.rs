//! Bootloader handoff.
//!
//! The bootloader parks a [`KernelArgs`] structure in memory and passes its
//! address in `rdi`. The layout is a C ABI shared with the bootloader and
//! the early entry assembly; the `const` assertions below pin the byte
//! offsets both sides depend on.

use core::sync::atomic::{AtomicPtr, Ordering};
use core::{mem, ptr, slice, str};

use memory_addresses::PhysAddr;
use num_enum::TryFromPrimitive;

/// A `{ptr, len}` pair handed over by the bootloader.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
	pub ptr: *const u8,
	pub len: usize,
}

impl Buffer {
	pub fn as_slice(&self) -> &'static [u8] {
		if self.ptr.is_null() || self.len == 0 {
			&[]
		} else {
			unsafe { slice::from_raw_parts(self.ptr, self.len) }
		}
	}
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapHandoff {
	pub ptr: *const MemoryRegion,
	pub len: usize,
	/// Number of bytes of physical memory the bootloader mapped linearly at
	/// the direct-map base.
	pub mapped_size: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArchHandoff {
	pub efi_ptr: u64,
	pub acpi_ptr: u64,
	pub mp_ptr: u64,
	pub smbi_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FramebufferHandoff {
	pub ptr: *const Framebuffer,
	pub len: usize,
}

/// Boot arguments. Offset 16 (`page_table_ptr`) is read by the entry
/// assembly before any Rust code runs.
#[repr(C)]
pub struct KernelArgs {
	pub kernel_elf: Buffer,
	/// Physical address of the PML4 the bootloader built.
	pub page_table_ptr: u64,
	pub environment: Buffer,
	pub memory_map: MemoryMapHandoff,
	pub initrd: Buffer,
	pub arch: ArchHandoff,
	pub framebuffers: FramebufferHandoff,
}

const _: () = {
	assert!(mem::offset_of!(KernelArgs, kernel_elf) == 0);
	assert!(mem::offset_of!(KernelArgs, page_table_ptr) == 16);
	assert!(mem::offset_of!(KernelArgs, environment) == 24);
	assert!(mem::offset_of!(KernelArgs, memory_map) == 40);
	assert!(mem::offset_of!(KernelArgs, initrd) == 64);
	assert!(mem::offset_of!(KernelArgs, arch) == 80);
	assert!(mem::offset_of!(KernelArgs, framebuffers) == 112);
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum MemoryKind {
	Usable = 0,
	Reserved = 1,
	AcpiReclaimable = 2,
	AcpiNvs = 3,
	BadMemory = 4,
	BootloaderReclaimable = 5,
	KernelAndModules = 6,
	Framebuffer = 7,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
	pub base: u64,
	pub length: u64,
	kind: u32,
	_reserved: u32,
}

impl MemoryRegion {
	/// Returns `None` for entry kinds newer than this kernel.
	pub fn kind(&self) -> Option<MemoryKind> {
		MemoryKind::try_from(self.kind).ok()
	}

	#[cfg(all(test, not(target_os = "none")))]
	pub fn with_kind(base: u64, length: u64, kind: MemoryKind) -> Self {
		Self {
			base,
			length,
			kind: kind as u32,
			_reserved: 0,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum FramebufferPtrType {
	Physical = 0,
	Linear = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ColorFormat {
	Rgbr8 = 0,
	Bgrr8 = 1,
	Bitmask = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Framebuffer {
	pub ptr: u64,
	ptr_type: u32,
	_reserved: u32,
	pub size: u64,
	pub width: u32,
	pub height: u32,
	pub scanline: u32,
	color_format: u32,
	pub color_bitmask: [u32; 3],
}

impl Framebuffer {
	pub fn ptr_type(&self) -> Option<FramebufferPtrType> {
		FramebufferPtrType::try_from(self.ptr_type).ok()
	}

	pub fn color_format(&self) -> Option<ColorFormat> {
		ColorFormat::try_from(self.color_format).ok()
	}
}

static BOOT_ARGS: AtomicPtr<KernelArgs> = AtomicPtr::new(ptr::null_mut());

/// # Safety
///
/// `args` must point to a [`KernelArgs`] structure that stays valid and
/// unmodified for the whole kernel lifetime.
pub unsafe fn set_boot_args(args: *const KernelArgs) {
	BOOT_ARGS.store(args.cast_mut(), Ordering::Relaxed);
}

pub fn boot_args() -> &'static KernelArgs {
	unsafe {
		BOOT_ARGS
			.load(Ordering::Relaxed)
			.cast_const()
			.as_ref()
			.expect("boot arguments are not set")
	}
}

pub fn memory_map() -> &'static [MemoryRegion] {
	let handoff = &boot_args().memory_map;
	unsafe { slice::from_raw_parts(handoff.ptr, handoff.len) }
}

#[inline]
pub fn direct_mapped_size() -> usize {
	boot_args().memory_map.mapped_size
}

pub fn kernel_elf() -> &'static [u8] {
	boot_args().kernel_elf.as_slice()
}

pub fn initrd() -> &'static [u8] {
	boot_args().initrd.as_slice()
}

pub fn acpi_rsdp() -> Option<PhysAddr> {
	let ptr = boot_args().arch.acpi_ptr;
	(ptr != 0).then(|| PhysAddr::new(ptr))
}

/// Iterate the NUL-separated `KEY=VALUE` pairs of the environment buffer.
pub fn vars() -> impl Iterator<Item = (&'static str, &'static str)> {
	boot_args()
		.environment
		.as_slice()
		.split(|byte| *byte == 0)
		.filter(|entry| !entry.is_empty())
		.filter_map(|entry| str::from_utf8(entry).ok())
		.filter_map(|entry| entry.split_once('='))
}

pub fn var(key: &str) -> Option<&'static str> {
	vars().find(|(name, _)| *name == key).map(|(_, value)| value)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn memory_kind_decoding() {
		let region = MemoryRegion::with_kind(0x1000, 0x2000, MemoryKind::Usable);
		assert_eq!(region.kind(), Some(MemoryKind::Usable));

		let unknown = MemoryRegion {
			base: 0,
			length: 0,
			kind: 99,
			_reserved: 0,
		};
		assert_eq!(unknown.kind(), None, "future entry kinds are skipped");
	}
}
