use core::{mem, slice, str};

use hermit_sync::OnceCell;
use memory_addresses::PhysAddr;

use crate::arch::x86_64::mm::paging::phys_to_virt;
use crate::env;

/// Root System Description Pointer, revision 2.
#[repr(C, packed)]
struct Rsdp {
	signature: [u8; 8],
	checksum: u8,
	oem_id: [u8; 6],
	revision: u8,
	rsdt_address: u32,
	length: u32,
	xsdt_address: u64,
	extended_checksum: u8,
	reserved: [u8; 3],
}

/// Header shared by every System Description Table.
#[repr(C, packed)]
pub struct SdtHeader {
	signature: [u8; 4],
	length: u32,
	revision: u8,
	checksum: u8,
	oem_id: [u8; 6],
	oem_table_id: [u8; 8],
	oem_revision: u32,
	creator_id: u32,
	creator_revision: u32,
}

/// A validated ACPI table, addressed through the linear mapping.
#[derive(Clone, Copy)]
pub struct AcpiTable {
	header: &'static SdtHeader,
}

impl AcpiTable {
	/// First byte after the common header.
	pub fn table_start_address(&self) -> usize {
		core::ptr::from_ref(self.header) as usize + mem::size_of::<SdtHeader>()
	}

	/// One past the last byte of the table.
	pub fn table_end_address(&self) -> usize {
		core::ptr::from_ref(self.header) as usize + self.header.length() as usize
	}
}

impl SdtHeader {
	fn signature(&self) -> &str {
		str::from_utf8(&self.signature).unwrap_or("????")
	}

	fn length(&self) -> u32 {
		// Copy out of the packed struct before use.
		let length = self.length;
		length
	}
}

fn checksum_valid(start: *const u8, length: usize) -> bool {
	let bytes = unsafe { slice::from_raw_parts(start, length) };
	bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte)) == 0
}

static MADT: OnceCell<AcpiTable> = OnceCell::new();

fn table_at(physical_address: PhysAddr) -> Option<AcpiTable> {
	let header = unsafe { &*phys_to_virt(physical_address).as_ptr::<SdtHeader>() };
	if !checksum_valid(core::ptr::from_ref(header).cast(), header.length() as usize) {
		warn!(
			"ACPI table \"{}\" at {physical_address:p} has an invalid checksum",
			header.signature()
		);
		return None;
	}

	Some(AcpiTable { header })
}

/// Locate the MADT through the RSDP the bootloader handed over.
pub fn init() {
	let Some(rsdp_address) = env::acpi_rsdp() else {
		warn!("Bootloader passed no ACPI RSDP");
		return;
	};

	let rsdp = unsafe { &*phys_to_virt(rsdp_address).as_ptr::<Rsdp>() };
	if &rsdp.signature != b"RSD PTR " {
		warn!("Invalid RSDP signature at {rsdp_address:p}");
		return;
	}
	if !checksum_valid(core::ptr::from_ref(rsdp).cast(), 20) {
		warn!("RSDP checksum mismatch at {rsdp_address:p}");
		return;
	}

	// Revision 2 upgrades to the XSDT with 64-bit entries.
	let (sdt_address, entry_size) = if rsdp.revision >= 2 {
		let xsdt_address = rsdp.xsdt_address;
		(PhysAddr::new(xsdt_address), mem::size_of::<u64>())
	} else {
		(PhysAddr::new(rsdp.rsdt_address.into()), mem::size_of::<u32>())
	};

	let Some(sdt) = table_at(sdt_address) else {
		return;
	};

	let mut current = sdt.table_start_address();
	while current < sdt.table_end_address() {
		let entry = if entry_size == mem::size_of::<u64>() {
			unsafe { (current as *const u64).read_unaligned() }
		} else {
			u64::from(unsafe { (current as *const u32).read_unaligned() })
		};
		current += entry_size;

		let Some(table) = table_at(PhysAddr::new(entry)) else {
			continue;
		};
		debug!("Found ACPI table \"{}\"", table.header.signature());

		if &table.header.signature == b"APIC" {
			MADT.set(table).ok();
		}
	}
}

/// The Multiple APIC Description Table, if the firmware provides one.
pub fn get_madt() -> Option<&'static AcpiTable> {
	MADT.get()
}
