use alloc::vec::Vec;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use bit_field::BitField;
use hermit_sync::InterruptSpinMutex;
use memory_addresses::{PhysAddr, VirtAddr};
use num_enum::TryFromPrimitive;
use thiserror::Error;
use x86_64::registers::model_specific::Msr;

use super::core_local::CoreLocal;
use super::{acpi, idt, interrupts, pic};
use crate::arch::x86_64::mm;

const IA32_APIC_BASE: u32 = 0x1b;
const APIC_BASE_ENABLED: u64 = 1 << 11;

/// xAPIC register offsets, relative to the MMIO base.
const APIC_REG_ID: u32 = 0x0020;
const APIC_REG_TPR: u32 = 0x0080;
const APIC_REG_EOI: u32 = 0x00b0;
const APIC_REG_SIVR: u32 = 0x00f0;
const APIC_REG_LVT_TIMER: u32 = 0x0320;
const APIC_REG_LVT_LINT0: u32 = 0x0350;
const APIC_REG_LVT_LINT1: u32 = 0x0360;
const APIC_REG_LVT_ERROR: u32 = 0x0370;
const APIC_REG_INIT_COUNT: u32 = 0x0380;
const APIC_REG_CURRENT_COUNT: u32 = 0x0390;
const APIC_REG_DIV_CONF: u32 = 0x03e0;

const APIC_LVT_MASK: u32 = 1 << 16;
const APIC_EOI_ACK: u32 = 0;
/// Enable bit plus spurious vector 0xff, as one write.
const APIC_SIVR_ENABLED: u32 = 0x1ff;
const APIC_DIV_CONF_DIVIDE_BY_16: u32 = 0b0011;

/// Timer ticks advance at bus clock / 16.
pub const TIMER_DIVIDER: u64 = 16;

pub const SPURIOUS_INTERRUPT_VECTOR: u8 = 0xff;

/// IO-APIC indirection window: index register at +0x00, data at +0x10.
const IOAPIC_REG_SELECT: usize = 0x00;
const IOAPIC_REG_WINDOW: usize = 0x10;

/// Register index: version
const IOAPIC_REG_VER: u32 = 0x0001;
/// Redirection table base
const IOAPIC_REG_TABLE: u32 = 0x0010;

const IOAPIC_MASKED: u32 = 1 << 16;

/// First vector deliverable through the APIC.
pub const FIRST_APIC_VECTOR: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VectorError {
	#[error("no free APIC interrupt vector")]
	OutOfVectors,
}

/// Reservation bitmap over the APIC vector range 128..=255.
pub struct VectorMap {
	bits: u128,
}

impl VectorMap {
	pub const fn new() -> Self {
		Self { bits: 0 }
	}

	/// Reserve the first free vector, scanning upwards from 128.
	pub fn find_and_reserve_entry(&mut self) -> Result<u8, VectorError> {
		let index = (!self.bits).trailing_zeros();
		if index >= 128 {
			return Err(VectorError::OutOfVectors);
		}

		self.bits |= 1 << index;
		Ok(FIRST_APIC_VECTOR + index as u8)
	}

	/// Reserve a specific vector. Returns whether it was still free.
	pub fn reserve(&mut self, vector: u8) -> bool {
		let index = vector - FIRST_APIC_VECTOR;
		let was_free = self.bits & (1 << index) == 0;
		self.bits |= 1 << index;
		was_free
	}

	pub fn release(&mut self, vector: u8) {
		self.bits &= !(1 << (vector - FIRST_APIC_VECTOR));
	}
}

static VECTOR_MAP: InterruptSpinMutex<VectorMap> = InterruptSpinMutex::new(VectorMap::new());

pub fn find_and_reserve_entry() -> Result<u8, VectorError> {
	VECTOR_MAP.lock().find_and_reserve_entry()
}

pub fn release_entry(vector: u8) {
	VECTOR_MAP.lock().release(vector);
}

/// MADT sub-entry types this kernel understands. Everything else is skipped
/// by its announced length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum MadtRecordType {
	LocalApic = 0,
	IoApic = 1,
	InterruptSourceOverride = 2,
}

#[repr(C, packed)]
struct AcpiMadtHeader {
	local_apic_address: u32,
	flags: u32,
}

#[repr(C, packed)]
struct AcpiMadtRecordHeader {
	entry_type: u8,
	length: u8,
}

#[repr(C, packed)]
struct ProcessorLocalApicRecord {
	acpi_processor_id: u8,
	apic_id: u8,
	flags: u32,
}

impl fmt::Display for ProcessorLocalApicRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{ acpi_processor_id: {}, ", { self.acpi_processor_id })?;
		write!(f, "apic_id: {}, ", { self.apic_id })?;
		write!(f, "flags: {} }}", { self.flags })?;
		Ok(())
	}
}

const CPU_FLAG_ENABLED: u32 = 1 << 0;

#[repr(C, packed)]
struct IoApicRecord {
	id: u8,
	reserved: u8,
	address: u32,
	global_system_interrupt_base: u32,
}

impl fmt::Display for IoApicRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{ id: {}, ", { self.id })?;
		write!(f, "address: {:#x}, ", { self.address })?;
		write!(f, "global_system_interrupt_base: {} }}", {
			self.global_system_interrupt_base
		})?;
		Ok(())
	}
}

#[repr(C, packed)]
struct InterruptSourceOverrideRecord {
	bus: u8,
	irq: u8,
	global_system_interrupt: u32,
	flags: u16,
}

impl fmt::Display for InterruptSourceOverrideRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{ bus: {}, irq: {}, ", { self.bus }, { self.irq })?;
		write!(f, "global_system_interrupt: {}, ", { self.global_system_interrupt })?;
		write!(f, "flags: {:#x} }}", { self.flags })?;
		Ok(())
	}
}

/// One discovered IO-APIC.
struct IoApic {
	mmio: VirtAddr,
	gsi_base: u32,
	entries: u32,
}

/// A legacy-IRQ redirection from the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOverride {
	pub bus: u8,
	pub irq: u8,
	pub gsi: u32,
	/// Redirection-entry polarity bit (active low when set), `flags & 2`.
	pub polarity: bool,
	/// Redirection-entry trigger-mode bit (level when set), `flags & 8`.
	pub trigger: bool,
}

impl SourceOverride {
	fn from_record(bus: u8, irq: u8, gsi: u32, flags: u16) -> Self {
		Self {
			bus,
			irq,
			gsi,
			polarity: flags & 2 != 0,
			trigger: flags & 8 != 0,
		}
	}
}

/// Which controller acknowledges I/O interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterruptSystem {
	None,
	IoApic,
}

static ACTIVE_IO_INTERRUPT_SYSTEM: InterruptSpinMutex<IoInterruptSystem> =
	InterruptSpinMutex::new(IoInterruptSystem::None);

static LOCAL_APIC_IDS: InterruptSpinMutex<Vec<u8>> = InterruptSpinMutex::new(Vec::new());
static IO_APICS: InterruptSpinMutex<Vec<IoApic>> = InterruptSpinMutex::new(Vec::new());
static SOURCE_OVERRIDES: InterruptSpinMutex<Vec<SourceOverride>> =
	InterruptSpinMutex::new(Vec::new());

/// Physical APIC ID of the bootstrap processor, the destination of every
/// redirection entry.
static BSP_APIC_ID: AtomicU32 = AtomicU32::new(0);

#[inline]
fn local_apic_base() -> u64 {
	CoreLocal::get().apic.mmio_base.get()
}

fn local_apic_read(register: u32) -> u32 {
	unsafe { ((local_apic_base() + u64::from(register)) as *const u32).read_volatile() }
}

fn local_apic_write(register: u32, value: u32) {
	unsafe {
		((local_apic_base() + u64::from(register)) as *mut u32).write_volatile(value);
	}
}

fn ioapic_read(ioapic: &IoApic, register: u32) -> u32 {
	unsafe {
		(ioapic.mmio.as_mut_ptr::<u32>().byte_add(IOAPIC_REG_SELECT)).write_volatile(register);
		(ioapic.mmio.as_ptr::<u32>().byte_add(IOAPIC_REG_WINDOW)).read_volatile()
	}
}

fn ioapic_write(ioapic: &IoApic, register: u32, value: u32) {
	unsafe {
		(ioapic.mmio.as_mut_ptr::<u32>().byte_add(IOAPIC_REG_SELECT)).write_volatile(register);
		(ioapic.mmio.as_mut_ptr::<u32>().byte_add(IOAPIC_REG_WINDOW)).write_volatile(value);
	}
}

/// Walk the MADT record area, handing every known record to `visit`.
/// Records are length-delimited; unknown types are skipped.
fn walk_madt(records: &[u8], mut visit: impl FnMut(MadtRecordType, &[u8])) {
	let mut current = 0;

	while current + mem::size_of::<AcpiMadtRecordHeader>() <= records.len() {
		let entry_type = records[current];
		let length = records[current + 1] as usize;
		if length < mem::size_of::<AcpiMadtRecordHeader>() || current + length > records.len() {
			warn!("Malformed MADT record at offset {current}");
			break;
		}

		if let Ok(record_type) = MadtRecordType::try_from(entry_type) {
			visit(
				record_type,
				&records[current + mem::size_of::<AcpiMadtRecordHeader>()..current + length],
			);
		}

		current += length;
	}
}

/// Parse the MADT, map every IO-APIC, and bring up the local APIC of the
/// bootstrap processor.
pub fn init_from_madt() {
	let madt = acpi::get_madt().expect("the MADT is required to route interrupts");

	let madt_header = unsafe { &*(madt.table_start_address() as *const AcpiMadtHeader) };
	let local_apic_address = PhysAddr::new(u64::from({ madt_header.local_apic_address }));

	let records = unsafe {
		core::slice::from_raw_parts(
			(madt.table_start_address() + mem::size_of::<AcpiMadtHeader>()) as *const u8,
			madt.table_end_address() - madt.table_start_address() - mem::size_of::<AcpiMadtHeader>(),
		)
	};

	walk_madt(records, |record_type, body| match record_type {
		MadtRecordType::LocalApic => {
			let record = unsafe { &*body.as_ptr().cast::<ProcessorLocalApicRecord>() };
			debug!("Found Processor Local APIC record: {record}");

			if { record.flags } & CPU_FLAG_ENABLED > 0 {
				LOCAL_APIC_IDS.lock().push(record.apic_id);
			}
		}
		MadtRecordType::IoApic => {
			let record = unsafe { &*body.as_ptr().cast::<IoApicRecord>() };
			debug!("Found I/O APIC record: {record}");

			let mmio = mm::map_device(PhysAddr::new(u64::from({ record.address })), 0x20)
				.expect("cannot map the IO-APIC registers");
			let mut ioapic = IoApic {
				mmio,
				gsi_base: { record.global_system_interrupt_base },
				entries: 0,
			};
			ioapic.entries = (ioapic_read(&ioapic, IOAPIC_REG_VER) >> 16 & 0xff) + 1;
			info!(
				"IO-APIC at {mmio:p} handles GSI {}..{}",
				ioapic.gsi_base,
				ioapic.gsi_base + ioapic.entries
			);

			IO_APICS.lock().push(ioapic);
		}
		MadtRecordType::InterruptSourceOverride => {
			let record = unsafe { &*body.as_ptr().cast::<InterruptSourceOverrideRecord>() };
			debug!("Found Interrupt Source Override record: {record}");

			SOURCE_OVERRIDES.lock().push(SourceOverride::from_record(
				record.bus,
				record.irq,
				{ record.global_system_interrupt },
				{ record.flags },
			));
		}
	});

	init_local_apic(local_apic_address);

	if !IO_APICS.lock().is_empty() {
		*ACTIVE_IO_INTERRUPT_SYSTEM.lock() = IoInterruptSystem::IoApic;
	}
}

/// Enable the local APIC: silence the legacy PICs, set the global enable
/// bit, and program the spurious-interrupt vector register.
fn init_local_apic(local_apic_address: PhysAddr) {
	// The PICs keep raising IRQs otherwise; remap and fully mask them.
	pic::init();

	let mmio = mm::map_device(local_apic_address, 0x1000)
		.expect("cannot map the local APIC registers");
	CoreLocal::get().apic.mmio_base.set(mmio.as_u64());

	let mut apic_base_msr = Msr::new(IA32_APIC_BASE);
	unsafe {
		apic_base_msr.write(apic_base_msr.read() | APIC_BASE_ENABLED);
	}

	// Mask every local interrupt source until someone claims it.
	local_apic_write(APIC_REG_LVT_TIMER, APIC_LVT_MASK);
	local_apic_write(APIC_REG_LVT_LINT0, APIC_LVT_MASK);
	local_apic_write(APIC_REG_LVT_LINT1, APIC_LVT_MASK);
	local_apic_write(APIC_REG_LVT_ERROR, APIC_LVT_MASK);

	// Allow all priorities and enable via the spurious vector register.
	local_apic_write(APIC_REG_TPR, 0);
	local_apic_write(APIC_REG_SIVR, APIC_SIVR_ENABLED);

	VECTOR_MAP.lock().reserve(SPURIOUS_INTERRUPT_VECTOR);
	idt::set_gate(
		SPURIOUS_INTERRUPT_VECTOR,
		interrupts::spurious_interrupt_stub as usize,
		0,
	);

	let bsp_id = local_apic_read(APIC_REG_ID) >> 24;
	BSP_APIC_ID.store(bsp_id, Ordering::Relaxed);
	info!(
		"Local APIC at {local_apic_address:p} enabled (BSP APIC ID {bsp_id})"
	);
}

/// Resolve a legacy ISA IRQ against the MADT source overrides.
fn resolve_legacy_irq(
	overrides: &[SourceOverride],
	irq: u8,
) -> (u32, bool, bool) {
	overrides
		.iter()
		.find(|entry| entry.irq == irq)
		.map_or((u32::from(irq), false, false), |entry| {
			(entry.gsi, entry.polarity, entry.trigger)
		})
}

fn with_owning_ioapic<R>(gsi: u32, f: impl FnOnce(&IoApic, u32) -> R) -> Option<R> {
	let ioapics = IO_APICS.lock();
	let ioapic = ioapics
		.iter()
		.find(|ioapic| (ioapic.gsi_base..ioapic.gsi_base + ioapic.entries).contains(&gsi))?;
	Some(f(ioapic, gsi - ioapic.gsi_base))
}

/// Route a legacy ISA IRQ to the given APIC vector on the BSP.
pub fn register_legacy_irq(irq: u8, vector: u8) -> bool {
	let (gsi, polarity, trigger) = resolve_legacy_irq(&SOURCE_OVERRIDES.lock(), irq);

	with_owning_ioapic(gsi, |ioapic, index| {
		let mut low = u32::from(vector);
		low.set_bit(13, polarity);
		low.set_bit(15, trigger);
		let high = BSP_APIC_ID.load(Ordering::Relaxed) << 24;

		ioapic_write(ioapic, IOAPIC_REG_TABLE + 2 * index + 1, high);
		ioapic_write(ioapic, IOAPIC_REG_TABLE + 2 * index, low);

		debug!("Routed legacy IRQ {irq} (GSI {gsi}) to vector {vector}");
	})
	.is_some()
}

/// Mask the redirection entry of a legacy ISA IRQ again.
pub fn unregister_legacy_irq(irq: u8) -> bool {
	let (gsi, _polarity, _trigger) = resolve_legacy_irq(&SOURCE_OVERRIDES.lock(), irq);

	with_owning_ioapic(gsi, |ioapic, index| {
		let mut entry = ioapic_read(ioapic, IOAPIC_REG_TABLE + 2 * index);
		entry.set_bit(16, true);
		ioapic_write(ioapic, IOAPIC_REG_TABLE + 2 * index, entry);
	})
	.is_some()
}

/// Acknowledge the current interrupt at the local APIC.
pub fn eoi() {
	local_apic_write(APIC_REG_EOI, APIC_EOI_ACK);
}

/// Acknowledge through whatever I/O interrupt system is active.
pub fn signal_eoi() {
	match *ACTIVE_IO_INTERRUPT_SYSTEM.lock() {
		IoInterruptSystem::None => {
			error!("EOI requested, but no I/O interrupt system is active");
		}
		IoInterruptSystem::IoApic => eoi(),
	}
}

/// Program the divided timer as a free-running down counter for
/// calibration. The LVT stays masked; only the counter moves.
pub fn timer_start_calibration() {
	local_apic_write(APIC_REG_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_16);
	local_apic_write(APIC_REG_LVT_TIMER, APIC_LVT_MASK);
	local_apic_write(APIC_REG_INIT_COUNT, u32::MAX);
}

/// Counter ticks consumed since [`timer_start_calibration`].
pub fn timer_calibration_elapsed() -> u64 {
	u64::from(u32::MAX - local_apic_read(APIC_REG_CURRENT_COUNT))
}

/// Arm the timer for a single interrupt on `vector` after `ticks` counter
/// steps (one-shot mode).
pub fn timer_one_shot(ticks: u32, vector: u8) {
	local_apic_write(APIC_REG_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_16);
	local_apic_write(APIC_REG_LVT_TIMER, u32::from(vector));
	local_apic_write(APIC_REG_INIT_COUNT, ticks.max(1));
}

/// Mask the LVT timer and clear the counter.
pub fn timer_stop() {
	local_apic_write(APIC_REG_LVT_TIMER, APIC_LVT_MASK);
	local_apic_write(APIC_REG_INIT_COUNT, 0);
}

/// Remaining ticks of the running one-shot.
pub fn timer_remaining() -> u32 {
	local_apic_read(APIC_REG_CURRENT_COUNT)
}

pub fn local_apic_id_count() -> usize {
	LOCAL_APIC_IDS.lock().len()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::*;

	#[test]
	fn vector_map_reserves_in_order() {
		let mut map = VectorMap::new();
		assert_eq!(map.find_and_reserve_entry(), Ok(128));
		assert_eq!(map.find_and_reserve_entry(), Ok(129));

		map.release(128);
		assert_eq!(map.find_and_reserve_entry(), Ok(128));
		assert_eq!(map.find_and_reserve_entry(), Ok(130));
	}

	#[test]
	fn vector_map_exhaustion() {
		let mut map = VectorMap::new();
		for expected in 128..=255u16 {
			assert_eq!(map.find_and_reserve_entry(), Ok(expected as u8));
		}
		assert_eq!(map.find_and_reserve_entry(), Err(VectorError::OutOfVectors));
	}

	#[test]
	fn vector_map_specific_reservation() {
		let mut map = VectorMap::new();
		assert!(map.reserve(255));
		assert!(!map.reserve(255));

		for expected in 128..255u16 {
			assert_eq!(map.find_and_reserve_entry(), Ok(expected as u8));
		}
		assert_eq!(map.find_and_reserve_entry(), Err(VectorError::OutOfVectors));
	}

	#[test]
	fn madt_walk_skips_unknown_records() {
		#[rustfmt::skip]
		let records = [
			// Local APIC: processor 0, APIC ID 7, enabled
			0u8, 8, 0, 7, 1, 0, 0, 0,
			// Unknown type 9, length 6
			9, 6, 0xaa, 0xbb, 0xcc, 0xdd,
			// IO-APIC: ID 1 at 0xfec0_0000, GSI base 0
			1, 12, 1, 0, 0x00, 0x00, 0xc0, 0xfe, 0, 0, 0, 0,
			// Override: bus 0, IRQ 0 -> GSI 2, flags 0
			2, 10, 0, 0, 2, 0, 0, 0, 0, 0,
		];

		let mut seen = Vec::new();
		walk_madt(&records, |record_type, body| {
			seen.push((record_type, body.len()));
		});

		assert_eq!(
			seen,
			[
				(MadtRecordType::LocalApic, 6),
				(MadtRecordType::IoApic, 10),
				(MadtRecordType::InterruptSourceOverride, 8),
			]
		);
	}

	#[test]
	fn madt_walk_stops_on_truncated_record() {
		// Length byte claims more data than the table holds.
		let records = [0u8, 8, 0, 7];
		let mut count = 0;
		walk_madt(&records, |_, _| count += 1);
		assert_eq!(count, 0);
	}

	#[test]
	fn legacy_irq_override_resolution() {
		let overrides = [
			SourceOverride::from_record(0, 0, 2, 0),
			SourceOverride::from_record(0, 9, 9, 0xd),
		];

		// IRQ 0 is redirected to GSI 2 with default polarity/trigger.
		assert_eq!(resolve_legacy_irq(&overrides, 0), (2, false, false));
		// IRQ 9: flags 0xd has bit 3 (level trigger) set but not bit 1.
		assert_eq!(resolve_legacy_irq(&overrides, 9), (9, false, true));
		// IRQ 8 has no override and falls through unchanged.
		assert_eq!(resolve_legacy_irq(&overrides, 8), (8, false, false));
	}
}
