use core::arch::x86_64::{__cpuid, _mm_lfence, _rdtsc};
use core::fmt;

use hermit_sync::Lazy;
use raw_cpuid::{CpuId, CpuIdReaderNative};
use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags, Efer, EferFlags};
use x86_64::registers::model_specific::{FsBase, GsBase};

struct Features {
	physical_address_bits: u8,
	linear_address_bits: u8,
	x2apic: bool,
	invariant_tsc: bool,
	tsc_frequency_hz: Option<u64>,
}

static FEATURES: Lazy<Features> = Lazy::new(|| {
	let cpuid = CpuId::<CpuIdReaderNative>::new();

	let (physical_address_bits, linear_address_bits) = cpuid
		.get_processor_capacity_feature_info()
		.map(|info| (info.physical_address_bits(), info.linear_address_bits()))
		.unwrap_or((36, 48));

	let x2apic = cpuid
		.get_feature_info()
		.is_some_and(|info| info.has_x2apic());

	let invariant_tsc = cpuid
		.get_advanced_power_mgmt_info()
		.is_some_and(|info| info.has_invariant_tsc());

	// CPUID 0x15 announces the TSC frequency on newer parts. Purely
	// informational; the clock manager always calibrates.
	let tsc_frequency_hz = cpuid.get_tsc_info().and_then(|info| info.tsc_frequency());

	Features {
		physical_address_bits,
		linear_address_bits,
		x2apic,
		invariant_tsc,
		tsc_frequency_hz,
	}
});

impl fmt::Display for Features {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}/{} address bits",
			self.physical_address_bits, self.linear_address_bits
		)?;
		if self.x2apic {
			write!(f, ", x2APIC")?;
		}
		if self.invariant_tsc {
			write!(f, ", invariant TSC")?;
		}
		if let Some(hz) = self.tsc_frequency_hz {
			write!(f, ", TSC @ {} MHz", hz / 1_000_000)?;
		}
		Ok(())
	}
}

/// Configure the control registers of the boot processor.
///
/// Enables write protection in ring 0, the NX bit, the SYSCALL/SYSRET
/// extensions, and the SSE state needed by `fxsave64`/`fxrstor64`.
pub fn configure() {
	unsafe {
		let mut cr0 = Cr0::read();
		cr0.insert(Cr0Flags::WRITE_PROTECT | Cr0Flags::MONITOR_COPROCESSOR);
		cr0.remove(Cr0Flags::EMULATE_COPROCESSOR | Cr0Flags::TASK_SWITCHED);
		Cr0::write(cr0);

		let mut cr4 = Cr4::read();
		cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
		Cr4::write(cr4);

		let mut efer = Efer::read();
		efer.insert(EferFlags::NO_EXECUTE_ENABLE | EferFlags::SYSTEM_CALL_EXTENSIONS);
		Efer::write(efer);
	}
}

pub fn print_information() {
	let cpuid = CpuId::<CpuIdReaderNative>::new();
	let brand = cpuid.get_processor_brand_string();

	info!(
		"CPU: {} ({})",
		brand.as_ref().map_or("unknown", |brand| brand.as_str().trim()),
		*FEATURES
	);
}

#[inline]
pub fn get_physical_address_bits() -> u8 {
	FEATURES.physical_address_bits
}

#[inline]
pub fn get_linear_address_bits() -> u8 {
	FEATURES.linear_address_bits
}

#[inline]
pub fn supports_x2apic() -> bool {
	FEATURES.x2apic
}

/// CPUID `0x8000_0007:EDX[8]`, the invariant-TSC bit.
#[inline]
pub fn has_invariant_tsc() -> bool {
	FEATURES.invariant_tsc
}

/// Serializing read of the Time-Stamp Counter.
#[inline]
pub fn rdtsc() -> u64 {
	unsafe {
		_mm_lfence();
		let value = _rdtsc();
		_mm_lfence();
		value
	}
}

#[inline]
pub fn readfs() -> u64 {
	FsBase::read().as_u64()
}

#[inline]
pub fn readgs() -> u64 {
	GsBase::read().as_u64()
}

/// Run CPUID leaf 0 once; the result is irrelevant, the instruction is a
/// full serialization point.
#[inline]
pub fn serialize() {
	unsafe {
		__cpuid(0);
	}
}

/// Halt this core forever.
pub fn halt() -> ! {
	loop {
		x86_64::instructions::interrupts::disable();
		x86_64::instructions::hlt();
	}
}
