//! A small x86-64 kernel that boots on UEFI/Limine-class firmware,
//! establishes supervisor execution, and multiplexes user-mode processes
//! loaded from a CPIO initrd over SYSCALL/SYSRET and the APIC timer.

#![no_std]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(all(test, not(target_os = "none")))]
extern crate std;

#[macro_use]
pub mod macros;

pub mod arch;
pub mod config;
pub mod console;
pub mod env;
pub mod initrd;
pub mod logging;
pub mod mm;
pub mod scheduler;
pub mod syscalls;

use mm::allocator::LockedAllocator;

// Host-side unit tests run on the std allocator instead.
#[cfg_attr(target_os = "none", global_allocator)]
static ALLOCATOR: LockedAllocator = LockedAllocator::new();

/// Check the magic of the console font carried in the initrd. Rendering
/// happens elsewhere; the kernel only validates and hands the blob over.
fn check_console_font() {
	match initrd::read_file(initrd::STANDARD_FONT) {
		Some(font) if font.starts_with(&[0x36, 0x04]) => {
			info!("Console font: PSF1, {} bytes", font.len());
		}
		Some(font) if font.starts_with(&[0x72, 0xb5, 0x4a, 0x86]) => {
			info!("Console font: PSF2, {} bytes", font.len());
		}
		Some(_) => warn!("Console font has an unknown magic"),
		None => warn!("No console font in the initrd"),
	}
}

/// Entry point, reached from the bootloader trampoline with the physical
/// address of the [`env::KernelArgs`] structure in `rdi`.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
pub extern "C" fn boot_processor_main(args: *const env::KernelArgs) -> ! {
	use arch::x86_64::kernel::{
		acpi, apic, clock, core_local, gdt, interrupts, processor, syscall, systemtime,
	};
	use scheduler::process::Process;

	unsafe {
		env::set_boot_args(args);
	}

	console::init();
	logging::init();
	info!(
		"Ferrite {} (built {})",
		env!("CARGO_PKG_VERSION"),
		build_time::build_time_utc!()
	);

	processor::configure();
	mm::init();
	core_local::CoreLocal::install();

	gdt::init();
	interrupts::install();

	acpi::init();
	apic::init_from_madt();
	clock::init();

	// One short one-shot proves the timer path before the scheduler
	// depends on it for preemption.
	let before = clock::counter_us();
	clock::sleep_ms(10);
	debug!("Timer self-test: slept {} us", clock::counter_us() - before);

	processor::print_information();
	systemtime::print_boot_time();
	interrupts::print_information();
	initrd::print_information();
	check_console_font();

	syscall::init();

	match initrd::read_file(initrd::TEST_PROGRAM) {
		Some(image) => {
			// Two instances of the test program take turns on the core.
			for _ in 0..2 {
				match Process::from_elf(&image) {
					Ok(process) => scheduler::spawn(process),
					Err(error) => error!("Cannot load {}: {error}", initrd::TEST_PROGRAM),
				}
			}
		}
		None => warn!("{} not found in the initrd", initrd::TEST_PROGRAM),
	}

	scheduler::run()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
	// The logger may be the thing that failed, so write straight through.
	println!("[PANIC] {info}");

	arch::x86_64::kernel::processor::halt()
}
