//! Clock manager.
//!
//! Concrete timer hardware is resolved once at boot into a table of
//! function pointers: a *calibration clock* with a slow but trustworthy
//! reference edge (RTC periodic interrupt, CMOS update cycle, or PIT), a
//! *fine timer* (the local-APIC timer, calibrated against the calibration
//! clock), and a *monotonic counter* (invariant TSC, or an emulation fed by
//! the APIC timer). Roles without hardware hold stubs that panic on use.

use core::arch::naked_asm;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::OnceCell;
use x86_64::instructions::port::Port;

use super::core_local::CoreLocal;
use super::{apic, idt, interrupts, pit, processor, scheduler};

const CMOS_COMMAND_PORT: u16 = 0x70;
const CMOS_DATA_PORT: u16 = 0x71;

const CMOS_DISABLE_NMI: u8 = 1 << 7;

const CMOS_STATUS_REGISTER_A: u8 = 0x0a;
const CMOS_STATUS_REGISTER_B: u8 = 0x0b;
const CMOS_STATUS_REGISTER_C: u8 = 0x0c;

const CMOS_UPDATE_IN_PROGRESS_FLAG: u8 = 1 << 7;
const CMOS_PERIODIC_INTERRUPT_FLAG: u8 = 1 << 6;

/// Rate divisor code for a 16 Hz periodic interrupt (32768 >> (12 - 1)).
const RTC_RATE_16HZ: u8 = 0x0c;
const RTC_TICK_MICROSECONDS: u64 = 1_000_000 / 16;

/// Periodic ticks one RTC calibration spans (500 ms).
const RTC_CALIBRATION_TICKS: u64 = 8;

/// PIT ticks one PIT calibration spans (~40 ms at 1.193182 MHz).
const PIT_CALIBRATION_TICKS: u64 = 47_727;

const RTC_IRQ: u8 = 8;

pub(crate) fn read_cmos_register(register: u8) -> u8 {
	unsafe {
		Port::<u8>::new(CMOS_COMMAND_PORT).write(CMOS_DISABLE_NMI | register);
		Port::<u8>::new(CMOS_DATA_PORT).read()
	}
}

fn write_cmos_register(register: u8, value: u8) {
	unsafe {
		Port::<u8>::new(CMOS_COMMAND_PORT).write(CMOS_DISABLE_NMI | register);
		Port::<u8>::new(CMOS_DATA_PORT).write(value);
	}
}

/// Incremented by the RTC periodic-interrupt stub.
static RTC_TICKS: AtomicU64 = AtomicU64::new(0);

extern "C" fn rtc_tick_handler() {
	RTC_TICKS.fetch_add(1, Ordering::Relaxed);
	// Status register C has to be read or the RTC holds the line.
	read_cmos_register(CMOS_STATUS_REGISTER_C);
	apic::eoi();
}

/// RTC periodic entry. Calibration runs with the kernel halted in
/// `wait_for_interrupt`, so this only ever interrupts kernel code and a
/// plain caller-saved save/restore suffices.
#[unsafe(naked)]
unsafe extern "C" fn rtc_tick_stub() {
	naked_asm!(
		"push rax",
		"push rcx",
		"push rdx",
		"push rsi",
		"push rdi",
		"push r8",
		"push r9",
		"push r10",
		"push r11",
		"cld",
		"call {handler}",
		"pop r11",
		"pop r10",
		"pop r9",
		"pop r8",
		"pop rdi",
		"pop rsi",
		"pop rdx",
		"pop rcx",
		"pop rax",
		"iretq",
		handler = sym rtc_tick_handler,
	);
}

/// Wait for the next RTC periodic tick.
fn rtc_wait_for_tick() {
	let seen = RTC_TICKS.load(Ordering::Relaxed);
	while RTC_TICKS.load(Ordering::Relaxed) == seen {
		interrupts::wait_for_interrupt();
	}
}

/// Calibration backed by the RTC's 16 Hz periodic interrupt.
fn rtc_calibration_sleep(start: fn()) -> u64 {
	// Synchronize with an edge first so the measured span is whole ticks.
	rtc_wait_for_tick();
	start();

	let begin = RTC_TICKS.load(Ordering::Relaxed);
	while RTC_TICKS.load(Ordering::Relaxed) < begin + RTC_CALIBRATION_TICKS {
		interrupts::wait_for_interrupt();
	}

	RTC_CALIBRATION_TICKS * RTC_TICK_MICROSECONDS
}

/// Wait until the CMOS clock finishes its once-per-second update.
fn cmos_wait_for_update_end() {
	while read_cmos_register(CMOS_STATUS_REGISTER_A) & CMOS_UPDATE_IN_PROGRESS_FLAG == 0 {
		spin_loop();
	}
	while read_cmos_register(CMOS_STATUS_REGISTER_A) & CMOS_UPDATE_IN_PROGRESS_FLAG > 0 {
		spin_loop();
	}
}

/// Calibration backed by polling the CMOS update cycle (one second).
fn cmos_calibration_sleep(start: fn()) -> u64 {
	cmos_wait_for_update_end();
	start();
	cmos_wait_for_update_end();

	1_000_000
}

/// Calibration backed by polling a PIT channel-0 countdown.
///
/// `start` is invoked exactly once, immediately after the counter is armed.
fn pit_calibration_sleep(start: fn()) -> u64 {
	pit::start_countdown(u16::MAX);
	start();

	let armed = pit::read_counter();
	while u64::from(armed.wrapping_sub(pit::read_counter())) < PIT_CALIBRATION_TICKS {
		spin_loop();
	}

	pit::ticks_to_microseconds(PIT_CALIBRATION_TICKS)
}

fn unavailable_calibration_sleep(_start: fn()) -> u64 {
	panic!("no calibration clock available");
}

/// `ticks = num * us / den`, the APIC/TSC tick count spanning `us`.
const fn ticks_for_microseconds(numerator: u64, denominator: u64, microseconds: u64) -> u64 {
	(numerator as u128 * microseconds as u128 / denominator as u128) as u64
}

/// Inverse of [`ticks_for_microseconds`]: `us = ticks * den / num`.
const fn ticks_to_microseconds(numerator: u64, denominator: u64, ticks: u64) -> u64 {
	if numerator == 0 {
		return 0;
	}
	(ticks as u128 * denominator as u128 / numerator as u128) as u64
}

fn apic_timer_ticks(milliseconds: u64) -> u32 {
	let apic = &CoreLocal::get().apic;
	ticks_for_microseconds(
		apic.timer_numerator.get(),
		apic.timer_denominator.get(),
		milliseconds * 1000,
	)
	.min(u64::from(u32::MAX)) as u32
}

/// Sleep on the one-shot APIC timer, halting between interrupts.
fn apic_sleep_ms(milliseconds: u64) {
	let apic = &CoreLocal::get().apic;

	apic.interrupt_received.set(0);
	apic::timer_one_shot(apic_timer_ticks(milliseconds), apic.timer_vector.get() as u8);

	while apic.interrupt_received.get() == 0 {
		interrupts::wait_for_interrupt();
	}

	apic::timer_stop();
	emulated_counter_advance(milliseconds * 1000);
}

/// Arm the one-shot timer without waiting; expiry preempts user mode
/// through the timer stub or flags `interrupt_received` in kernel mode.
fn apic_start_countdown(milliseconds: u64) {
	let apic = &CoreLocal::get().apic;

	apic.interrupt_received.set(0);
	COUNTDOWN_ARMED_US.store(milliseconds * 1000, Ordering::Relaxed);
	apic::timer_one_shot(apic_timer_ticks(milliseconds), apic.timer_vector.get() as u8);
}

fn apic_countdown_remaining() -> u64 {
	let apic = &CoreLocal::get().apic;
	ticks_to_microseconds(
		apic.timer_numerator.get(),
		apic.timer_denominator.get(),
		u64::from(apic::timer_remaining()),
	) / 1000
}

fn apic_countdown_ended() -> bool {
	CoreLocal::get().apic.interrupt_received.get() != 0 || apic::timer_remaining() == 0
}

fn apic_stop_countdown() {
	let armed = COUNTDOWN_ARMED_US.swap(0, Ordering::Relaxed);
	if apic_countdown_ended() {
		emulated_counter_advance(armed);
	}
	apic::timer_stop();
}

fn unavailable_sleep(_milliseconds: u64) {
	panic!("no fine timer available");
}

fn unavailable_countdown(_milliseconds: u64) {
	panic!("no countdown timer available");
}

fn unavailable_countdown_query_u64() -> u64 {
	panic!("no countdown timer available");
}

fn unavailable_countdown_query_bool() -> bool {
	panic!("no countdown timer available");
}

fn unavailable_countdown_stop() {
	panic!("no countdown timer available");
}

/// Microseconds most recently armed on the countdown, credited to the
/// emulated counter once the countdown expires.
static COUNTDOWN_ARMED_US: AtomicU64 = AtomicU64::new(0);

/// TSC value at calibration start.
static TSC_CALIBRATION_START: AtomicU64 = AtomicU64::new(0);

/// Coarse fallback counter for parts without an invariant TSC, advanced by
/// completed APIC-timer sleeps.
static EMULATED_COUNTER_US: AtomicU64 = AtomicU64::new(0);

fn emulated_counter_advance(microseconds: u64) {
	EMULATED_COUNTER_US.fetch_add(microseconds, Ordering::Relaxed);
}

fn tsc_counter_us() -> u64 {
	let core = CoreLocal::get();
	let elapsed = processor::rdtsc() - TSC_CALIBRATION_START.load(Ordering::Relaxed);
	ticks_to_microseconds(core.tsc_numerator.get(), core.tsc_denominator.get(), elapsed)
}

fn emulated_counter_us() -> u64 {
	EMULATED_COUNTER_US.load(Ordering::Relaxed)
}

/// Runtime dispatch table over the resolved clock roles.
pub struct ClockManager {
	pub calibration_clock_name: &'static str,
	pub counter_name: &'static str,
	pub calibration_sleep: fn(fn()) -> u64,
	pub sleep_ms: fn(u64),
	pub start_countdown: fn(u64),
	pub get_countdown_remaining: fn() -> u64,
	pub countdown_ended: fn() -> bool,
	pub stop_countdown: fn(),
	pub counter_us: fn() -> u64,
}

impl ClockManager {
	const fn stubbed() -> Self {
		Self {
			calibration_clock_name: "none",
			counter_name: "none",
			calibration_sleep: unavailable_calibration_sleep,
			sleep_ms: unavailable_sleep,
			start_countdown: unavailable_countdown,
			get_countdown_remaining: unavailable_countdown_query_u64,
			countdown_ended: unavailable_countdown_query_bool,
			stop_countdown: unavailable_countdown_stop,
			counter_us: emulated_counter_us,
		}
	}
}

static CLOCK_MANAGER: OnceCell<ClockManager> = OnceCell::new();

fn manager() -> &'static ClockManager {
	CLOCK_MANAGER.get().expect("clock manager is not initialized")
}

pub fn calibration_sleep(start: fn()) -> u64 {
	(manager().calibration_sleep)(start)
}

pub fn sleep_ms(milliseconds: u64) {
	(manager().sleep_ms)(milliseconds);
}

pub fn start_countdown(milliseconds: u64) {
	(manager().start_countdown)(milliseconds);
}

pub fn get_countdown_remaining() -> u64 {
	(manager().get_countdown_remaining)()
}

pub fn countdown_ended() -> bool {
	(manager().countdown_ended)()
}

pub fn stop_countdown() {
	(manager().stop_countdown)();
}

/// Monotonic microseconds since calibration.
pub fn counter_us() -> u64 {
	(manager().counter_us)()
}

/// Pick a calibration clock: RTC periodic interrupts when the IO-APIC can
/// route IRQ 8, CMOS update polling when the RTC at least answers, PIT as
/// the last resort. Returns whether the RTC periodic interrupt was armed.
fn select_calibration_clock(manager: &mut ClockManager) -> bool {
	let rtc_present = read_cmos_register(CMOS_STATUS_REGISTER_A) != 0xff;

	if rtc_present {
		if let Ok(vector) = apic::find_and_reserve_entry() {
			if apic::register_legacy_irq(RTC_IRQ, vector) {
				idt::set_gate(vector, rtc_tick_stub as usize, 0);
				interrupts::add_irq_name(vector, "RTC");

				// 16 Hz periodic rate, then enable the periodic interrupt.
				let rate = read_cmos_register(CMOS_STATUS_REGISTER_A);
				write_cmos_register(CMOS_STATUS_REGISTER_A, (rate & 0xf0) | RTC_RATE_16HZ);
				let control = read_cmos_register(CMOS_STATUS_REGISTER_B);
				write_cmos_register(
					CMOS_STATUS_REGISTER_B,
					control | CMOS_PERIODIC_INTERRUPT_FLAG,
				);
				read_cmos_register(CMOS_STATUS_REGISTER_C);

				manager.calibration_clock_name = "RTC (16 Hz)";
				manager.calibration_sleep = rtc_calibration_sleep;
				return true;
			}

			apic::release_entry(vector);
		}

		// No interrupt routing, but the update cycle can still be polled.
		manager.calibration_clock_name = "CMOS update cycle";
		manager.calibration_sleep = cmos_calibration_sleep;
	} else {
		manager.calibration_clock_name = "PIT";
		manager.calibration_sleep = pit_calibration_sleep;
	}

	false
}

/// Tear the RTC periodic interrupt back down after calibration.
fn disable_rtc_periodic() {
	let control = read_cmos_register(CMOS_STATUS_REGISTER_B);
	write_cmos_register(
		CMOS_STATUS_REGISTER_B,
		control & !CMOS_PERIODIC_INTERRUPT_FLAG,
	);
	read_cmos_register(CMOS_STATUS_REGISTER_C);
	apic::unregister_legacy_irq(RTC_IRQ);
}

/// Resolve every clock role and calibrate the fine timers.
pub fn init() {
	let mut manager = ClockManager::stubbed();
	let rtc_armed = select_calibration_clock(&mut manager);

	// Calibrate the APIC timer against the calibration clock: let the
	// divided counter run across exactly one reference sleep.
	let microseconds = (manager.calibration_sleep)(apic::timer_start_calibration);
	let apic_ticks = apic::timer_calibration_elapsed();

	let core = CoreLocal::get();
	core.apic.timer_numerator.set(apic_ticks);
	core.apic.timer_denominator.set(microseconds);

	let timer_vector = apic::find_and_reserve_entry()
		.expect("no free vector for the scheduler timer");
	idt::set_gate(timer_vector, scheduler::timer_interrupt_stub as usize, 0);
	interrupts::add_irq_name(timer_vector, "Timer");
	core.apic.timer_vector.set(u64::from(timer_vector));

	manager.sleep_ms = apic_sleep_ms;
	manager.start_countdown = apic_start_countdown;
	manager.get_countdown_remaining = apic_countdown_remaining;
	manager.countdown_ended = apic_countdown_ended;
	manager.stop_countdown = apic_stop_countdown;

	// Monotonic counter: invariant TSC if the CPU guarantees one,
	// otherwise the coarse APIC-fed emulation.
	if processor::has_invariant_tsc() {
		let microseconds = (manager.calibration_sleep)(|| {
			TSC_CALIBRATION_START.store(processor::rdtsc(), Ordering::Relaxed);
		});
		let tsc_ticks = processor::rdtsc() - TSC_CALIBRATION_START.load(Ordering::Relaxed);

		core.tsc_numerator.set(tsc_ticks);
		core.tsc_denominator.set(microseconds);

		manager.counter_name = "invariant TSC";
		manager.counter_us = tsc_counter_us;
	} else {
		manager.counter_name = "emulated (APIC timer)";
		manager.counter_us = emulated_counter_us;
	}

	if rtc_armed {
		disable_rtc_periodic();
	}

	info!(
		"Clocks: calibration via {}, counter via {} ({} APIC ticks / {} us)",
		manager.calibration_clock_name,
		manager.counter_name,
		apic_ticks,
		microseconds
	);

	CLOCK_MANAGER
		.set(manager)
		.unwrap_or_else(|_| panic!("clock manager initialized twice"));
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn tick_conversion_round_trip() {
		// 100 ticks per microsecond.
		let (num, den) = (100_000, 1000);

		assert_eq!(ticks_for_microseconds(num, den, 50_000), 5_000_000);
		assert_eq!(ticks_to_microseconds(num, den, 5_000_000), 50_000);
	}

	#[test]
	fn tick_conversion_handles_tsc_magnitudes() {
		// A 3 GHz TSC calibrated over a full second.
		let (num, den) = (3_000_000_000, 1_000_000);

		assert_eq!(
			ticks_for_microseconds(num, den, 10_000_000),
			30_000_000_000
		);
		assert_eq!(
			ticks_to_microseconds(num, den, 30_000_000_000),
			10_000_000
		);
	}

	#[test]
	fn zero_numerator_yields_zero() {
		assert_eq!(ticks_to_microseconds(0, 1000, 12345), 0);
	}

	#[test]
	fn pit_tick_arithmetic() {
		// The calibration span must stay within the 16-bit counter.
		assert!(PIT_CALIBRATION_TICKS < u64::from(u16::MAX));
		// ~40 ms in microseconds.
		let us = pit::ticks_to_microseconds(PIT_CALIBRATION_TICKS);
		assert!((39_000..41_000).contains(&us));
	}
}
