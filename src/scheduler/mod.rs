pub mod process;

use alloc::boxed::Box;
use core::ptr::NonNull;

use hermit_sync::InterruptSpinMutex;

use self::process::Process;
use crate::arch::x86_64::kernel::core_local::{CoreLocal, YieldReason};
use crate::arch::x86_64::kernel::{clock, interrupts, processor, scheduler as arch};
use crate::config::NO_PRIORITIES;
use crate::syscalls;

/// Round-robin timeslice granted before the one-shot timer preempts.
const TIMESLICE_MS: u64 = 10;

/// Runnable processes: one intrusive doubly linked list per priority, plus
/// a bitmap over the non-empty lists.
pub(crate) struct PriorityProcessQueue {
	heads: [Option<NonNull<Process>>; NO_PRIORITIES],
	tails: [Option<NonNull<Process>>; NO_PRIORITIES],
	prio_bitmap: [u64; NO_PRIORITIES / 64],
}

// Queued processes are owned by the queue; the raw links never escape it.
unsafe impl Send for PriorityProcessQueue {}

impl PriorityProcessQueue {
	pub const fn new() -> Self {
		Self {
			heads: [None; NO_PRIORITIES],
			tails: [None; NO_PRIORITIES],
			prio_bitmap: [0; NO_PRIORITIES / 64],
		}
	}

	/// Append a process at the tail of its priority's list.
	pub fn push(&mut self, process: Box<Process>) {
		let priority = process.priority.into() as usize;
		debug_assert!(
			process.prev.is_none() && process.next.is_none(),
			"process {} is already queued",
			process.id
		);

		let mut node = NonNull::from(Box::leak(process));

		unsafe {
			node.as_mut().prev = self.tails[priority];
			node.as_mut().next = None;

			match self.tails[priority] {
				Some(mut tail) => tail.as_mut().next = Some(node),
				None => self.heads[priority] = Some(node),
			}
		}

		self.tails[priority] = Some(node);
		self.prio_bitmap[priority / 64] |= 1 << (priority % 64);
	}

	/// Pop the head of the first non-empty list, scanning priority 0
	/// upwards.
	pub fn try_pop(&mut self) -> Option<Box<Process>> {
		let priority = self
			.prio_bitmap
			.iter()
			.enumerate()
			.find_map(|(word_index, word)| {
				(*word != 0).then(|| word_index * 64 + word.trailing_zeros() as usize)
			})?;

		let mut head = self.heads[priority]?;
		unsafe {
			self.heads[priority] = head.as_ref().next;
			match self.heads[priority] {
				Some(mut next) => next.as_mut().prev = None,
				None => {
					self.tails[priority] = None;
					self.prio_bitmap[priority / 64] &= !(1 << (priority % 64));
				}
			}

			head.as_mut().prev = None;
			head.as_mut().next = None;

			Some(Box::from_raw(head.as_ptr()))
		}
	}

	pub fn is_empty(&self) -> bool {
		self.prio_bitmap.iter().all(|word| *word == 0)
	}
}

static RUN_QUEUE: InterruptSpinMutex<PriorityProcessQueue> =
	InterruptSpinMutex::new(PriorityProcessQueue::new());

pub fn spawn(process: Box<Process>) {
	info!(
		"Spawning process {} (priority {}, entry {:#x})",
		process.id, process.priority, process.registers.rip
	);
	RUN_QUEUE.lock().push(process);
}

pub fn has_runnable_processes() -> bool {
	!RUN_QUEUE.lock().is_empty()
}

/// The kernel-main scheduler loop. Never returns.
///
/// Each round installs the next runnable process into the per-CPU block,
/// arms the preemption countdown, and enters user mode; the reason the
/// process came back decides what happens to it.
pub fn run() -> ! {
	loop {
		let Some(mut process) = RUN_QUEUE.lock().try_pop() else {
			info!("No runnable processes left");
			processor::halt();
		};

		let core = CoreLocal::get();
		unsafe {
			let current = core.current_mut();
			current.id = process.id.into();
			current.page_table = process.page_table_root().as_u64();
			current.registers = process.registers.clone();
		}
		core.clear_yield_info();
		core.current_process.set(core::ptr::from_mut::<Process>(&mut process));

		clock::start_countdown(TIMESLICE_MS);
		unsafe {
			arch::switch_to_user();
		}
		clock::stop_countdown();

		process.registers = unsafe { core.current_mut() }.registers.clone();
		core.current_process.set(core::ptr::null_mut());

		match core.yield_reason() {
			YieldReason::SyscallRequest => {
				let result = syscalls::dispatch(&mut process);
				process.registers.rax = result;
				RUN_QUEUE.lock().push(process);
			}
			YieldReason::YieldSyscall => {
				process.registers.rax = 0;
				RUN_QUEUE.lock().push(process);
			}
			YieldReason::Timeout => {
				RUN_QUEUE.lock().push(process);
			}
			YieldReason::ExitRequest => {
				info!("Process {} exited", process.id);
				unsafe {
					// The dying address space may still be in CR3.
					crate::arch::x86_64::mm::switch_to_kernel_root();
				}
				drop(process);
			}
			YieldReason::Exception => {
				let yield_info = &core.yield_info;
				error!(
					"Process {} raised {} (error code {:#x}) at rip {:#x}",
					process.id,
					interrupts::exception_name(yield_info.exception_type),
					yield_info.error_code,
					process.registers.rip
				);
				if yield_info.exception_type == interrupts::EXC_PAGE_FAULT {
					error!(
						"page_fault_address = {:#x}",
						yield_info.page_fault_address
					);
				}
				panic!("unhandled exception in user process {}", process.id);
			}
			YieldReason::None => {
				warn!("Process {} yielded without a reason", process.id);
				RUN_QUEUE.lock().push(process);
			}
		}
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::process::Priority;
	use super::*;

	#[test]
	fn fifo_within_one_priority() {
		let mut queue = PriorityProcessQueue::new();
		let first = process::Process::dummy(Priority::from(7));
		let second = process::Process::dummy(Priority::from(7));
		let (first_id, second_id) = (first.id, second.id);

		queue.push(first);
		queue.push(second);

		assert_eq!(queue.try_pop().unwrap().id, first_id);
		assert_eq!(queue.try_pop().unwrap().id, second_id);
		assert!(queue.try_pop().is_none());
	}

	#[test]
	fn lower_priority_value_wins() {
		let mut queue = PriorityProcessQueue::new();
		let background = process::Process::dummy(Priority::from(200));
		let interactive = process::Process::dummy(Priority::from(3));
		let interactive_id = interactive.id;

		queue.push(background);
		queue.push(interactive);

		assert_eq!(queue.try_pop().unwrap().id, interactive_id);
	}

	#[test]
	fn links_are_cleared_outside_the_queue() {
		let mut queue = PriorityProcessQueue::new();
		queue.push(process::Process::dummy(Priority::from(0)));
		queue.push(process::Process::dummy(Priority::from(0)));

		let popped = queue.try_pop().unwrap();
		assert!(popped.prev.is_none() && popped.next.is_none());

		// Re-queueing the popped process must keep the list consistent.
		queue.push(popped);
		let remaining: alloc::vec::Vec<_> = core::iter::from_fn(|| queue.try_pop())
			.map(|process| {
				assert!(process.prev.is_none() && process.next.is_none());
				process.id
			})
			.collect();
		assert_eq!(remaining.len(), 2);
		assert!(queue.is_empty());
	}

	#[test]
	fn priorities_above_63_use_the_upper_bitmap_words() {
		let mut queue = PriorityProcessQueue::new();
		let process = process::Process::dummy(Priority::from(130));
		let id = process.id;

		queue.push(process);
		assert!(!queue.is_empty());
		assert_eq!(queue.try_pop().unwrap().id, id);
		assert!(queue.is_empty());
	}
}
