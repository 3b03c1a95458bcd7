/// Size of the privilege-0 stack entered from ring 3 and of every
/// TSS-provided interrupt stack.
pub const KERNEL_STACK_SIZE: usize = 4096;

/// Size of the kernel heap arena claimed at boot.
pub const KERNEL_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Virtual address space kept free above the highest user segment so the
/// initial stack page can grow later.
pub const USER_STACK_RESERVATION: u64 = 4 * 1024 * 1024 * 1024;

/// Number of priority levels in the run queues.
pub const NO_PRIORITIES: usize = 256;
