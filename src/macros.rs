/// Print formatted text to the kernel console.
#[macro_export]
macro_rules! print {
	($($arg:tt)+) => ({
		$crate::console::_print(format_args!($($arg)+));
	});
}

/// Print formatted text to the kernel console, followed by a newline.
#[macro_export]
macro_rules! println {
	() => ($crate::print!("\n"));
	($($arg:tt)+) => ($crate::print!("{}\n", format_args!($($arg)+)));
}
