//! CPIO initrd access.
//!
//! The bootloader hands over a classic ASCII-header CPIO archive; the
//! kernel pulls its user programs and the console font out of it.

use alloc::vec;
use alloc::vec::Vec;

use hadris_cpio::CpioReader;
use hadris_io::Cursor;

use crate::env;

/// Path of the ELF image exercising the user-mode path.
pub const TEST_PROGRAM: &str = "bin/sys/test_program";

/// Path of the PSF console font.
pub const STANDARD_FONT: &str = "etc/kernel/standard_font.psf";

/// Look up a file in the initrd and return a copy of its contents.
pub fn read_file(path: &str) -> Option<Vec<u8>> {
	find_in_archive(env::initrd(), path)
}

fn find_in_archive(archive: &[u8], path: &str) -> Option<Vec<u8>> {
	let mut reader = CpioReader::new(Cursor::new(archive));
	let mut name_buf = [0u8; 512];

	loop {
		let entry = reader.next_entry_with_buf(&mut name_buf).ok()??;

		let name = entry.name_str().unwrap_or("");
		let name = name.strip_prefix('/').unwrap_or(name);

		if name == path {
			let mut contents = vec![0u8; entry.file_size() as usize];
			reader.read_entry_data(&entry, &mut contents).ok()?;
			return Some(contents);
		}

		reader.skip_entry_data(&entry).ok()?;
	}
}

pub fn print_information() {
	let initrd = env::initrd();
	if initrd.is_empty() {
		warn!("No initrd passed by the bootloader");
	} else {
		info!("Initrd: {} KiB", initrd.len() >> 10);
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::*;

	/// Assemble a minimal `newc` archive by hand.
	fn archive_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
		fn push_entry(archive: &mut Vec<u8>, name: &str, data: &[u8], mode: u32) {
			archive.extend_from_slice(b"070701");
			// c_ino, c_mode, c_uid, c_gid, c_nlink, c_mtime
			for value in [0u32, mode, 0, 0, 1, 0] {
				archive.extend_from_slice(alloc::format!("{value:08X}").as_bytes());
			}
			// c_filesize
			archive.extend_from_slice(alloc::format!("{:08X}", data.len()).as_bytes());
			// c_devmajor..c_rdevminor
			for value in [0u32, 0, 0, 0] {
				archive.extend_from_slice(alloc::format!("{value:08X}").as_bytes());
			}
			// c_namesize (incl. NUL), c_check
			archive.extend_from_slice(alloc::format!("{:08X}", name.len() + 1).as_bytes());
			archive.extend_from_slice(b"00000000");

			archive.extend_from_slice(name.as_bytes());
			archive.push(0);
			while archive.len() % 4 != 0 {
				archive.push(0);
			}

			archive.extend_from_slice(data);
			while archive.len() % 4 != 0 {
				archive.push(0);
			}
		}

		let mut archive = Vec::new();
		for (name, data) in entries {
			push_entry(&mut archive, name, data, 0o100_644);
		}
		push_entry(&mut archive, "TRAILER!!!", &[], 0);
		archive
	}

	#[test]
	fn finds_a_file_by_path() {
		let archive = archive_with(&[
			("etc/kernel/standard_font.psf", b"font bits"),
			("bin/sys/test_program", b"\x7fELF fake"),
		]);

		assert_eq!(
			find_in_archive(&archive, "bin/sys/test_program").as_deref(),
			Some(b"\x7fELF fake".as_slice())
		);
	}

	#[test]
	fn missing_files_yield_none() {
		let archive = archive_with(&[("bin/sys/test_program", b"x")]);
		assert_eq!(find_in_archive(&archive, "bin/other"), None);
	}

	#[test]
	fn empty_archive_yields_none() {
		assert_eq!(find_in_archive(&[], "bin/sys/test_program"), None);
	}
}
