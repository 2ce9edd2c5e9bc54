use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Size-based log rotation. The active file lives at `path`; when it would
/// exceed `max_bytes` it is renamed to `<stem>-<YYYYMMDD-HHMMSS>.<ext>`
/// (UTC stamp) and a fresh file is opened. At most `max_backups` archives
/// are kept; older ones are deleted.
#[derive(Clone, Debug)]
pub struct RollingConfig {
	pub path: PathBuf,
	pub max_bytes: u64,
	pub max_backups: usize,
}

impl Default for RollingConfig {
	fn default() -> Self {
		RollingConfig {
			path: PathBuf::from("honeypot.log"),
			max_bytes: 5 * 1024 * 1024,
			max_backups: 10,
		}
	}
}

pub struct SizeRolling {
	cfg: RollingConfig,
	file: File,
	written: u64,
}

impl SizeRolling {
	pub fn new(cfg: RollingConfig) -> io::Result<Self> {
		if let Some(parent) = cfg.path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)?;
			}
		}
		let file = open_active(&cfg.path)?;
		let written = file.metadata().map(|m| m.len()).unwrap_or(0);
		Ok(SizeRolling { cfg, file, written })
	}

	fn rotate(&mut self) -> io::Result<()> {
		self.file.flush()?;
		let archive = archive_path(&self.cfg.path);
		fs::rename(&self.cfg.path, &archive)?;
		self.prune();
		self.file = open_active(&self.cfg.path)?;
		self.written = 0;
		Ok(())
	}

	fn prune(&self) {
		let mut archives = list_archives(&self.cfg.path);
		if archives.len() <= self.cfg.max_backups {
			return;
		}
		// Stamp format sorts lexicographically, oldest first.
		archives.sort();
		let excess = archives.len() - self.cfg.max_backups;
		for old in archives.into_iter().take(excess) {
			let _ = fs::remove_file(old);
		}
	}
}

impl Write for SizeRolling {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.written > 0 && self.written + buf.len() as u64 > self.cfg.max_bytes {
			// Rotation failure (e.g. permissions) must not lose the log line;
			// keep appending to the oversized file and retry on the next write.
			let _ = self.rotate();
		}
		let n = self.file.write(buf)?;
		self.written += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.file.flush()
	}
}

fn open_active(path: &Path) -> io::Result<File> {
	OpenOptions::new().create(true).append(true).open(path)
}

fn archive_path(path: &Path) -> PathBuf {
	let stem = path
		.file_stem()
		.map(|s| s.to_string_lossy().into_owned())
		.unwrap_or_else(|| "log".to_string());
	let ext = path
		.extension()
		.map(|e| format!(".{}", e.to_string_lossy()))
		.unwrap_or_default();
	let stamp = Utc::now().format("%Y%m%d-%H%M%S");
	let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
	let mut candidate = dir.join(format!("{stem}-{stamp}{ext}"));
	// Two rotations within one second would collide on the stamp.
	let mut n = 1;
	while candidate.exists() {
		candidate = dir.join(format!("{stem}-{stamp}.{n}{ext}"));
		n += 1;
	}
	candidate
}

fn list_archives(path: &Path) -> Vec<PathBuf> {
	let stem = path
		.file_stem()
		.map(|s| s.to_string_lossy().into_owned())
		.unwrap_or_default();
	let ext = path
		.extension()
		.map(|e| format!(".{}", e.to_string_lossy()))
		.unwrap_or_default();
	let prefix = format!("{stem}-");
	let dir = match path.parent() {
		Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
		_ => PathBuf::from("."),
	};
	let Ok(entries) = fs::read_dir(&dir) else {
		return Vec::new();
	};
	entries
		.flatten()
		.filter_map(|e| {
			let name = e.file_name().to_string_lossy().into_owned();
			(name.starts_with(&prefix) && name.ends_with(&ext)).then(|| e.path())
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg(dir: &Path, max_bytes: u64, max_backups: usize) -> RollingConfig {
		RollingConfig {
			path: dir.join("honeypot.log"),
			max_bytes,
			max_backups,
		}
	}

	#[test]
	fn rotates_when_full() {
		let dir = tempfile::tempdir().unwrap();
		let mut w = SizeRolling::new(cfg(dir.path(), 64, 10)).unwrap();
		for _ in 0..4 {
			w.write_all(&[b'x'; 40]).unwrap();
		}
		w.flush().unwrap();
		let archives = list_archives(&dir.path().join("honeypot.log"));
		assert!(!archives.is_empty(), "expected at least one archive");
		assert!(dir.path().join("honeypot.log").exists());
	}

	#[test]
	fn prunes_old_archives() {
		let dir = tempfile::tempdir().unwrap();
		let mut w = SizeRolling::new(cfg(dir.path(), 32, 2)).unwrap();
		for _ in 0..20 {
			w.write_all(&[b'y'; 24]).unwrap();
		}
		w.flush().unwrap();
		let archives = list_archives(&dir.path().join("honeypot.log"));
		assert!(archives.len() <= 2, "expected pruning, got {archives:?}");
	}

	#[test]
	fn small_writes_never_rotate() {
		let dir = tempfile::tempdir().unwrap();
		let mut w = SizeRolling::new(cfg(dir.path(), 1024, 10)).unwrap();
		w.write_all(b"hello\n").unwrap();
		w.flush().unwrap();
		assert!(list_archives(&dir.path().join("honeypot.log")).is_empty());
	}
}
