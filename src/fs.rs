//! Filesystem primitives used by the tool handlers.
//!
//! Everything here takes paths that already went through the sandbox.

use crate::error::FsError;
use crate::sandbox::PathResolver;
use chrono::{DateTime, SecondsFormat, Utc};
use filetime::{set_file_times, FileTime};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;
use tokio::fs;

/// Reads a file that must be UTF-8 text.
pub async fn read_text(path: &Path) -> Result<String, FsError> {
	let bytes = fs::read(path).await.map_err(|err| FsError::io("read", path, err))?;
	String::from_utf8(bytes).map_err(|_| FsError::Encoding(path.to_path_buf()))
}

/// Writes `content`, creating missing parent directories.
pub async fn write_text(path: &Path, content: &str) -> Result<(), FsError> {
	let failed = |source: io::Error| FsError::WriteFailure {
		path: path.to_path_buf(),
		source
	};
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await.map_err(failed)?;
	}
	fs::write(path, content).await.map_err(failed)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineWindow {
	pub content: String,
	pub count: usize,
	pub total: usize,
	pub truncated: bool,
	pub reasons: Vec<&'static str>,
}

impl LineWindow {
	fn mark(&mut self, reason: &'static str) {
		self.truncated = true;
		if !self.reasons.contains(&reason) {
			self.reasons.push(reason);
		}
	}
}

/// Selects `limit` lines starting at the 1-based `start_line`, within a byte
/// budget. Lines longer than `max_line_bytes` are cut on a char boundary and
/// tagged with the number of hidden bytes.
pub fn line_window(
	content: &str,
	start_line: usize,
	limit: usize,
	max_total_bytes: usize,
	max_line_bytes: usize) -> LineWindow {
	let mut window = LineWindow {
		total: content.lines().count(),
		..LineWindow::default()
	};
	let mut used_bytes = 0usize;
	let start_index = start_line.saturating_sub(1);
	for line in content.lines().skip(start_index) {
		if window.count >= limit {
			window.mark("line_limit");
			break;
		}
		let mut text = line.to_string();
		if line.len() > max_line_bytes {
			let kept = truncate_to_bytes(line, max_line_bytes);
			text = format!("{} [TRUNCATED: {} bytes hidden]", kept, line.len() - kept.len());
			window.mark("long_lines");
		}
		let separator = if window.count == 0 {
			0
		}
		else {
			1
		};
		if used_bytes + separator + text.len() > max_total_bytes {
			window.mark("max_bytes");
			break;
		}
		if separator == 1 {
			window.content.push('\n');
		}
		window.content.push_str(&text);
		used_bytes += separator + text.len();
		window.count += 1;
	}
	window
}

fn truncate_to_bytes(input: &str, max_bytes: usize) -> &str {
	if input.len() <= max_bytes {
		return input;
	}
	let mut end = 0usize;
	for (idx, ch) in input.char_indices() {
		let next = idx + ch.len_utf8();
		if next > max_bytes {
			break;
		}
		end = next;
	}
	&input[..end]
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
	#[default]
	Overwrite,
	Append,
	Prepend,
}

/// Content that a write in `mode` would leave on disk. Append and prepend
/// insert a newline between the parts when neither side provides one.
pub fn compose_write(existing: &str, content: &str, mode: WriteMode) -> String {
	match mode {
		WriteMode::Overwrite => content.to_string(),
		WriteMode::Append => {
			if existing.is_empty() || content.is_empty() || existing.ends_with('\n') {
				format!("{}{}", existing, content)
			}
			else {
				format!("{}\n{}", existing, content)
			}
		}
		WriteMode::Prepend => {
			if existing.is_empty() || content.is_empty() || content.ends_with('\n') {
				format!("{}{}", content, existing)
			}
			else {
				format!("{}\n{}", content, existing)
			}
		}
	}
}

/// Renames `from` to `to`, falling back to copy + delete across devices.
pub async fn move_path(from: &Path, to: &Path) -> Result<(), FsError> {
	if fs::symlink_metadata(to).await.is_ok() {
		return Err(FsError::TargetExists(to.to_path_buf()));
	}
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).await.map_err(|err| FsError::io("create", parent, err))?;
	}
	match fs::rename(from, to).await {
		Ok(()) => return Ok(()),
		Err(err) if !is_cross_device(&err) => return Err(FsError::io("move", from, err)),
		Err(_) => {}
	}
	let meta = fs::metadata(from).await.map_err(|err| FsError::io("move", from, err))?;
	let copied = if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await
	}
	else {
		copy_file_with_meta(from, to).await
	};
	copied.map_err(|err| FsError::io("copy", to, err))?;
	let removed = if meta.is_dir() {
		fs::remove_dir_all(from).await
	}
	else {
		fs::remove_file(from).await
	};
	removed.map_err(|err| FsError::io("remove", from, err))
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> io::Result<()> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).await?;
	}
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	copy_times(&meta, to)
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let file_type = entry.file_type().await?;
				if file_type.is_symlink() {
					copy_symlink(&src, &dst).await?;
				}
				else if file_type.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			copy_times(&meta, &to)
		}
	)
}

// Links are recreated as links. Copying through them would pull in content
// from outside the moved tree.
#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
	let target = fs::read_link(from).await?;
	fs::symlink(target, to).await
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, _to: &Path) -> io::Result<()> {
	Err(io::Error::new(
		io::ErrorKind::Unsupported,
		format!("cannot copy symlink {} across devices", from.display())
	))
}

fn copy_times(meta: &std::fs::Metadata, to: &Path) -> io::Result<()> {
	let atime = FileTime::from_last_access_time(meta);
	let mtime = FileTime::from_last_modification_time(meta);
	set_file_times(to, atime, mtime)
}

fn is_cross_device(err: &io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

/// A directory entry as seen without following symlinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
	pub name: String,
	pub is_dir: bool,
	pub is_symlink: bool,
	pub size: u64,
}

/// Entries of `dir`, sorted by name.
pub async fn list_entries(dir: &Path) -> Result<Vec<EntryInfo>, FsError> {
	let mut entries = fs::read_dir(dir).await.map_err(|err| FsError::io("list", dir, err))?;
	let mut out = Vec::new();
	while let Some(entry) = entries.next_entry().await.map_err(|err| FsError::io("list", dir, err))? {
		let file_type = entry.file_type().await.map_err(|err| FsError::io("inspect", entry.path(), err))?;
		let size = entry.metadata()
			.await
			.map(|meta| meta.len())
			.unwrap_or(0);
		out.push(EntryInfo {
			name: entry.file_name().to_string_lossy().to_string(),
			is_dir: file_type.is_dir(),
			is_symlink: file_type.is_symlink(),
			size
		});
	}
	out.sort_by(|a, b| a.name.cmp(&b.name));
	Ok(out)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
	#[default]
	#[serde(alias = "file_name")]
	Name,
	Size,
}

pub fn sort_entries(entries: &mut [EntryInfo], sort_by: SortBy) {
	match sort_by {
		SortBy::Name => entries.sort_by_key(|entry| entry.name.to_lowercase()),
		SortBy::Size => entries.sort_by(|a, b| b.size.cmp(&a.size)),
	}
}

pub fn format_size(bytes: u64) -> String {
	let mut size = bytes as f64;
	for unit in ["B", "KB", "MB", "GB", "TB"] {
		if size < 1024.0 {
			return format!("{:.2} {}", size, unit);
		}
		size /= 1024.0;
	}
	format!("{:.2} PB", size)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub children: Option<Vec<TreeEntry>>,
}

/// Recursive listing of `dir`. Symlinks are reported but never descended into.
pub fn build_tree(dir: PathBuf) -> Pin<Box<dyn Future<Output = Result<Vec<TreeEntry>, FsError>> + Send>> {
	Box::pin(
		async move {
			let mut tree = Vec::new();
			for entry in list_entries(&dir).await? {
				let (kind, children) = if entry.is_symlink {
					("symlink", None)
				}
				else if entry.is_dir {
					("directory", Some(build_tree(dir.join(&entry.name)).await?))
				}
				else {
					("file", None)
				};
				tree.push(TreeEntry {
					name: entry.name,
					kind,
					children
				});
			}
			Ok(tree)
		}
	)
}

pub struct SearchOptions {
	pub pattern: String,
	pub exclude: Vec<String>,
	pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct SearchResult {
	pub matches: Vec<PathBuf>,
	pub truncated: bool,
}

/// Walks `root` for entries whose name contains `pattern`, ignoring case.
///
/// Excluded entries are pruned together with everything below them. Entries
/// that do not pass the sandbox (links leaving the allowed roots) are skipped.
pub fn search(root: &Path, options: &SearchOptions, resolver: &PathResolver) -> Result<SearchResult, FsError> {
	let exclude_set = build_exclude_set(&options.exclude)?;
	let needle = options.pattern.to_lowercase();
	let mut builder = WalkBuilder::new(root);
	builder.standard_filters(false);
	builder.follow_links(false);
	if let Some(excludes) = exclude_set {
		let walk_root = root.to_path_buf();
		builder.filter_entry(move |entry| !is_excluded(&excludes, &walk_root, entry.path()));
	}
	let mut result = SearchResult::default();
	for entry in builder.build() {
		let Ok(entry) = entry else {
			continue;
		};
		let path = entry.path();
		if path == root {
			continue;
		}
		let Some(name) = path.file_name().map(|name| name.to_string_lossy().to_lowercase()) else {
			continue;
		};
		if !name.contains(&needle) {
			continue;
		}
		if resolver.validate(&path.to_string_lossy(), false).is_err() {
			continue;
		}
		if let Some(limit) = options.limit {
			if result.matches.len() >= limit {
				result.truncated = true;
				break;
			}
		}
		result.matches.push(path.to_path_buf());
	}
	Ok(result)
}

fn is_excluded(excludes: &GlobSet, root: &Path, path: &Path) -> bool {
	if excludes.is_match(path) {
		return true;
	}
	if let Ok(rel) = path.strip_prefix(root) {
		if !rel.as_os_str().is_empty() && excludes.is_match(rel) {
			return true;
		}
	}
	path.file_name()
		.map(|name| excludes.is_match(name))
		.unwrap_or(false)
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>, FsError> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = Glob::new(pattern).map_err(|err| invalid_pattern(pattern, err))?;
		builder.add(glob);
	}
	builder.build()
		.map(Some)
		.map_err(|err| invalid_pattern("exclude set", err))
}

fn invalid_pattern(pattern: &str, err: globset::Error) -> FsError {
	FsError::Io {
		action: "parse exclude pattern",
		path: PathBuf::from(pattern),
		source: io::Error::new(io::ErrorKind::InvalidInput, err)
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileInfo {
	pub size: u64,
	pub created: Option<String>,
	pub modified: Option<String>,
	pub accessed: Option<String>,
	pub is_directory: bool,
	pub is_file: bool,
	pub permissions: String,
}

pub async fn file_info(path: &Path) -> Result<FileInfo, FsError> {
	let meta = fs::metadata(path).await.map_err(|err| FsError::io("stat", path, err))?;
	Ok(FileInfo {
		size: meta.len(),
		created: meta.created().ok().map(rfc3339),
		modified: meta.modified().ok().map(rfc3339),
		accessed: meta.accessed().ok().map(rfc3339),
		is_directory: meta.is_dir(),
		is_file: meta.is_file(),
		permissions: permissions(&meta)
	})
}

fn rfc3339(time: SystemTime) -> String {
	DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(unix)]
fn permissions(meta: &std::fs::Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	format!("{:03o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permissions(meta: &std::fs::Metadata) -> String {
	if meta.permissions().readonly() {
		"r--".to_string()
	}
	else {
		"rw-".to_string()
	}
}
