//! Path sandboxing.
//!
//! Every path that reaches a filesystem call is first run through
//! [`PathResolver::validate`]. The resolver expands `~`, makes the path
//! absolute, follows symlinks and only then checks the result against the
//! [`Allowlist`], so a link that lives inside an allowed root but points
//! outside of it is rejected.
//!
//! The resolver does not open files itself. A symlink swapped in between
//! validation and the handler's open is not detected.

use crate::error::FsError;
use anyhow::{anyhow, Result};
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const MAX_LINK_HOPS: usize = 40;

/// Directories the server may touch.
///
/// Built during startup and never mutated afterwards: the owning [`Config`]
/// is only handed out by shared reference once requests are being served.
///
/// [`Config`]: crate::config::Config
#[derive(Clone, Debug, Default)]
pub struct Allowlist {
	roots: Vec<PathBuf>,
}

impl Allowlist {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a root. The path is lexically normalized but not resolved.
	pub fn allow(&mut self, path: impl AsRef<Path>) {
		self.roots.push(normalize_path(path.as_ref()));
	}

	/// Containment is component-wise: `/data` covers `/data/x` but not `/data2`.
	pub fn is_allowed(&self, path: &Path) -> bool {
		let normalized = normalize_path(path);
		self.roots
			.iter()
			.any(|root| normalized.starts_with(root))
	}

	/// The deepest root containing `path`.
	pub fn root_for(&self, path: &Path) -> Option<&Path> {
		let normalized = normalize_path(path);
		let mut best: Option<&PathBuf> = None;
		for root in &self.roots {
			if normalized.starts_with(root) {
				let deeper = best.map(|current| root.components().count() > current.components().count())
					.unwrap_or(true);
				if deeper {
					best = Some(root);
				}
			}
		}
		best.map(PathBuf::as_path)
	}

	pub fn roots(&self) -> &[PathBuf] {
		&self.roots
	}
}

/// A validated path. `absolute` is symlink-resolved whenever the path existed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
	pub absolute: PathBuf,
	pub exists: bool,
}

#[derive(Clone, Debug)]
pub struct PathResolver {
	allowlist: Allowlist,
	home: Option<PathBuf>,
	cwd: PathBuf,
}

impl PathResolver {
	pub fn new(allowlist: Allowlist, home: Option<PathBuf>, cwd: PathBuf) -> Self {
		Self {
			allowlist,
			home,
			cwd
		}
	}

	/// Builds the resolver from operator supplied directories. Each entry must
	/// exist and be a directory; the first bad entry aborts startup.
	pub fn from_directories(directories: &[String], home: Option<PathBuf>, cwd: PathBuf) -> Result<Self> {
		if directories.is_empty() {
			return Err(anyhow!("at least one allowed directory is required"));
		}
		let mut allowlist = Allowlist::new();
		for raw in directories {
			let absolute = absolutize(&expand_home(raw, home.as_deref()), &cwd);
			let meta = std::fs::metadata(&absolute)
				.map_err(|err| anyhow!("allowed directory {} is not accessible: {}", raw, err))?;
			if !meta.is_dir() {
				return Err(anyhow!("allowed directory {} is not a directory", raw));
			}
			let canonical = absolute.canonicalize()
				.map_err(|err| anyhow!("failed to resolve allowed directory {}: {}", raw, err))?;
			if canonical != absolute {
				allowlist.allow(&absolute);
			}
			allowlist.allow(&canonical);
		}
		Ok(Self::new(allowlist, home, cwd))
	}

	pub fn allowlist(&self) -> &Allowlist {
		&self.allowlist
	}

	/// Validates `path` for access.
	///
	/// With `validate_parent` a missing path is accepted as long as its parent
	/// resolves inside an allowed root; the returned path is then the
	/// unresolved absolute path, ready to be created.
	pub fn validate(&self, path: &str, validate_parent: bool) -> Result<ResolvedPath, FsError> {
		let absolute = absolutize(&expand_home(path, self.home.as_deref()), &self.cwd);
		self.ensure_allowed(&absolute)?;
		match std::fs::symlink_metadata(&absolute) {
			Ok(meta) if meta.file_type().is_symlink() => self.resolve_symlink(&absolute, validate_parent),
			Ok(_) => {
				let real = absolute.canonicalize().map_err(|err| FsError::io("resolve", &absolute, err))?;
				self.ensure_allowed(&real)?;
				Ok(ResolvedPath {
					absolute: real,
					exists: true
				})
			}
			Err(err) if err.kind() == io::ErrorKind::NotFound => {
				if !validate_parent {
					return Err(FsError::NotFound(absolute));
				}
				self.validate_missing(absolute)
			}
			Err(err) => Err(FsError::io("inspect", &absolute, err)),
		}
	}

	/// Like [`validate`](Self::validate) but the path must be an existing directory.
	pub fn validate_dir(&self, path: &str) -> Result<ResolvedPath, FsError> {
		let resolved = self.validate(path, false)?;
		if !resolved.absolute.is_dir() {
			return Err(FsError::NotADirectory(resolved.absolute));
		}
		Ok(resolved)
	}

	/// Path relative to the root that owns it, for diff labels and listings.
	pub fn display_path(&self, path: &Path) -> String {
		match self.allowlist.root_for(path) {
			Some(root) => {
				let rel = path.strip_prefix(root).unwrap_or(path);
				let text = rel.to_string_lossy().to_string();
				if text.is_empty() {
					".".to_string()
				}
				else {
					text
				}
			}
			None => path.to_string_lossy().to_string(),
		}
	}

	fn resolve_symlink(&self, link: &Path, validate_parent: bool) -> Result<ResolvedPath, FsError> {
		match link.canonicalize() {
			Ok(real) => {
				self.ensure_allowed(&real)?;
				debug!(link = %link.display(), target = %real.display(), "resolved symlink");
				Ok(ResolvedPath {
					absolute: real,
					exists: true
				})
			}
			Err(err) if err.kind() == io::ErrorKind::NotFound => self.resolve_dangling(link, validate_parent),
			Err(err) => Err(FsError::io("resolve", link, err)),
		}
	}

	/// Writes through a dangling link land on the end of its chain, so every
	/// hop is checked against the allowlist.
	fn resolve_dangling(&self, link: &Path, validate_parent: bool) -> Result<ResolvedPath, FsError> {
		let mut current = link.to_path_buf();
		for _ in 0..MAX_LINK_HOPS {
			let target = std::fs::read_link(&current).map_err(|err| FsError::io("read link", &current, err))?;
			let base = current.parent().unwrap_or(&current);
			let destination = normalize_path(&base.join(target));
			let resolved = resolve_existing_prefix(&destination);
			self.ensure_allowed(&resolved)?;
			let is_link = std::fs::symlink_metadata(&resolved)
				.map(|meta| meta.file_type().is_symlink())
				.unwrap_or(false);
			if is_link {
				debug!(link = %current.display(), next = %resolved.display(), "following dangling link chain");
				current = resolved;
				continue;
			}
			if !validate_parent {
				return Err(FsError::NotFound(link.to_path_buf()));
			}
			return self.validate_missing(resolved);
		}
		let err = io::Error::new(io::ErrorKind::Other, "too many levels of symbolic links");
		Err(FsError::io("resolve", link, err))
	}

	fn validate_missing(&self, absolute: PathBuf) -> Result<ResolvedPath, FsError> {
		let parent = absolute.parent().unwrap_or(&absolute);
		self.ensure_allowed(parent)?;
		let resolved_parent = resolve_existing_prefix(parent);
		self.ensure_allowed(&resolved_parent)?;
		Ok(ResolvedPath {
			absolute,
			exists: false
		})
	}

	fn ensure_allowed(&self, path: &Path) -> Result<(), FsError> {
		if self.allowlist.is_allowed(path) {
			return Ok(());
		}
		warn!(path = %path.display(), "sandbox denied access");
		Err(FsError::PermissionDenied(path.to_path_buf()))
	}
}

/// Expands a leading `~` or `~/` to the home directory.
pub fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
	let Some(home) = home else {
		return PathBuf::from(path);
	};
	if path == "~" {
		return home.to_path_buf();
	}
	match path.strip_prefix("~/") {
		Some(rest) => home.join(rest),
		None => PathBuf::from(path),
	}
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
	if path.is_absolute() {
		normalize_path(path)
	}
	else {
		normalize_path(&cwd.join(path))
	}
}

/// Canonicalizes the longest existing ancestor of `path` and re-appends the
/// components that do not exist yet.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
	let mut ancestor = path.to_path_buf();
	let mut tail: Vec<OsString> = Vec::new();
	loop {
		if let Ok(real) = ancestor.canonicalize() {
			let mut out = real;
			for part in tail.iter().rev() {
				out.push(part);
			}
			return out;
		}
		match ancestor.file_name() {
			Some(name) => tail.push(name.to_os_string()),
			None => return path.to_path_buf(),
		}
		if !ancestor.pop() {
			return path.to_path_buf();
		}
	}
}

/// Lexical `.` / `..` resolution. Never touches the filesystem and never
/// climbs above the root of an absolute path.
pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<OsString> = Vec::new();
	let mut prefix: Option<OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				let can_pop = stack.last()
					.map(|last| last != "..")
					.unwrap_or(false);
				if can_pop {
					stack.pop();
				}
				else if !absolute {
					stack.push(OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Component::RootDir.as_os_str());
	}
	for part in stack {
		out.push(part);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn resolver_for(root: &Path) -> PathResolver {
		let dirs = vec![root.to_string_lossy().to_string()];
		PathResolver::from_directories(&dirs, None, root.to_path_buf()).expect("resolver")
	}

	#[test]
	fn normalize_resolves_dot_segments() {
		assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
		assert_eq!(normalize_path(Path::new("/a/../../..")), PathBuf::from("/"));
		assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
	}

	#[test]
	fn allowlist_prefix_is_component_wise() {
		let mut allowlist = Allowlist::new();
		allowlist.allow("/data");
		assert!(allowlist.is_allowed(Path::new("/data")));
		assert!(allowlist.is_allowed(Path::new("/data/x")));
		assert!(!allowlist.is_allowed(Path::new("/data2/x")));
		assert!(!allowlist.is_allowed(Path::new("/dataX")));
		assert!(!allowlist.is_allowed(Path::new("/data/../etc/passwd")));
	}

	#[test]
	fn allowlist_trailing_separator_is_irrelevant() {
		let mut allowlist = Allowlist::new();
		allowlist.allow("/data/");
		assert!(allowlist.is_allowed(Path::new("/data/x")));
		assert!(!allowlist.is_allowed(Path::new("/database")));
	}

	#[test]
	fn root_for_picks_deepest_root() {
		let mut allowlist = Allowlist::new();
		allowlist.allow("/data");
		allowlist.allow("/data/project");
		assert_eq!(allowlist.root_for(Path::new("/data/project/src/lib.rs")), Some(Path::new("/data/project")));
		assert_eq!(allowlist.root_for(Path::new("/data/other")), Some(Path::new("/data")));
		assert_eq!(allowlist.root_for(Path::new("/srv")), None);
	}

	#[test]
	fn sibling_with_shared_prefix_is_denied() {
		let base = tempfile::tempdir().expect("tempdir");
		let data = base.path().join("data");
		let data2 = base.path().join("data2");
		std::fs::create_dir_all(&data).expect("data");
		std::fs::create_dir_all(&data2).expect("data2");
		std::fs::write(data2.join("x"), "secret").expect("write");
		let resolver = resolver_for(&data);
		let err = resolver.validate(&data2.join("x").to_string_lossy(), false).unwrap_err();
		assert!(matches!(err, FsError::PermissionDenied(_)));
	}

	#[test]
	fn existing_path_resolves_to_real_path() {
		let root = tempfile::tempdir().expect("tempdir");
		let file = root.path().join("notes.txt");
		std::fs::write(&file, "hello").expect("write");
		let resolver = resolver_for(root.path());
		let resolved = resolver.validate("notes.txt", false).expect("valid");
		assert_eq!(resolved.absolute, file.canonicalize().expect("canonical"));
		assert!(resolved.exists);
	}

	#[test]
	fn traversal_out_of_root_is_denied() {
		let base = tempfile::tempdir().expect("tempdir");
		let root = base.path().join("root");
		std::fs::create_dir_all(&root).expect("root");
		std::fs::write(base.path().join("outside.txt"), "x").expect("write");
		let resolver = resolver_for(&root);
		let err = resolver.validate("../outside.txt", false).unwrap_err();
		assert!(matches!(err, FsError::PermissionDenied(_)));
	}

	#[test]
	fn missing_path_without_parent_check_is_not_found() {
		let root = tempfile::tempdir().expect("tempdir");
		let resolver = resolver_for(root.path());
		let err = resolver.validate("missing.txt", false).unwrap_err();
		assert!(matches!(err, FsError::NotFound(_)));
		assert_eq!(err.code(), "FILE_NOT_FOUND");
	}

	#[test]
	fn missing_path_with_parent_check_is_accepted() {
		let root = tempfile::tempdir().expect("tempdir");
		let resolver = resolver_for(root.path());
		let resolved = resolver.validate("new/dir/file.txt", true).expect("valid");
		assert!(!resolved.exists);
		assert!(resolved.absolute.ends_with("new/dir/file.txt"));
	}

	#[test]
	fn missing_path_outside_root_is_denied_even_with_parent_check() {
		let base = tempfile::tempdir().expect("tempdir");
		let root = base.path().join("root");
		std::fs::create_dir_all(&root).expect("root");
		let resolver = resolver_for(&root);
		let err = resolver.validate("../elsewhere/new.txt", true).unwrap_err();
		assert!(matches!(err, FsError::PermissionDenied(_)));
	}

	#[test]
	fn validate_dir_rejects_files() {
		let root = tempfile::tempdir().expect("tempdir");
		std::fs::write(root.path().join("file.txt"), "x").expect("write");
		let resolver = resolver_for(root.path());
		let err = resolver.validate_dir("file.txt").unwrap_err();
		assert!(matches!(err, FsError::NotADirectory(_)));
	}

	#[test]
	fn startup_rejects_missing_and_non_directory_roots() {
		let base = tempfile::tempdir().expect("tempdir");
		let file = base.path().join("plain.txt");
		std::fs::write(&file, "x").expect("write");
		let cwd = base.path().to_path_buf();
		let missing = vec![base.path().join("nope").to_string_lossy().to_string()];
		assert!(PathResolver::from_directories(&missing, None, cwd.clone()).is_err());
		let not_dir = vec![file.to_string_lossy().to_string()];
		assert!(PathResolver::from_directories(&not_dir, None, cwd.clone()).is_err());
		assert!(PathResolver::from_directories(&[], None, cwd).is_err());
	}

	#[test]
	fn home_marker_is_expanded() {
		let home = PathBuf::from("/home/operator");
		assert_eq!(expand_home("~", Some(&home)), home);
		assert_eq!(expand_home("~/notes", Some(&home)), home.join("notes"));
		assert_eq!(expand_home("~other/notes", Some(&home)), PathBuf::from("~other/notes"));
		assert_eq!(expand_home("/abs", Some(&home)), PathBuf::from("/abs"));
	}

	#[test]
	fn home_relative_paths_resolve_inside_home_root() {
		let home = tempfile::tempdir().expect("tempdir");
		std::fs::write(home.path().join("todo.txt"), "x").expect("write");
		let dirs = vec!["~".to_string()];
		let resolver = PathResolver::from_directories(&dirs, Some(home.path().to_path_buf()), PathBuf::from("/")).expect("resolver");
		let resolved = resolver.validate("~/todo.txt", false).expect("valid");
		assert_eq!(resolved.absolute, home.path().join("todo.txt").canonicalize().expect("canonical"));
	}

	#[test]
	fn display_path_is_relative_to_root() {
		let root = tempfile::tempdir().expect("tempdir");
		std::fs::create_dir_all(root.path().join("src")).expect("src");
		std::fs::write(root.path().join("src/lib.rs"), "").expect("write");
		let resolver = resolver_for(root.path());
		let resolved = resolver.validate("src/lib.rs", false).expect("valid");
		assert_eq!(resolver.display_path(&resolved.absolute), "src/lib.rs");
	}

	#[cfg(unix)]
	mod symlinks {
		use super::*;
		use std::os::unix::fs::symlink;

		#[test]
		fn symlink_to_outside_is_denied() {
			let base = tempfile::tempdir().expect("tempdir");
			let root = base.path().join("root");
			let outside = base.path().join("outside");
			std::fs::create_dir_all(&root).expect("root");
			std::fs::create_dir_all(&outside).expect("outside");
			std::fs::write(outside.join("secret.txt"), "secret").expect("write");
			symlink(outside.join("secret.txt"), root.join("link.txt")).expect("symlink");
			let resolver = resolver_for(&root);
			let err = resolver.validate("link.txt", false).unwrap_err();
			assert!(matches!(err, FsError::PermissionDenied(_)));
		}

		#[test]
		fn symlinked_directory_component_is_denied() {
			let base = tempfile::tempdir().expect("tempdir");
			let root = base.path().join("root");
			let outside = base.path().join("outside");
			std::fs::create_dir_all(&root).expect("root");
			std::fs::create_dir_all(&outside).expect("outside");
			std::fs::write(outside.join("secret.txt"), "secret").expect("write");
			symlink(&outside, root.join("escape")).expect("symlink");
			let resolver = resolver_for(&root);
			let err = resolver.validate("escape/secret.txt", false).unwrap_err();
			assert!(matches!(err, FsError::PermissionDenied(_)));
			let err = resolver.validate("escape/new.txt", true).unwrap_err();
			assert!(matches!(err, FsError::PermissionDenied(_)));
		}

		#[test]
		fn symlink_inside_root_returns_target() {
			let root = tempfile::tempdir().expect("tempdir");
			let target = root.path().join("real.txt");
			std::fs::write(&target, "data").expect("write");
			symlink(&target, root.path().join("alias.txt")).expect("symlink");
			let resolver = resolver_for(root.path());
			let resolved = resolver.validate("alias.txt", false).expect("valid");
			assert_eq!(resolved.absolute, target.canonicalize().expect("canonical"));
		}

		#[test]
		fn dangling_symlink_to_outside_is_denied_for_writes() {
			let base = tempfile::tempdir().expect("tempdir");
			let root = base.path().join("root");
			std::fs::create_dir_all(&root).expect("root");
			symlink(base.path().join("planted.txt"), root.join("trap.txt")).expect("symlink");
			let resolver = resolver_for(&root);
			let err = resolver.validate("trap.txt", true).unwrap_err();
			assert!(matches!(err, FsError::PermissionDenied(_)));
		}

		#[test]
		fn dangling_link_chain_is_checked_at_every_hop() {
			let base = tempfile::tempdir().expect("tempdir");
			let root = base.path().join("root");
			std::fs::create_dir_all(&root).expect("root");
			symlink(base.path().join("planted.txt"), root.join("hop2")).expect("hop2");
			symlink(root.join("hop2"), root.join("hop1")).expect("hop1");
			let resolver = resolver_for(&root);
			let err = resolver.validate("hop1", true).unwrap_err();
			assert!(matches!(err, FsError::PermissionDenied(_)));
			assert!(!base.path().join("planted.txt").exists());
		}

		#[test]
		fn dangling_link_chain_inside_root_targets_its_end() {
			let base = tempfile::tempdir().expect("tempdir");
			let root = base.path().join("root");
			std::fs::create_dir_all(&root).expect("root");
			symlink(root.join("final.txt"), root.join("hop2")).expect("hop2");
			symlink(root.join("hop2"), root.join("hop1")).expect("hop1");
			let resolver = resolver_for(&root);
			let resolved = resolver.validate("hop1", true).expect("allowed");
			assert!(!resolved.exists);
			assert_eq!(resolved.absolute.file_name(), Some(std::ffi::OsStr::new("final.txt")));
		}
	}
}
