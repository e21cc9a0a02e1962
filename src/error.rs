//! Domain errors returned by the sandbox, the edit engine and the tool handlers.

use crate::edit::MatchResult;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures a tool handler can report back to the caller.
///
/// None of these are fatal to the server: every variant is turned into a tool
/// error response carrying [`FsError::code`].
#[derive(Debug, Error)]
pub enum FsError {
	#[error("path not found: {}", .0.display())]
	NotFound(PathBuf),

	#[error("not a directory: {}", .0.display())]
	NotADirectory(PathBuf),

	/// The path (or the target of a symlink) lies outside every allowed root.
	#[error("access denied - path outside allowed directories: {}", .0.display())]
	PermissionDenied(PathBuf),

	#[error("{} is not valid UTF-8 text", .0.display())]
	Encoding(PathBuf),

	/// At least one edit in a batch could not be located. Holds the result of
	/// every edit so the caller can see which ones failed.
	#[error("failed to find a match for edit(s) {}", format_indices(.failed))]
	NoMatch {
		failed: Vec<usize>,
		results: Vec<MatchResult>,
	},

	#[error("failed to write {}: {source}", .path.display())]
	WriteFailure {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("target exists: {}", .0.display())]
	TargetExists(PathBuf),

	#[error("allowed root cannot be {action}: {}", .path.display())]
	RootProtected {
		action: &'static str,
		path: PathBuf,
	},

	#[error("failed to {action} {}: {source}", .path.display())]
	Io {
		action: &'static str,
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

impl FsError {
	/// Wraps an I/O error, promoting the kinds that have a dedicated variant.
	pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
		let path = path.into();
		match source.kind() {
			io::ErrorKind::NotFound => FsError::NotFound(path),
			io::ErrorKind::InvalidData => FsError::Encoding(path),
			_ => FsError::Io {
				action,
				path,
				source
			},
		}
	}

	pub fn code(&self) -> &'static str {
		match self {
			FsError::NotFound(_) => "FILE_NOT_FOUND",
			FsError::NotADirectory(_) => "NOT_A_DIRECTORY",
			FsError::PermissionDenied(_) => "PATH_OUTSIDE_ROOT",
			FsError::Encoding(_) => "ENCODING_ERROR",
			FsError::NoMatch { .. } => "NO_MATCH",
			FsError::WriteFailure { .. } => "WRITE_FAILED",
			FsError::TargetExists(_) => "TARGET_EXISTS",
			FsError::RootProtected { .. } => "ROOT_PROTECTED",
			FsError::Io { source, .. } => match source.kind() {
				io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
				io::ErrorKind::AlreadyExists => "TARGET_EXISTS",
				_ => "EXECUTION_ERROR",
			},
		}
	}
}

fn format_indices(indices: &[usize]) -> String {
	indices.iter()
		.map(|index| index.to_string())
		.collect::<Vec<_>>()
		.join(", ")
}
