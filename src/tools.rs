//! Tool requests and their handlers.
//!
//! `tools/call` arguments are decoded into the closed [`ToolCall`] set before
//! anything touches the disk. Each handler validates its paths through the
//! sandbox and returns structured content plus a human readable message.

use crate::config::Config;
use crate::diff::{self, DiffStats};
use crate::edit::{self, EditOperation, EditOptions};
use crate::error::FsError;
use crate::fs::{self, EntryInfo, SearchOptions, SortBy, WriteMode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const TOOL_NAMES: [&str; 12] = [
	"read_file",
	"read_multiple_files",
	"write_file",
	"edit_file",
	"create_directory",
	"list_directory",
	"list_directory_with_size",
	"directory_tree",
	"move_file",
	"search_files",
	"get_file_info",
	"list_allowed_directories",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
	ReadFile(ReadFileArgs),
	ReadMultipleFiles(ReadMultipleFilesArgs),
	WriteFile(WriteFileArgs),
	EditFile(EditFileArgs),
	CreateDirectory(PathArgs),
	ListDirectory(PathArgs),
	ListDirectoryWithSize(ListDirectoryWithSizeArgs),
	DirectoryTree(PathArgs),
	MoveFile(MoveFileArgs),
	SearchFiles(SearchFilesArgs),
	GetFileInfo(PathArgs),
	ListAllowedDirectories(NoArgs),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathArgs {
	pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
	pub path: String,
	#[serde(default)]
	pub start_line: Option<usize>,
	/// 0 reads to the end of the file.
	#[serde(default)]
	pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadMultipleFilesArgs {
	pub paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
	pub path: String,
	pub content: String,
	#[serde(default)]
	pub mode: WriteMode,
	#[serde(default)]
	pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditFileArgs {
	pub path: String,
	pub edits: Vec<EditOperation>,
	#[serde(default)]
	pub dry_run: bool,
	#[serde(default)]
	pub options: EditOptions,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListDirectoryWithSizeArgs {
	pub path: String,
	#[serde(default)]
	pub sort_by: SortBy,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveFileArgs {
	pub source: String,
	pub destination: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchFilesArgs {
	pub path: String,
	pub pattern: String,
	#[serde(default)]
	pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ToolParseError {
	#[error("unknown tool: {0}")]
	UnknownTool(String),
	#[error("invalid arguments for {tool}: {message}")]
	InvalidArguments {
		tool: String,
		message: String,
	},
}

impl ToolCall {
	pub fn parse(name: &str, arguments: Value) -> Result<Self, ToolParseError> {
		if !TOOL_NAMES.contains(&name) {
			return Err(ToolParseError::UnknownTool(name.to_string()));
		}
		let arguments = if arguments.is_null() {
			json!({})
		}
		else {
			arguments
		};
		serde_json::from_value(json!({
			"name": name,
			"arguments": arguments
		})).map_err(|err| ToolParseError::InvalidArguments {
			tool: name.to_string(),
			message: err.to_string()
		})
	}

	pub fn name(&self) -> &'static str {
		match self {
			ToolCall::ReadFile(_) => "read_file",
			ToolCall::ReadMultipleFiles(_) => "read_multiple_files",
			ToolCall::WriteFile(_) => "write_file",
			ToolCall::EditFile(_) => "edit_file",
			ToolCall::CreateDirectory(_) => "create_directory",
			ToolCall::ListDirectory(_) => "list_directory",
			ToolCall::ListDirectoryWithSize(_) => "list_directory_with_size",
			ToolCall::DirectoryTree(_) => "directory_tree",
			ToolCall::MoveFile(_) => "move_file",
			ToolCall::SearchFiles(_) => "search_files",
			ToolCall::GetFileInfo(_) => "get_file_info",
			ToolCall::ListAllowedDirectories(_) => "list_allowed_directories",
		}
	}
}

/// A diff produced by `write_file` or `edit_file`, kept for the audit log.
#[derive(Clone, Debug)]
pub struct DiffRecord {
	pub tool: &'static str,
	pub path: String,
	pub diff: String,
}

#[derive(Debug)]
pub struct ToolOutput {
	pub structured: Value,
	pub message: String,
	pub record: Option<DiffRecord>,
}

impl ToolOutput {
	fn new(structured: Value, message: impl Into<String>) -> Self {
		Self {
			structured,
			message: message.into(),
			record: None
		}
	}
}

pub async fn execute(config: &Config, call: ToolCall) -> Result<ToolOutput, FsError> {
	match call {
		ToolCall::ReadFile(args) => read_file(config, args).await,
		ToolCall::ReadMultipleFiles(args) => read_multiple_files(config, args).await,
		ToolCall::WriteFile(args) => write_file(config, args).await,
		ToolCall::EditFile(args) => edit_file(config, args).await,
		ToolCall::CreateDirectory(args) => create_directory(config, args).await,
		ToolCall::ListDirectory(args) => list_directory(config, args).await,
		ToolCall::ListDirectoryWithSize(args) => list_directory_with_size(config, args).await,
		ToolCall::DirectoryTree(args) => directory_tree(config, args).await,
		ToolCall::MoveFile(args) => move_file(config, args).await,
		ToolCall::SearchFiles(args) => search_files(config, args),
		ToolCall::GetFileInfo(args) => get_file_info(config, args).await,
		ToolCall::ListAllowedDirectories(_) => Ok(list_allowed_directories(config)),
	}
}

async fn read_file(config: &Config, args: ReadFileArgs) -> Result<ToolOutput, FsError> {
	let start_line = args.start_line.unwrap_or(1).max(1);
	let limit = match args.limit {
		None | Some(0) => usize::MAX,
		Some(limit) => limit,
	};
	let value = read_window(config, &args.path, start_line, limit, config.read_max_bytes).await?;
	let content = value["content"].as_str().unwrap_or_default().to_string();
	let message = if value["count"].as_u64() == Some(0) {
		format!(
			"No lines returned from {} (start line {}, total {}).",
			value["path"].as_str().unwrap_or_default(),
			start_line,
			value["total"]
		)
	}
	else {
		content
	};
	Ok(ToolOutput::new(value, message))
}

async fn read_window(
	config: &Config,
	path: &str,
	start_line: usize,
	limit: usize,
	max_bytes: Option<usize>) -> Result<Value, FsError> {
	let resolved = config.resolver.validate(path, false)?;
	let text = fs::read_text(&resolved.absolute).await?;
	let window = fs::line_window(
		&text,
		start_line,
		limit,
		max_bytes.unwrap_or(usize::MAX),
		config.read_max_line_bytes.unwrap_or(usize::MAX)
	);
	let truncated_reason = if window.reasons.is_empty() {
		Value::Null
	}
	else {
		Value::String(window.reasons.join(","))
	};
	Ok(json!({
		"path": config.resolver.display_path(&resolved.absolute),
		"content": window.content,
		"count": window.count,
		"total": window.total,
		"start_line": start_line,
		"truncated": window.truncated,
		"truncated_reason": truncated_reason
	}))
}

async fn read_multiple_files(config: &Config, args: ReadMultipleFilesArgs) -> Result<ToolOutput, FsError> {
	let budget = config.read_max_bytes.map(|bytes| (bytes / args.paths.len().max(1)).max(1));
	let mut files = Vec::with_capacity(args.paths.len());
	let mut sections = Vec::with_capacity(args.paths.len());
	for path in &args.paths {
		match read_window(config, path, 1, usize::MAX, budget).await {
			Ok(value) => {
				sections.push(format!("{}:\n{}", path, value["content"].as_str().unwrap_or_default()));
				files.push(value);
			}
			Err(err) => {
				debug!(path = %path, error = %err, "read_multiple_files entry failed");
				sections.push(format!("Error reading file {}: {}", path, err));
				files.push(json!({
					"path": path,
					"code": err.code(),
					"error": err.to_string()
				}));
			}
		}
	}
	let structured = json!({
		"files": files,
		"count": args.paths.len()
	});
	Ok(ToolOutput::new(structured, sections.join("\n---\n")))
}

async fn write_file(config: &Config, args: WriteFileArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate(&args.path, true)?;
	let path = resolved.absolute;
	let existing = if resolved.exists {
		match fs::read_text(&path).await {
			Ok(text) => text,
			Err(FsError::Encoding(_)) if args.mode == WriteMode::Overwrite => String::new(),
			Err(err) => return Err(err),
		}
	}
	else {
		String::new()
	};
	let updated = fs::compose_write(&existing, &args.content, args.mode);
	let label = config.resolver.display_path(&path);
	let patch = diff::render(&existing, &updated, &label);
	let stats = diff::stats(&existing, &updated);
	if !args.dry_run {
		fs::write_text(&path, &updated).await?;
		info!(path = %path.display(), mode = ?args.mode, "file written");
	}
	let message = change_message(&label, &patch, args.dry_run, "Wrote");
	let record = diff_record("write_file", &label, &patch);
	let structured = json!({
		"path": label,
		"mode": args.mode,
		"dry_run": args.dry_run,
		"created": !resolved.exists,
		"diff": patch,
		"stats": stats
	});
	Ok(ToolOutput {
		record,
		structured,
		message
	})
}

async fn edit_file(config: &Config, args: EditFileArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate(&args.path, false)?;
	let path = resolved.absolute;
	let original = edit::normalize_line_endings(&fs::read_text(&path).await?);
	let outcome = edit::apply_edits(&original, &args.edits, args.options);
	let failed = outcome.failed_indices();
	if !failed.is_empty() {
		return Err(FsError::NoMatch {
			failed,
			results: outcome.results
		});
	}
	let label = config.resolver.display_path(&path);
	let (patch, stats) = if outcome.changed {
		(diff::render(&original, &outcome.content, &label), diff::stats(&original, &outcome.content))
	}
	else {
		(String::new(), DiffStats::default())
	};
	if outcome.changed && !args.dry_run {
		fs::write_text(&path, &outcome.content).await?;
		info!(path = %path.display(), edits = args.edits.len(), "file edited");
	}
	let message = if outcome.changed {
		change_message(&label, &patch, args.dry_run, "Edited")
	}
	else if outcome.results.iter().any(|result| result.is_already_applied()) {
		format!("No changes needed for {}: edits already applied.", label)
	}
	else {
		format!("No changes needed for {}.", label)
	};
	let record = diff_record("edit_file", &label, &patch);
	let structured = json!({
		"path": label,
		"dry_run": args.dry_run,
		"changed": outcome.changed,
		"match_results": outcome.results,
		"diff": patch,
		"stats": stats
	});
	Ok(ToolOutput {
		record,
		structured,
		message
	})
}

fn change_message(label: &str, patch: &str, dry_run: bool, verb: &str) -> String {
	let head = if dry_run {
		format!("Previewed changes for {} (dry run, nothing written).", label)
	}
	else {
		format!("{} {}.", verb, label)
	};
	if patch.is_empty() {
		head
	}
	else {
		format!("{}\n\n{}", head, patch)
	}
}

fn diff_record(tool: &'static str, label: &str, patch: &str) -> Option<DiffRecord> {
	if patch.is_empty() {
		return None;
	}
	Some(DiffRecord {
		tool,
		path: label.to_string(),
		diff: patch.to_string()
	})
}

async fn create_directory(config: &Config, args: PathArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate(&args.path, true)?;
	let path = resolved.absolute;
	if resolved.exists && !path.is_dir() {
		return Err(FsError::NotADirectory(path));
	}
	tokio::fs::create_dir_all(&path).await.map_err(|err| FsError::io("create", &path, err))?;
	let label = config.resolver.display_path(&path);
	let message = if resolved.exists {
		format!("Directory {} already exists.", label)
	}
	else {
		format!("Created directory {}.", label)
	};
	let structured = json!({
		"path": label,
		"created": !resolved.exists
	});
	Ok(ToolOutput::new(structured, message))
}

fn entry_kind(entry: &EntryInfo) -> &'static str {
	if entry.is_symlink {
		"symlink"
	}
	else if entry.is_dir {
		"directory"
	}
	else {
		"file"
	}
}

fn entry_tag(entry: &EntryInfo) -> &'static str {
	if entry.is_dir {
		"[DIR]"
	}
	else {
		"[FILE]"
	}
}

async fn list_directory(config: &Config, args: PathArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate_dir(&args.path)?;
	let entries = fs::list_entries(&resolved.absolute).await?;
	let lines: Vec<String> = entries.iter()
		.map(|entry| format!("{} {}", entry_tag(entry), entry.name))
		.collect();
	let items: Vec<Value> = entries.iter()
		.map(|entry| json!({
			"name": entry.name,
			"type": entry_kind(entry)
		}))
		.collect();
	let structured = json!({
		"path": config.resolver.display_path(&resolved.absolute),
		"entries": items,
		"count": entries.len()
	});
	Ok(ToolOutput::new(structured, lines.join("\n")))
}

async fn list_directory_with_size(config: &Config, args: ListDirectoryWithSizeArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate_dir(&args.path)?;
	let mut entries = fs::list_entries(&resolved.absolute).await?;
	fs::sort_entries(&mut entries, args.sort_by);
	let mut lines = Vec::with_capacity(entries.len() + 3);
	for entry in &entries {
		let size = if entry.is_dir {
			String::new()
		}
		else {
			format!("{:>10}", fs::format_size(entry.size))
		};
		lines.push(format!("{} {:<30}{}", entry_tag(entry), entry.name, size));
	}
	let total_files = entries.iter().filter(|entry| !entry.is_dir).count();
	let total_dirs = entries.len() - total_files;
	let total_size: u64 = entries.iter()
		.filter(|entry| !entry.is_dir)
		.map(|entry| entry.size)
		.sum();
	lines.push(String::new());
	lines.push(format!("Total: {} files, {} directories", total_files, total_dirs));
	lines.push(format!("Combined size: {}", fs::format_size(total_size)));
	let items: Vec<Value> = entries.iter()
		.map(|entry| json!({
			"name": entry.name,
			"type": entry_kind(entry),
			"size": entry.size
		}))
		.collect();
	let structured = json!({
		"path": config.resolver.display_path(&resolved.absolute),
		"entries": items,
		"total_files": total_files,
		"total_dirs": total_dirs,
		"total_size": total_size
	});
	Ok(ToolOutput::new(structured, lines.join("\n")))
}

async fn directory_tree(config: &Config, args: PathArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate_dir(&args.path)?;
	let tree = fs::build_tree(resolved.absolute.clone()).await?;
	let tree = json!(tree);
	let message = format!("{:#}", tree);
	let structured = json!({
		"path": config.resolver.display_path(&resolved.absolute),
		"tree": tree
	});
	Ok(ToolOutput::new(structured, message))
}

async fn move_file(config: &Config, args: MoveFileArgs) -> Result<ToolOutput, FsError> {
	let source = config.resolver.validate(&args.source, false)?;
	let destination = config.resolver.validate(&args.destination, true)?;
	if is_root(config, &source.absolute) {
		return Err(FsError::RootProtected {
			action: "moved",
			path: source.absolute
		});
	}
	fs::move_path(&source.absolute, &destination.absolute).await?;
	info!(from = %source.absolute.display(), to = %destination.absolute.display(), "path moved");
	let from = config.resolver.display_path(&source.absolute);
	let to = config.resolver.display_path(&destination.absolute);
	let message = format!("Moved {} to {}.", from, to);
	let structured = json!({
		"source": from,
		"destination": to
	});
	Ok(ToolOutput::new(structured, message))
}

fn is_root(config: &Config, path: &Path) -> bool {
	config.resolver
		.allowlist()
		.roots()
		.iter()
		.any(|root| root == path)
}

fn search_files(config: &Config, args: SearchFilesArgs) -> Result<ToolOutput, FsError> {
	let root = config.resolver.validate_dir(&args.path)?;
	let options = SearchOptions {
		pattern: args.pattern,
		exclude: args.exclude_patterns,
		limit: config.search_limit
	};
	let result = fs::search(&root.absolute, &options, &config.resolver)?;
	let matches: Vec<String> = result.matches
		.iter()
		.map(|path| path.to_string_lossy().to_string())
		.collect();
	let count = matches.len();
	let message = if matches.is_empty() {
		"No matches found".to_string()
	}
	else if result.truncated {
		format!(
			"{}\n\nResults truncated at limit {}.",
			matches.join("\n"),
			options.limit.unwrap_or(count)
		)
	}
	else {
		matches.join("\n")
	};
	let structured = json!({
		"path": config.resolver.display_path(&root.absolute),
		"pattern": options.pattern,
		"count": count,
		"matches": matches,
		"truncated": result.truncated,
		"limit": options.limit
	});
	Ok(ToolOutput::new(structured, message))
}

async fn get_file_info(config: &Config, args: PathArgs) -> Result<ToolOutput, FsError> {
	let resolved = config.resolver.validate(&args.path, false)?;
	let info = fs::file_info(&resolved.absolute).await?;
	let mut structured = json!(info);
	let lines: Vec<String> = structured.as_object()
		.map(|fields| {
			fields.iter()
				.map(|(key, value)| match value {
					Value::String(text) => format!("{}: {}", key, text),
					other => format!("{}: {}", key, other),
				})
				.collect()
		})
		.unwrap_or_default();
	if let Some(fields) = structured.as_object_mut() {
		fields.insert("path".to_string(), json!(config.resolver.display_path(&resolved.absolute)));
	}
	Ok(ToolOutput::new(structured, lines.join("\n")))
}

fn list_allowed_directories(config: &Config) -> ToolOutput {
	let roots: Vec<String> = config.resolver
		.allowlist()
		.roots()
		.iter()
		.map(|root| root.to_string_lossy().to_string())
		.collect();
	let message = format!("Allowed directories:\n{}", roots.join("\n"));
	ToolOutput::new(json!({ "directories": roots }), message)
}

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
	json!({
		"name": name,
		"description": description,
		"annotations": {
			"group": "filesystem"
		},
		"inputSchema": {
			"type": "object",
			"properties": properties,
			"required": required,
			"additionalProperties": false
		}
	})
}

fn path_schema() -> Value {
	json!({ "type": "string", "description": "Path inside an allowed directory. `~` expands to the home directory." })
}

pub fn tool_definitions() -> Vec<Value> {
	vec![
		tool(
			"read_file",
			"read a UTF-8 text file, optionally a window of lines",
			json!({
				"path": path_schema(),
				"start_line": { "type": "integer", "minimum": 1, "description": "1-based first line." },
				"limit": { "type": "integer", "minimum": 0, "description": "Max lines to return. 0 reads to the end." }
			}),
			&["path"]
		),
		tool(
			"read_multiple_files",
			"read several files at once; failures are reported per file",
			json!({
				"paths": { "type": "array", "items": { "type": "string" } }
			}),
			&["paths"]
		),
		tool(
			"write_file",
			"create or replace a file; append and prepend modes keep existing content",
			json!({
				"path": path_schema(),
				"content": { "type": "string" },
				"mode": { "type": "string", "enum": ["overwrite", "append", "prepend"], "default": "overwrite" },
				"dry_run": { "type": "boolean", "default": false, "description": "Return the diff without writing." }
			}),
			&["path", "content"]
		),
		tool(
			"edit_file",
			"replace blocks of text; nothing is written unless every edit matches",
			json!({
				"path": path_schema(),
				"edits": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"old_text": { "type": "string", "minLength": 1, "maxLength": edit::MAX_EDIT_TEXT_CHARS },
							"new_text": { "type": "string", "minLength": 1, "maxLength": edit::MAX_EDIT_TEXT_CHARS }
						},
						"required": ["old_text", "new_text"],
						"additionalProperties": false
					}
				},
				"dry_run": { "type": "boolean", "default": false, "description": "Return the diff without writing." },
				"options": {
					"type": "object",
					"properties": {
						"preserve_indentation": { "type": "boolean", "default": true },
						"normalize_whitespace": { "type": "boolean", "default": true }
					},
					"additionalProperties": false
				}
			}),
			&["path", "edits"]
		),
		tool(
			"create_directory",
			"create a directory and any missing parents",
			json!({ "path": path_schema() }),
			&["path"]
		),
		tool(
			"list_directory",
			"list entries of a directory marked [DIR] or [FILE]",
			json!({ "path": path_schema() }),
			&["path"]
		),
		tool(
			"list_directory_with_size",
			"list entries of a directory with sizes and totals",
			json!({
				"path": path_schema(),
				"sort_by": { "type": "string", "enum": ["name", "size"], "default": "name" }
			}),
			&["path"]
		),
		tool(
			"directory_tree",
			"recursive JSON tree of a directory; symlinks are not followed",
			json!({ "path": path_schema() }),
			&["path"]
		),
		tool(
			"move_file",
			"move or rename a file or directory (fails if destination exists)",
			json!({
				"source": path_schema(),
				"destination": path_schema()
			}),
			&["source", "destination"]
		),
		tool(
			"search_files",
			"find entries whose name contains a pattern, ignoring case",
			json!({
				"path": path_schema(),
				"pattern": { "type": "string" },
				"exclude_patterns": { "type": "array", "items": { "type": "string" }, "description": "Glob patterns matched against relative paths, absolute paths and entry names." }
			}),
			&["path", "pattern"]
		),
		tool(
			"get_file_info",
			"size, timestamps, type and permissions of a path",
			json!({ "path": path_schema() }),
			&["path"]
		),
		tool(
			"list_allowed_directories",
			"list the directories this server may access",
			json!({}),
			&[]
		),
	]
}
