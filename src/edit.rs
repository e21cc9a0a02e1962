//! Block replacement engine behind `edit_file`.
//!
//! Edits are applied one after another to the progressively modified text.
//! A failed edit does not stop the batch; the caller gets a [`MatchResult`]
//! for every edit and decides whether to commit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_EDIT_TEXT_CHARS: usize = 1000;

const NO_CHANGE_NEEDED: &str = "No change needed - text already matches desired state";
const ALREADY_APPLIED: &str = "Edit already applied - content already in desired state";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEditOperation {
	old_text: String,
	new_text: String,
}

/// One `old_text` → `new_text` replacement. Both sides are non-empty and at
/// most [`MAX_EDIT_TEXT_CHARS`] characters long.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEditOperation")]
pub struct EditOperation {
	old_text: String,
	new_text: String,
}

impl EditOperation {
	pub fn new(old_text: impl Into<String>, new_text: impl Into<String>) -> Result<Self, String> {
		let old_text = old_text.into();
		let new_text = new_text.into();
		check_bounds("old_text", &old_text)?;
		check_bounds("new_text", &new_text)?;
		Ok(Self {
			old_text,
			new_text
		})
	}

	pub fn old_text(&self) -> &str {
		&self.old_text
	}

	pub fn new_text(&self) -> &str {
		&self.new_text
	}
}

impl TryFrom<RawEditOperation> for EditOperation {
	type Error = String;

	fn try_from(raw: RawEditOperation) -> Result<Self, Self::Error> {
		EditOperation::new(raw.old_text, raw.new_text)
	}
}

fn check_bounds(field: &str, text: &str) -> Result<(), String> {
	if text.is_empty() {
		return Err(format!("{} must not be empty", field));
	}
	let chars = text.chars().count();
	if chars > MAX_EDIT_TEXT_CHARS {
		return Err(format!("{} is {} characters; the limit is {}", field, chars, MAX_EDIT_TEXT_CHARS));
	}
	Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditOptions {
	pub preserve_indentation: bool,
	/// Allows a whitespace-insensitive line match when no exact match exists.
	pub normalize_whitespace: bool,
}

impl Default for EditOptions {
	fn default() -> Self {
		Self {
			preserve_indentation: true,
			normalize_whitespace: true
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
	Success,
	Skipped,
	Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchResult {
	pub edit_index: usize,
	pub matched: bool,
	/// 0-based line of the match start, in LF-normalized lines.
	pub line_index: Option<usize>,
	pub line_count: usize,
	pub match_type: MatchType,
	pub details: String,
}

impl MatchResult {
	fn skipped(edit_index: usize, details: &str) -> Self {
		Self {
			edit_index,
			matched: true,
			line_index: None,
			line_count: 0,
			match_type: MatchType::Skipped,
			details: details.to_string()
		}
	}

	fn success(edit_index: usize, line_index: usize, line_count: usize, details: &str) -> Self {
		Self {
			edit_index,
			matched: true,
			line_index: Some(line_index),
			line_count,
			match_type: MatchType::Success,
			details: details.to_string()
		}
	}

	fn failed(edit_index: usize) -> Self {
		Self {
			edit_index,
			matched: false,
			line_index: None,
			line_count: 0,
			match_type: MatchType::Failed,
			details: "No exact match found".to_string()
		}
	}

	pub fn is_already_applied(&self) -> bool {
		self.match_type == MatchType::Skipped && self.details.contains("already applied")
	}
}

#[derive(Clone, Debug)]
pub struct EditOutcome {
	/// Final text, LF line endings.
	pub content: String,
	pub results: Vec<MatchResult>,
	pub changed: bool,
}

impl EditOutcome {
	pub fn failed_indices(&self) -> Vec<usize> {
		self.results
			.iter()
			.filter(|result| result.match_type == MatchType::Failed)
			.map(|result| result.edit_index)
			.collect()
	}
}

pub fn normalize_line_endings(text: &str) -> String {
	text.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn apply_edits(content: &str, edits: &[EditOperation], options: EditOptions) -> EditOutcome {
	let mut content = normalize_line_endings(content);
	let mut results = Vec::with_capacity(edits.len());
	let mut changed = false;
	for (index, edit) in edits.iter().enumerate() {
		let old = normalize_line_endings(edit.old_text());
		let new = normalize_line_endings(edit.new_text());
		if old == new {
			results.push(MatchResult::skipped(index, NO_CHANGE_NEEDED));
			continue;
		}
		if content.contains(&new) && !content.contains(&old) {
			results.push(MatchResult::skipped(index, ALREADY_APPLIED));
			continue;
		}
		if options.normalize_whitespace
			&& find_trimmed_lines(&content, &new).is_some()
			&& find_trimmed_lines(&content, &old).is_none() {
			results.push(MatchResult::skipped(index, ALREADY_APPLIED));
			continue;
		}
		if let Some(start) = content.find(&old) {
			let line_index = content[..start].matches('\n').count();
			let line_count = old.matches('\n').count() + 1;
			let replacement = if options.preserve_indentation {
				preserve_indentation(&old, &new)
			}
			else {
				new
			};
			if replacement == content[start..start + old.len()] {
				results.push(MatchResult::skipped(index, NO_CHANGE_NEEDED));
				continue;
			}
			content.replace_range(start..start + old.len(), &replacement);
			changed = true;
			results.push(MatchResult::success(index, line_index, line_count, "Exact match found"));
			continue;
		}
		if options.normalize_whitespace {
			if let Some((line_index, line_count, updated)) = replace_trimmed_lines(&content, &old, &new, options) {
				if updated == content {
					results.push(MatchResult::skipped(index, NO_CHANGE_NEEDED));
					continue;
				}
				content = updated;
				changed = true;
				results.push(MatchResult::success(index, line_index, line_count, "Whitespace-insensitive match found"));
				continue;
			}
		}
		results.push(MatchResult::failed(index));
	}
	EditOutcome {
		content,
		results,
		changed
	}
}

/// Finds the first run of whole lines whose trimmed text equals the trimmed
/// lines of `old` and swaps them for `new`.
fn replace_trimmed_lines(content: &str, old: &str, new: &str, options: EditOptions) -> Option<(usize, usize, String)> {
	let start = find_trimmed_lines(content, old)?;
	let content_lines: Vec<&str> = content.split('\n').collect();
	let old_count = old.split('\n').count();
	let end = start + old_count;
	let replacement = if options.preserve_indentation {
		preserve_indentation(&content_lines[start..end].join("\n"), new)
	}
	else {
		new.to_string()
	};
	let mut out: Vec<&str> = Vec::with_capacity(content_lines.len());
	out.extend_from_slice(&content_lines[..start]);
	out.extend(replacement.split('\n'));
	out.extend_from_slice(&content_lines[end..]);
	Some((start, old_count, out.join("\n")))
}

/// First line at which the lines of `needle` appear in `content`, comparing
/// trimmed text. Blank-only needles never match.
fn find_trimmed_lines(content: &str, needle: &str) -> Option<usize> {
	let needle_lines: Vec<&str> = needle.split('\n').collect();
	if needle_lines.iter().all(|line| line.trim().is_empty()) {
		return None;
	}
	let content_lines: Vec<&str> = content.split('\n').collect();
	if needle_lines.len() > content_lines.len() {
		return None;
	}
	(0..=content_lines.len() - needle_lines.len()).find(|&start| {
		content_lines[start..start + needle_lines.len()]
			.iter()
			.map(|line| line.trim())
			.eq(needle_lines.iter().map(|line| line.trim()))
	})
}

fn line_indentation(line: &str) -> &str {
	let trimmed = line.trim_start();
	&line[..line.len() - trimmed.len()]
}

fn is_list_edit(old: &str, new: &str) -> bool {
	let has_marker = |text: &str| text.contains("- ") || text.contains("* ");
	has_marker(old) && has_marker(new)
}

/// Re-indents `new` so it sits where `old` was.
///
/// Lines that have a non-blank counterpart in `old` take its indentation.
/// Extra lines keep their offset relative to the closest earlier line whose
/// old and new indentation are both known. Markdown list edits are returned
/// untouched.
pub fn preserve_indentation(old: &str, new: &str) -> String {
	if is_list_edit(old, new) {
		return new.to_string();
	}
	let old_lines: Vec<&str> = old.split('\n').collect();
	let new_lines: Vec<&str> = new.split('\n').collect();
	let base_indent = old_lines.first()
		.filter(|line| !line.trim().is_empty())
		.map(|line| line_indentation(line))
		.unwrap_or("");
	let old_indents = indent_map(&old_lines);
	let new_indents = indent_map(&new_lines);
	let first_new_indent_len = new_indents.get(&0).map(|indent| indent.chars().count()).unwrap_or(0);
	let mut out: Vec<String> = Vec::with_capacity(new_lines.len());
	for (index, line) in new_lines.iter().enumerate() {
		if line.trim().is_empty() {
			out.push(String::new());
			continue;
		}
		let own_indent = new_indents.get(&index).map(String::as_str).unwrap_or("");
		let target = if let Some(old_indent) = old_indents.get(&index) {
			old_indent.clone()
		}
		else if index == 0 {
			base_indent.to_string()
		}
		else if first_new_indent_len > 0 {
			relative_indent(index, own_indent.chars().count(), &old_indents, &new_indents)
				.unwrap_or_else(|| base_indent.to_string())
		}
		else {
			own_indent.to_string()
		};
		out.push(format!("{}{}", target, line.trim_start()));
	}
	out.join("\n")
}

fn indent_map(lines: &[&str]) -> HashMap<usize, String> {
	lines.iter()
		.enumerate()
		.filter(|(_, line)| !line.trim().is_empty())
		.map(|(index, line)| (index, line_indentation(line).to_string()))
		.collect()
}

fn relative_indent(
	index: usize,
	current_len: usize,
	old_indents: &HashMap<usize, String>,
	new_indents: &HashMap<usize, String>) -> Option<String> {
	(0..index).rev().find_map(|prev| {
		let prev_old = old_indents.get(&prev)?;
		let prev_new_len = new_indents.get(&prev)?.chars().count();
		if prev_new_len > current_len {
			return None;
		}
		Some(format!("{}{}", prev_old, " ".repeat(current_len - prev_new_len)))
	})
}
