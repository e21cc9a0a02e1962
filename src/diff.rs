//! Unified diff rendering for previews and the audit log.

use serde::Serialize;
use similar::{ChangeTag, TextDiff};

const CONTEXT_RADIUS: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
	pub added: usize,
	pub removed: usize,
}

/// Renders `original` → `modified` with `a/<label>` / `b/<label>` headers.
/// Identical inputs render as an empty string.
pub fn render(original: &str, modified: &str, label: &str) -> String {
	let diff = TextDiff::from_lines(original, modified);
	diff.unified_diff()
		.context_radius(CONTEXT_RADIUS)
		.header(&format!("a/{}", label), &format!("b/{}", label))
		.to_string()
}

pub fn stats(original: &str, modified: &str) -> DiffStats {
	let diff = TextDiff::from_lines(original, modified);
	diff.iter_all_changes()
		.fold(DiffStats::default(), |mut stats, change| {
			match change.tag() {
				ChangeTag::Insert => stats.added += 1,
				ChangeTag::Delete => stats.removed += 1,
				ChangeTag::Equal => {}
			}
			stats
		})
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Minimal unified diff applier for newline-terminated inputs.
	fn apply_patch(original: &str, patch: &str) -> String {
		let source: Vec<&str> = original.split_inclusive('\n').collect();
		let mut out = String::new();
		let mut cursor = 0usize;
		for line in patch.split_inclusive('\n') {
			if line.starts_with("---") || line.starts_with("+++") {
				continue;
			}
			if let Some(header) = line.strip_prefix("@@ -") {
				let old_start: usize = header.split(|c| c == ',' || c == ' ')
					.next()
					.and_then(|value| value.parse().ok())
					.expect("hunk start");
				let target = old_start.saturating_sub(1);
				while cursor < target {
					out.push_str(source[cursor]);
					cursor += 1;
				}
				continue;
			}
			match line.chars().next() {
				Some(' ') => {
					out.push_str(&line[1..]);
					cursor += 1;
				}
				Some('-') => cursor += 1,
				Some('+') => out.push_str(&line[1..]),
				_ => {}
			}
		}
		while cursor < source.len() {
			out.push_str(source[cursor]);
			cursor += 1;
		}
		out
	}

	#[test]
	fn renders_git_style_headers() {
		let diff = render("one\ntwo\nthree\n", "one\nTWO\nthree\n", "src/notes.txt");
		assert!(diff.starts_with("--- a/src/notes.txt\n+++ b/src/notes.txt\n"));
		assert!(diff.contains("@@ -1,3 +1,3 @@\n"));
		assert!(diff.contains("-two\n"));
		assert!(diff.contains("+TWO\n"));
		assert!(diff.ends_with('\n'));
	}

	#[test]
	fn identical_inputs_render_nothing() {
		assert_eq!(render("same\n", "same\n", "x.txt"), "");
		assert_eq!(stats("same\n", "same\n"), DiffStats::default());
	}

	#[test]
	fn rendering_is_deterministic() {
		let a = "a\nb\nc\nd\ne\nf\ng\nh\n";
		let b = "a\nB\nc\nd\ne\nf\nG\nh\n";
		assert_eq!(render(a, b, "f"), render(a, b, "f"));
	}

	#[test]
	fn applying_the_patch_reproduces_the_target() {
		let original = (1..=30).map(|n| format!("line {}\n", n)).collect::<String>();
		let modified = original.replace("line 3\n", "line three\n")
			.replace("line 20\n", "")
			.replace("line 28\n", "line 28\ninserted\n");
		let patch = render(&original, &modified, "big.txt");
		assert_eq!(patch.matches("@@ ").count(), 3);
		assert_eq!(apply_patch(&original, &patch), modified);
	}

	#[test]
	fn stats_count_changed_lines() {
		let stats = stats("a\nb\nc\n", "a\nB\nc\nd\n");
		assert_eq!(stats, DiffStats {
			added: 2,
			removed: 1
		});
	}
}
