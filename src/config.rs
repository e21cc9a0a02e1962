//! Startup configuration: CLI flags, `MCP_*` environment variables and an
//! optional JSON file, applied in that order.

use crate::sandbox::PathResolver;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::path::PathBuf;

const DEFAULT_READ_MAX_BYTES: usize = 50 * 1024;
const DEFAULT_READ_MAX_LINE_BYTES: usize = 25 * 1024;
const DEFAULT_SEARCH_LIMIT: usize = 200;
const DEFAULT_AUDIT_LOG_SIZE: usize = 100;

/// Runtime configuration. Read-only once the server loop starts.
#[derive(Clone, Debug)]
pub struct Config {
	pub resolver: PathResolver,
	pub read_max_bytes: Option<usize>,
	pub read_max_line_bytes: Option<usize>,
	pub search_limit: Option<usize>,
	pub audit_log_size: Option<usize>,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

/// Raw settings before the allowed directories are resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Settings {
	allowed_directories: Vec<String>,
	read_max_bytes: Option<usize>,
	read_max_line_bytes: Option<usize>,
	search_limit: Option<usize>,
	audit_log_size: Option<usize>,
	otel_enabled: bool,
	otel_endpoint: String,
	otel_service_name: String,
	config_path: Option<String>,
	print_schema: bool,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			allowed_directories: Vec::new(),
			read_max_bytes: Some(DEFAULT_READ_MAX_BYTES),
			read_max_line_bytes: Some(DEFAULT_READ_MAX_LINE_BYTES),
			search_limit: Some(DEFAULT_SEARCH_LIMIT),
			audit_log_size: Some(DEFAULT_AUDIT_LOG_SIZE),
			otel_enabled: false,
			otel_endpoint: String::from("http://127.0.0.1:4317"),
			otel_service_name: String::from(env!("CARGO_PKG_NAME")),
			config_path: None,
			print_schema: false
		}
	}
}

pub fn load_config() -> Result<Config> {
	let mut settings = Settings::default();
	settings.apply_env(|key| std::env::var(key).ok())?;
	settings.apply_args(std::env::args().skip(1))?;
	if settings.print_schema {
		let payload = serde_json::to_string_pretty(&config_schema())?;
		println!("{}", payload);
		std::process::exit(0);
	}
	if let Some(path) = settings.config_path.clone() {
		let value = load_config_value(&path)?;
		settings.apply_file(&value)?;
	}
	let cwd = std::env::current_dir()?;
	let resolver = PathResolver::from_directories(&settings.allowed_directories, dirs::home_dir(), cwd)?;
	Ok(Config {
		resolver,
		read_max_bytes: settings.read_max_bytes,
		read_max_line_bytes: settings.read_max_line_bytes,
		search_limit: settings.search_limit,
		audit_log_size: settings.audit_log_size,
		otel_enabled: settings.otel_enabled,
		otel_endpoint: settings.otel_endpoint,
		otel_service_name: settings.otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string()
	})
}

impl Settings {
	fn apply_env<F>(&mut self, lookup: F) -> Result<()>
	where
		F: Fn(&str) -> Option<String>, {
		let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
		if let Some(value) = get("MCP_ALLOWED_DIRECTORIES") {
			self.push_directories(value.split(','));
		}
		if let Some(value) = get("MCP_CONFIG") {
			self.config_path = Some(value);
		}
		if let Some(value) = get("MCP_READ_MAX_BYTES") {
			self.read_max_bytes = parse_limit(&value, "MCP_READ_MAX_BYTES")?;
		}
		if let Some(value) = get("MCP_READ_MAX_LINE_BYTES") {
			self.read_max_line_bytes = parse_limit(&value, "MCP_READ_MAX_LINE_BYTES")?;
		}
		if let Some(value) = get("MCP_SEARCH_LIMIT") {
			self.search_limit = parse_limit(&value, "MCP_SEARCH_LIMIT")?;
		}
		if let Some(value) = get("MCP_AUDIT_LOG_SIZE") {
			self.audit_log_size = parse_limit(&value, "MCP_AUDIT_LOG_SIZE")?;
		}
		if let Some(value) = get("MCP_OTEL_ENABLED") {
			self.otel_enabled = parse_bool(&value, "MCP_OTEL_ENABLED")?;
		}
		if let Some(value) = get("MCP_OTEL_ENDPOINT") {
			self.otel_endpoint = value;
		}
		if let Some(value) = get("MCP_OTEL_SERVICE_NAME") {
			self.otel_service_name = value;
		}
		Ok(())
	}

	fn apply_args<I>(&mut self, args: I) -> Result<()>
	where
		I: IntoIterator<Item = String>, {
		let mut args = args.into_iter();
		while let Some(arg) = args.next() {
			let mut value_for = |flag: &str| args.next().ok_or_else(|| anyhow!("{} requires a value", flag));
			match arg.as_str() {
				"--allow-root" => {
					let value = value_for("--allow-root")?;
					self.push_directories([value.as_str()]);
				}
				"--config" => {
					self.config_path = Some(value_for("--config")?);
				}
				"--print-config-schema" => {
					self.print_schema = true;
				}
				"--read-max-bytes" => {
					self.read_max_bytes = parse_limit(&value_for("--read-max-bytes")?, "--read-max-bytes")?;
				}
				"--read-max-line-bytes" => {
					self.read_max_line_bytes = parse_limit(&value_for("--read-max-line-bytes")?, "--read-max-line-bytes")?;
				}
				"--search-limit" => {
					self.search_limit = parse_limit(&value_for("--search-limit")?, "--search-limit")?;
				}
				"--audit-log-size" => {
					self.audit_log_size = parse_limit(&value_for("--audit-log-size")?, "--audit-log-size")?;
				}
				"--otel-enabled" => {
					self.otel_enabled = parse_bool(&value_for("--otel-enabled")?, "--otel-enabled")?;
				}
				"--otel-endpoint" => {
					self.otel_endpoint = value_for("--otel-endpoint")?;
				}
				"--otel-service-name" => {
					self.otel_service_name = value_for("--otel-service-name")?;
				}
				flag if flag.starts_with("--") => return Err(anyhow!("unknown argument: {}", flag)),
				_ => self.push_directories([arg.as_str()]),
			}
		}
		Ok(())
	}

	/// Overrides from a JSON config file. Listed directories are added to the
	/// ones given on the command line.
	fn apply_file(&mut self, value: &Value) -> Result<()> {
		let obj = value.as_object().ok_or_else(|| anyhow!("config must be an object"))?;
		for (key, value) in obj {
			match key.as_str() {
				"allowed_directories" => {
					let items = value.as_array().ok_or_else(|| anyhow!("allowed_directories must be an array"))?;
					for item in items {
						let dir = item.as_str().ok_or_else(|| anyhow!("allowed_directories entries must be strings"))?;
						self.push_directories([dir]);
					}
				}
				"read_max_bytes" => {
					self.read_max_bytes = parse_limit_value(value, "read_max_bytes")?;
				}
				"read_max_line_bytes" => {
					self.read_max_line_bytes = parse_limit_value(value, "read_max_line_bytes")?;
				}
				"search_limit" => {
					self.search_limit = parse_limit_value(value, "search_limit")?;
				}
				"audit_log_size" => {
					self.audit_log_size = parse_limit_value(value, "audit_log_size")?;
				}
				"otel_enabled" => {
					if !value.is_null() {
						self.otel_enabled = value.as_bool().ok_or_else(|| anyhow!("otel_enabled must be a boolean"))?;
					}
				}
				"otel_endpoint" => {
					if !value.is_null() {
						self.otel_endpoint = value.as_str().ok_or_else(|| anyhow!("otel_endpoint must be a string"))?.to_string();
					}
				}
				"otel_service_name" => {
					if !value.is_null() {
						self.otel_service_name = value.as_str().ok_or_else(|| anyhow!("otel_service_name must be a string"))?.to_string();
					}
				}
				_ => return Err(anyhow!("unknown config key: {}", key)),
			}
		}
		Ok(())
	}

	fn push_directories<'a, I>(&mut self, values: I)
	where
		I: IntoIterator<Item = &'a str>, {
		for value in values {
			let trimmed = value.trim();
			if !trimmed.is_empty() && !self.allowed_directories.iter().any(|dir| dir == trimmed) {
				self.allowed_directories.push(trimmed.to_string());
			}
		}
	}
}

pub fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "mcp-fs-sandbox configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"allowed_directories": {
				"type": "array",
				"items": { "type": "string" },
				"description": "Directories the server may access, in addition to those given on the command line."
			},
			"read_max_bytes": {
				"type": "integer",
				"minimum": 0,
				"description": "Max output bytes for read_file and read_multiple_files. 0 disables the limit."
			},
			"read_max_line_bytes": {
				"type": "integer",
				"minimum": 0,
				"description": "Max bytes per line before truncation. 0 disables the limit."
			},
			"search_limit": {
				"type": "integer",
				"minimum": 0,
				"description": "Max results for search_files. 0 disables the limit."
			},
			"audit_log_size": {
				"type": "integer",
				"minimum": 0,
				"description": "Number of diffs kept as resources. 0 keeps all."
			},
			"otel_enabled": {
				"type": "boolean",
				"description": "Export traces over OTLP."
			},
			"otel_endpoint": {
				"type": "string",
				"description": "OTLP endpoint."
			},
			"otel_service_name": {
				"type": "string",
				"description": "OTEL service.name."
			}
		}
	})
}

fn load_config_value(path: &str) -> Result<Value> {
	let path = PathBuf::from(path);
	let content = std::fs::read_to_string(&path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path.display(), err))?;
	serde_json::from_str(&content)
		.map_err(|err| anyhow!("failed to parse config {}: {}", path.display(), err))
}

fn parse_limit(value: &str, label: &str) -> Result<Option<usize>> {
	let parsed = value.trim()
		.parse::<usize>()
		.map_err(|_| anyhow!("{} must be a non-negative integer", label))?;
	if parsed == 0 {
		return Ok(None);
	}
	Ok(Some(parsed))
}

fn parse_limit_value(value: &Value, label: &str) -> Result<Option<usize>> {
	if value.is_null() {
		return Ok(None);
	}
	let number = value.as_u64().ok_or_else(|| anyhow!("{} must be a non-negative integer", label))?;
	if number == 0 {
		return Ok(None);
	}
	Ok(Some(number as usize))
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	match value.trim().to_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}
