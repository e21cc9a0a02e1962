use crate::config::{config_schema, Config};
use crate::error::FsError;
use crate::protocol::{Request, Response, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, SERVER_ERROR};
use crate::tools::{self, DiffRecord, ToolCall, ToolOutput, ToolParseError};
use anyhow::Result;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, info_span, Instrument, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl From<ToolParseError> for ProtocolError {
	fn from(err: ToolParseError) -> Self {
		let code = match err {
			ToolParseError::UnknownTool(_) => METHOD_NOT_FOUND,
			ToolParseError::InvalidArguments { .. } => INVALID_PARAMS,
		};
		ProtocolError::new(code, err.to_string())
	}
}

#[derive(Clone, Debug)]
struct AuditEntry {
	uri: String,
	record: DiffRecord,
}

/// Most recent diffs, exposed as `diff://` resources. Reading an entry marks
/// it as recently used.
struct AuditLog {
	capacity: Option<usize>,
	map: HashMap<String, AuditEntry>,
	order: VecDeque<String>,
}

impl AuditLog {
	fn new(capacity: Option<usize>) -> Self {
		Self {
			capacity,
			map: HashMap::new(),
			order: VecDeque::new()
		}
	}

	fn record(&mut self, record: DiffRecord) -> String {
		let uri = format!("diff://{}/{}", record.tool, uuid::Uuid::new_v4());
		self.map.insert(uri.clone(), AuditEntry {
			uri: uri.clone(),
			record
		});
		self.order.push_back(uri.clone());
		self.trim();
		uri
	}

	fn get(&mut self, uri: &str) -> Option<AuditEntry> {
		if self.map.contains_key(uri) {
			self.touch(uri);
		}
		self.map
			.get(uri)
			.cloned()
	}

	fn list(&self) -> Vec<&AuditEntry> {
		self.order
			.iter()
			.filter_map(|key| self.map.get(key))
			.collect()
	}

	fn touch(&mut self, uri: &str) {
		if let Some(pos) = self.order
			.iter()
			.position(|item| item == uri) {
			self.order.remove(pos);
		}
		self.order.push_back(uri.to_string());
	}

	fn trim(&mut self) {
		let Some(capacity) = self.capacity else {
			return;
		};
		while self.order.len() > capacity {
			if let Some(key) = self.order.pop_front() {
				self.map.remove(&key);
			}
		}
	}
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let directories = config.resolver
		.allowlist()
		.roots()
		.iter()
		.map(|root| root.display().to_string())
		.collect::<Vec<_>>()
		.join(",");
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("mcp.allowed_directories", directories),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok()
			.and_then(|tracer| tracer.provider());
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	// stdout carries the protocol
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_ansi(false)
		.with_writer(std::io::stderr);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.with(tracing_layer)
		.init();
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	let mut server = Server::new(&config);
	info!(
		directories = config.resolver.allowlist().roots().len(),
		session_id = %config.session_id,
		"serving on stdio"
	);
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, PARSE_ERROR, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let Some(id) = req.id.clone() else {
			debug!(method = %req.method, "ignoring notification");
			continue;
		};
		let resp = server.handle_request(id, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

struct Server<'a> {
	config: &'a Config,
	audit: AuditLog,
}

impl<'a> Server<'a> {
	fn new(config: &'a Config) -> Self {
		Self {
			config,
			audit: AuditLog::new(config.audit_log_size)
		}
	}

	async fn handle_request(&mut self, id: Value, req: Request) -> Response {
		let tool_name = extract_tool_name(&req.method, &req.params);
		let span = info_span!(
			"mcp.request",
			"mcp.session_id" = %self.config.session_id,
			"mcp.method" = %req.method,
			"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
			"mcp.is_error" = tracing::field::Empty,
			"mcp.error_code" = tracing::field::Empty,
			"mcp.count" = tracing::field::Empty,
			"mcp.response_bytes" = tracing::field::Empty,
		);
		let result = self.route(&req).instrument(span.clone()).await;
		match result {
			Ok(value) => {
				record_result(&span, &value);
				Response::ok(id, value)
			}
			Err(err) => {
				span.record("mcp.is_error", true);
				Response::err(id, err.code, err.message)
			}
		}
	}

	async fn route(&mut self, req: &Request) -> Result<Value, ProtocolError> {
		match req.method.as_str() {
			"initialize" => Ok(initialize_result(&req.params)),
			"ping" => Ok(json!({})),
			"tools/list" => Ok(json!({
				"tools": tools::tool_definitions()
			})),
			"tools/call" => {
				let name = req.params
					.get("name")
					.and_then(Value::as_str)
					.ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "name is required"))?;
				let arguments = req.params
					.get("arguments")
					.cloned()
					.unwrap_or(Value::Null);
				let call = ToolCall::parse(name, arguments)?;
				Ok(self.call_tool(call).await)
			}
			"resources/list" => Ok(self.resources_list()),
			"resources/read" => self.resources_read(&req.params),
			_ => Err(ProtocolError::new(METHOD_NOT_FOUND, format!("method not found: {}", req.method))),
		}
	}

	async fn call_tool(&mut self, call: ToolCall) -> Value {
		let name = call.name();
		match tools::execute(self.config, call).await {
			Ok(mut output) => {
				let uri = output.record
					.take()
					.map(|record| self.audit.record(record));
				tool_success(output, uri)
			}
			Err(err) => {
				debug!(tool = name, error = %err, "tool failed");
				tool_error(&err)
			}
		}
	}

	fn resources_list(&self) -> Value {
		let resources: Vec<Value> = self.audit
			.list()
			.into_iter()
			.map(|entry| json!({
				"uri": entry.uri,
				"name": format!("{} diff for {}", entry.record.tool, entry.record.path),
				"mimeType": "text/x-diff"
			}))
			.collect();
		json!({
			"resources": resources
		})
	}

	fn resources_read(&mut self, params: &Value) -> Result<Value, ProtocolError> {
		let uri = params.get("uri")
			.and_then(Value::as_str)
			.ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "uri is required"))?;
		let entry = self.audit
			.get(uri)
			.ok_or_else(|| ProtocolError::new(SERVER_ERROR, format!("resource not found: {}", uri)))?;
		Ok(json!({
			"contents": [
				{
					"uri": entry.uri,
					"mimeType": "text/x-diff",
					"text": entry.record.diff
				}
			]
		}))
	}
}

fn initialize_result(params: &Value) -> Value {
	let version = params.get("protocolVersion")
		.and_then(Value::as_str)
		.unwrap_or(PROTOCOL_VERSION);
	json!({
		"protocolVersion": version,
		"serverInfo": {
			"name": env!("CARGO_PKG_NAME"),
			"version": env!("CARGO_PKG_VERSION")
		},
		"capabilities": {
			"tools": {
				"listChanged": false
			},
			"resources": {
				"listChanged": false
			}
		},
		"configSchema": config_schema()
	})
}

fn tool_success(output: ToolOutput, diff_uri: Option<String>) -> Value {
	let mut structured = output.structured;
	let mut content = vec![json!({
		"type": "text",
		"text": output.message
	})];
	if let Some(uri) = diff_uri {
		if let Some(obj) = structured.as_object_mut() {
			obj.insert("diff_uri".to_string(), json!(uri));
		}
		content.push(json!({
			"type": "diff",
			"url": uri,
			"mimeType": "text/x-diff"
		}));
	}
	json!({
		"structuredContent": structured,
		"content": content,
		"isError": false
	})
}

fn tool_error(err: &FsError) -> Value {
	let mut structured = json!({
		"code": err.code()
	});
	if let FsError::NoMatch { results, .. } = err {
		structured["match_results"] = json!(results);
	}
	json!({
		"isError": true,
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": err.to_string()
			}
		]
	})
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
	if let Some(count) = result.get("structuredContent")
		.and_then(|value| value.get("count"))
		.and_then(Value::as_u64) {
		span.record("mcp.count", count);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
