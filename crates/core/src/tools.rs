//! Tool registry and dispatcher.
//!
//! Tools are registered once through an explicit builder API: a name, a
//! description, a JSON-schema parameter document and a handler. Registration
//! compiles each definition into an immutable [`ToolDescriptor`]. At call time
//! the dispatcher matches the model's argument document against the declared
//! parameters, invokes the handler off the receive path, and always answers
//! with exactly one [`ToolResponse`].

use crate::EnvelopeSender;
use crate::generic_types::{Delivery, OutboundEnvelope, PendingToolCall, ToolResponse};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Arguments assembled for one invocation, in declared parameter order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: Vec<(String, Value)>,
}

impl ToolArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A host-registered callable.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: ToolArgs) -> Result<Value>;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, args: ToolArgs) -> Result<Value> {
        (self.0)(args).await
    }
}

/// A raw, uncompiled tool definition.
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the parameters, if any.
    pub parameters: Option<Value>,
    pub handler: Option<Arc<dyn ToolHandler>>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            handler: None,
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.with_handler(Arc::new(FnHandler(f)))
    }
}

/// JSON-schema primitive type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn parse(type_name: &str) -> Option<Self> {
        match type_name.to_ascii_lowercase().as_str() {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    fn zero_value(self) -> Value {
        match self {
            Self::String => json!(""),
            Self::Number => json!(0.0),
            Self::Integer => json!(0),
            Self::Boolean => json!(false),
            Self::Array => json!([]),
            Self::Object => json!({}),
        }
    }

    /// Converts stringly-typed values the model sometimes sends into the declared type.
    fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (Self::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(s)),
            (Self::Integer, Value::Number(n)) if n.as_i64().is_none() => n
                .as_f64()
                .map(|f| Value::from(f.round() as i64))
                .unwrap_or(Value::Number(n)),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or(Value::String(s)),
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(s),
            },
            (Self::String, Value::Number(n)) => Value::String(n.to_string()),
            (Self::String, Value::Bool(b)) => Value::String(b.to_string()),
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
}

/// Compiled, immutable record binding a declared name to its handler.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub declared_name: String,
    pub description: String,
    /// Normalized schema, `None` for tools without parameters.
    pub parameter_schema: Option<Value>,
    pub params: Vec<ParamSpec>,
    handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("declared_name", &self.declared_name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    fn compile(definition: ToolDefinition) -> Result<Self> {
        let declared_name = sanitize_name(&definition.name);
        if !declared_name.chars().any(|c| c.is_ascii_alphanumeric()) {
            bail!("tool name {:?} has no usable characters", definition.name);
        }
        let handler = definition
            .handler
            .ok_or_else(|| anyhow!("tool '{declared_name}' has no handler"))?;

        let (parameter_schema, params) = match definition.parameters {
            None => (None, Vec::new()),
            Some(mut schema) => {
                let params = parse_params(&schema)?;
                normalize_schema(&mut schema);
                if params.is_empty() {
                    (None, params)
                } else {
                    (Some(schema), params)
                }
            }
        };

        Ok(Self {
            declared_name,
            description: definition.description,
            parameter_schema,
            params,
            handler,
        })
    }

    /// The function declaration sent in the session setup.
    pub fn declaration(&self) -> Value {
        let mut declaration = json!({
            "name": self.declared_name,
            "description": self.description,
        });
        if let Some(schema) = &self.parameter_schema {
            declaration["parameters"] = schema.clone();
        }
        declaration
    }

    /// Matches the argument document against declared parameters, case-insensitively.
    pub fn assemble_args(&self, document: &Value) -> ToolArgs {
        let fields = document.as_object();
        let values = self
            .params
            .iter()
            .map(|param| {
                let supplied = fields.and_then(|map| {
                    map.iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(&param.name))
                        .map(|(_, value)| value.clone())
                });
                let value = match supplied {
                    Some(Value::Null) | None => param
                        .default
                        .clone()
                        .unwrap_or_else(|| param.kind.zero_value()),
                    Some(value) => param.kind.coerce(value),
                };
                (param.name.clone(), value)
            })
            .collect();
        ToolArgs { values }
    }
}

/// Lowercases and maps every character outside `[a-z0-9_-]` to `_`.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_params(schema: &Value) -> Result<Vec<ParamSpec>> {
    let object = schema
        .as_object()
        .ok_or_else(|| anyhow!("parameter schema must be a JSON object"))?;
    if let Some(kind) = object.get("type").and_then(Value::as_str) {
        if !kind.eq_ignore_ascii_case("object") {
            bail!("parameter schema type must be 'object', got '{kind}'");
        }
    }
    let properties = match object.get("properties") {
        None => return Ok(Vec::new()),
        Some(Value::Object(properties)) => properties,
        Some(_) => bail!("'properties' must be an object"),
    };

    properties
        .iter()
        .map(|(name, property)| {
            let type_name = property
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("parameter '{name}' has no type"))?;
            let kind = ParamKind::parse(type_name)
                .ok_or_else(|| anyhow!("parameter '{name}' has unknown type '{type_name}'"))?;
            Ok(ParamSpec {
                name: name.clone(),
                kind,
                default: property.get("default").cloned(),
            })
        })
        .collect()
}

/// Removes empty `required` arrays at every object level; some services reject them.
fn normalize_schema(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };
    if object
        .get("required")
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty)
    {
        object.remove("required");
    }
    if let Some(Value::Object(properties)) = object.get_mut("properties") {
        for property in properties.values_mut() {
            normalize_schema(property);
        }
    }
    if let Some(items) = object.get_mut("items") {
        normalize_schema(items);
    }
}

/// Name-keyed catalogue of compiled tools. Immutable after construction.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Compiles every definition. Failures are logged and skipped.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ToolDefinition>) -> Self {
        let mut registry = Self::default();
        for definition in definitions {
            let raw_name = definition.name.clone();
            match ToolDescriptor::compile(definition) {
                Ok(descriptor) => registry.insert(descriptor),
                Err(e) => {
                    error!(tool = %raw_name, error = %e, "Skipping tool that failed to register")
                }
            }
        }
        info!(count = registry.len(), "Tool registry compiled");
        registry
    }

    fn insert(&mut self, descriptor: ToolDescriptor) {
        let key = descriptor.declared_name.clone();
        if self.tools.insert(key.clone(), descriptor).is_some() {
            warn!(tool = %key, "Duplicate tool name, last registration wins");
        } else {
            self.order.push(key);
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(&name.to_ascii_lowercase())
    }

    /// Compiled declarations in registration order, for the setup envelope.
    pub fn declarations(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolDescriptor::declaration)
            .collect()
    }

    /// Runs the call and returns its response. Never fails: every outcome is a response.
    #[instrument(skip(self, call), fields(call_id = %call.call_id, tool = %call.name))]
    pub async fn dispatch(&self, call: &PendingToolCall) -> ToolResponse {
        let Some(descriptor) = self.get(&call.name) else {
            warn!("Model requested an unknown tool");
            return ToolResponse::error(call, format!("unknown tool '{}'", call.name));
        };

        let args = descriptor.assemble_args(&call.raw_arguments);
        debug!(?args, "Invoking tool");
        let handler = Arc::clone(&descriptor.handler);
        // A separate task turns a panicking handler into a JoinError instead of unwinding here.
        let outcome = tokio::spawn(async move { handler.call(args).await }).await;

        match outcome {
            Ok(Ok(result)) => ToolResponse::success(call, result),
            Ok(Err(e)) => {
                warn!(error = %e, "Tool handler failed");
                ToolResponse::error(call, e.to_string())
            }
            Err(join_error) => {
                error!(error = %join_error, "Tool handler panicked");
                ToolResponse::error(call, "tool handler panicked")
            }
        }
    }
}

/// Runs tool calls on worker tasks and sends their responses.
pub struct ToolDispatcher<S: ?Sized> {
    registry: Arc<ToolRegistry>,
    sender: Arc<S>,
}

impl<S: ?Sized> Clone for ToolDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<S> ToolDispatcher<S>
where
    S: EnvelopeSender + ?Sized + 'static,
{
    pub fn new(registry: Arc<ToolRegistry>, sender: Arc<S>) -> Self {
        Self { registry, sender }
    }

    /// Handles the call on a new task so the caller (the receive path) never waits on a handler.
    pub fn spawn(&self, call: PendingToolCall) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.handle(call).await })
    }

    pub async fn handle(&self, call: PendingToolCall) {
        let response = self.registry.dispatch(&call).await;
        let success = response.is_success();
        match self
            .sender
            .send(OutboundEnvelope::ToolResponse(response))
            .await
        {
            Ok(Delivery::Sent) => debug!(call_id = %call.call_id, success, "Tool response sent"),
            Ok(Delivery::Dropped) => {
                warn!(call_id = %call.call_id, "Tool response dropped, session no longer ready")
            }
            Err(e) => warn!(call_id = %call.call_id, error = %e, "Failed to send tool response"),
        }
    }
}
