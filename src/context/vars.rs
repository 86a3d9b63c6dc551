//! Layered variable contexts.
//!
//! A context chains read-only layers (globals, then launch-supplied initials,
//! then step defaults) beneath one private writable layer. Lookup walks the
//! writable layer first, then the read-only chain innermost-out. String values
//! may refer to other variables with `{{name}}` placeholders; resolution
//! follows those indirections recursively with a depth guard.
//!
//! Concurrently-running tasks must each hold their own context obtained via
//! [`VariableContext::fork`], which freezes the parent's writable layer into
//! the shared read-only chain and starts a fresh private layer.

use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::errors::{ConvoyError, Result};

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap();
}

/// How many chained `{{name}}` hops resolution will follow before giving up.
const MAX_RESOLVE_DEPTH: usize = 16;

/// Chained, read-mostly variable scope.
#[derive(Debug, Default)]
pub struct VariableContext {
    /// Read-only layers, innermost first.
    layers: Vec<Arc<HashMap<String, Value>>>,
    /// The single writable layer; `set` mutates only this.
    variables: DashMap<String, Value>,
}

/// Builder for the canonical globals/initials/defaults layering.
#[derive(Debug, Default)]
pub struct VariableContextBuilder {
    globals: HashMap<String, Value>,
    initials: HashMap<String, Value>,
    defaults: HashMap<String, Value>,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn globals(mut self, map: HashMap<String, Value>) -> Self {
        self.globals = map;
        self
    }

    pub fn initials(mut self, map: HashMap<String, Value>) -> Self {
        self.initials = map;
        self
    }

    pub fn defaults(mut self, map: HashMap<String, Value>) -> Self {
        self.defaults = map;
        self
    }

    pub fn build(self) -> VariableContext {
        VariableContext {
            // Initials shadow defaults, defaults shadow globals.
            layers: vec![
                Arc::new(self.initials),
                Arc::new(self.defaults),
                Arc::new(self.globals),
            ],
            variables: DashMap::new(),
        }
    }
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> VariableContextBuilder {
        VariableContextBuilder::new()
    }

    /// Build a context whose only read-only layer is `map` (used when a wire
    /// payload is rehydrated on the receiving side).
    pub fn from_flat(map: HashMap<String, Value>) -> Self {
        Self {
            layers: vec![Arc::new(map)],
            variables: DashMap::new(),
        }
    }

    /// Write into the innermost layer.
    pub fn set<K: Into<String>>(&self, key: K, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Raw chain lookup, no indirection following.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.variables.get(key) {
            return Some(v.clone());
        }
        for layer in &self.layers {
            if let Some(v) = layer.get(key) {
                return Some(v.clone());
            }
        }
        None
    }

    /// Chain lookup following `{{name}}` indirections recursively.
    pub fn resolve(&self, key: &str) -> Result<Option<Value>> {
        match self.get(key) {
            Some(v) => Ok(Some(self.resolve_value(&v, 0)?)),
            None => Ok(None),
        }
    }

    /// Resolve every `{{name}}` placeholder inside `value`, recursing into
    /// arrays and objects. Used to materialize an operation's input payload
    /// before execution.
    pub fn resolve_payload(&self, value: &Value) -> Result<Value> {
        self.resolve_value(value, 0)
    }

    fn resolve_value(&self, value: &Value, depth: usize) -> Result<Value> {
        if depth > MAX_RESOLVE_DEPTH {
            return Err(ConvoyError::validation(
                "variable resolution exceeded maximum indirection depth",
            ));
        }
        match value {
            Value::String(s) => self.render_str(s, depth),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value(v, depth + 1))
                    .collect::<Result<_>>()?,
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_str(&self, s: &str, depth: usize) -> Result<Value> {
        // A string that is exactly one placeholder keeps the referent's type.
        if let Some(caps) = PLACEHOLDER_RE.captures(s) {
            if caps.get(0).map(|m| m.as_str()) == Some(s.trim()) {
                let name = &caps[1];
                let referent = self.get(name).ok_or_else(|| {
                    ConvoyError::validation_field("unresolved variable reference", name)
                })?;
                return self.resolve_value(&referent, depth + 1);
            }
        }

        let mut rendered = String::with_capacity(s.len());
        let mut last = 0;
        for caps in PLACEHOLDER_RE.captures_iter(s) {
            let whole = caps.get(0).unwrap();
            let name = &caps[1];
            rendered.push_str(&s[last..whole.start()]);
            let referent = self.get(name).ok_or_else(|| {
                ConvoyError::validation_field("unresolved variable reference", name)
            })?;
            match self.resolve_value(&referent, depth + 1)? {
                Value::String(inner) => rendered.push_str(&inner),
                other => rendered.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        rendered.push_str(&s[last..]);
        Ok(Value::String(rendered))
    }

    /// Derive a child context with its own writable layer. The parent's
    /// current writable layer is frozen into the shared read-only chain.
    pub fn fork(&self) -> Self {
        let frozen: HashMap<String, Value> = self
            .variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(Arc::new(frozen));
        layers.extend(self.layers.iter().cloned());
        Self {
            layers,
            variables: DashMap::new(),
        }
    }

    /// Merge externally produced variables (e.g. from a peer's execution)
    /// into the writable layer.
    pub fn merge(&self, produced: HashMap<String, Value>) {
        for (k, v) in produced {
            self.variables.insert(k, v);
        }
    }

    /// Contents of the writable layer only.
    pub fn delta(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Flatten the whole chain into one map (innermost wins) for the wire.
    pub fn flatten(&self) -> HashMap<String, Value> {
        let mut out: HashMap<String, Value> = HashMap::new();
        for layer in self.layers.iter().rev() {
            for (k, v) in layer.iter() {
                out.insert(k.clone(), v.clone());
            }
        }
        for e in self.variables.iter() {
            out.insert(e.key().clone(), e.value().clone());
        }
        out
    }
}
