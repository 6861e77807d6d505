//! Match expressions: compiled predicates over an event's `{type, payload}`
//! view, plus the interceptors that use them on the hot append path.
//!
//! An expression is ordinary `evalexpr` syntax over flattened event fields.
//! The event type is bound as `type`; payload fields are bound under the
//! `payload` namespace with `::` as the path separator, so
//! `payload::city == "london"` matches `{"city": "london"}` and
//! `payload::result::status >= 200` reaches into nested objects. Array
//! elements are addressed by index (`payload::items::0`).
//!
//! Expressions are compiled once and cached globally by expression text;
//! the matcher sits on the append path of every stream, so repeated
//! evaluation must not re-parse.
//!
//! ```rust
//! use agentstream::matcher::MatchExpression;
//!
//! let expr = MatchExpression::compile(
//!     "type == \"agent:action:send-user-message:called\" && payload::content != \"\"",
//! ).unwrap();
//! ```

use evalexpr::ContextWithMutableVariables;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::agentstream::event::Event;

lazy_static! {
    // Compiled-expression cache keyed by expression text.
    static ref COMPILED: Mutex<HashMap<String, Arc<evalexpr::Node>>> = Mutex::new(HashMap::new());
}

/// A compiled boolean predicate over events.
#[derive(Clone)]
pub struct MatchExpression {
    text: String,
    node: Arc<evalexpr::Node>,
}

impl MatchExpression {
    /// Compile `text`, reusing a previously compiled tree when the same
    /// expression was seen before anywhere in the process.
    pub fn compile(text: &str) -> Result<Self, String> {
        {
            let cache = COMPILED.lock().expect("acquire matcher cache lock");
            if let Some(node) = cache.get(text) {
                return Ok(MatchExpression {
                    text: text.to_string(),
                    node: node.clone(),
                });
            }
        }
        let node: evalexpr::Node = evalexpr::build_operator_tree(text).map_err(|e| e.to_string())?;
        let node = Arc::new(node);
        COMPILED
            .lock()
            .expect("acquire matcher cache lock")
            .insert(text.to_string(), node.clone());
        Ok(MatchExpression {
            text: text.to_string(),
            node,
        })
    }

    /// The expression source text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate against one event. Missing variables and type errors
    /// evaluate to false rather than failing the append path.
    pub fn matches(&self, event: &Event) -> bool {
        let mut context = evalexpr::HashMapContext::new();
        let _ = context.set_value(
            "type".to_string(),
            evalexpr::Value::String(event.event_type.clone()),
        );
        bind_json("payload", &event.payload, &mut context);
        self.node
            .eval_boolean_with_context(&context)
            .unwrap_or(false)
    }
}

fn bind_json(prefix: &str, value: &serde_json::Value, context: &mut evalexpr::HashMapContext) {
    match value {
        serde_json::Value::Null => {
            let _ = context.set_value(prefix.to_string(), evalexpr::Value::Empty);
        }
        serde_json::Value::Bool(b) => {
            let _ = context.set_value(prefix.to_string(), evalexpr::Value::Boolean(*b));
        }
        serde_json::Value::Number(n) => {
            let value = if let Some(i) = n.as_i64() {
                evalexpr::Value::Int(i)
            } else {
                evalexpr::Value::Float(n.as_f64().unwrap_or(f64::NAN))
            };
            let _ = context.set_value(prefix.to_string(), value);
        }
        serde_json::Value::String(s) => {
            let _ = context.set_value(prefix.to_string(), evalexpr::Value::String(s.clone()));
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                bind_json(&format!("{}::{}", prefix, i), item, context);
            }
        }
        serde_json::Value::Object(fields) => {
            for (key, item) in fields {
                bind_json(&format!("{}::{}", prefix, key), item, context);
            }
        }
    }
}

/// An interceptor couples a match expression with a callback invoked for
/// every matching event as it is appended. Interceptors are registered on
/// the [`StreamManager`](crate::agentstream::manager::StreamManager)
/// alongside processors.
pub struct Interceptor {
    name: String,
    expression: MatchExpression,
    handler: Box<dyn Fn(&Event) + Send + Sync>,
}

impl Interceptor {
    pub fn new(
        name: impl Into<String>,
        expression: MatchExpression,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Self {
        Interceptor {
            name: name.into(),
            expression,
            handler: Box::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.expression.matches(event)
    }

    pub fn invoke(&self, event: &Event) {
        (self.handler)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentstream::offset::Offset;
    use chrono::Utc;

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            path: "p".into(),
            offset: Offset::new(0),
            event_type: event_type.into(),
            payload,
            version: None,
            created_at: Utc::now(),
            trace: None,
        }
    }

    #[test]
    fn test_type_and_payload_predicates() {
        let expr = MatchExpression::compile(
            "type == \"weather\" && payload::city == \"london\" && payload::temperature > 10",
        )
        .unwrap();
        assert!(expr.matches(&event(
            "weather",
            serde_json::json!({"city": "london", "temperature": 18})
        )));
        assert!(!expr.matches(&event(
            "weather",
            serde_json::json!({"city": "paris", "temperature": 18})
        )));
        assert!(!expr.matches(&event("other", serde_json::json!({}))));
    }

    #[test]
    fn test_missing_fields_do_not_match() {
        let expr = MatchExpression::compile("payload::missing == 1").unwrap();
        assert!(!expr.matches(&event("t", serde_json::json!({}))));
    }

    #[test]
    fn test_nested_and_indexed_paths() {
        let expr =
            MatchExpression::compile("payload::result::items::0 == \"a\"").unwrap();
        assert!(expr.matches(&event(
            "t",
            serde_json::json!({"result": {"items": ["a", "b"]}})
        )));
    }

    #[test]
    fn test_cache_reuses_compiled_tree() {
        let a = MatchExpression::compile("type == \"x\"").unwrap();
        let b = MatchExpression::compile("type == \"x\"").unwrap();
        assert!(Arc::ptr_eq(&a.node, &b.node));
    }
}
