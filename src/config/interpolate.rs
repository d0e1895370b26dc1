use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::{lookup, ConfigError};

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^${}]+)\}").expect("static reference pattern is valid"))
}

struct Resolver<'a> {
    snapshot: &'a Value,
    resolved: HashMap<String, Value>,
    stack: Vec<String>,
}

pub(super) fn resolve(root: &mut Value) -> Result<(), ConfigError> {
    let snapshot = root.clone();
    let mut resolver = Resolver {
        snapshot: &snapshot,
        resolved: HashMap::new(),
        stack: Vec::new(),
    };
    resolver.resolve_node(root, "")
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Resolver<'_> {
    fn resolve_node(&mut self, node: &mut Value, path: &str) -> Result<(), ConfigError> {
        match node {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    self.resolve_node(child, &join(path, key))?;
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter_mut().enumerate() {
                    self.resolve_node(child, &join(path, &index.to_string()))?;
                }
            }
            Value::String(text) if text.contains("${") => {
                let text = text.clone();
                self.stack.push(path.to_string());
                let value = self.resolve_string(path, &text);
                self.stack.pop();
                *node = value?;
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_string(&mut self, key: &str, text: &str) -> Result<Value, ConfigError> {
        let pattern = reference_pattern();

        if let Some(captures) = pattern.captures(text) {
            let whole = captures.get(0).map(|m| m.as_str().len() == text.len()).unwrap_or(false);
            if whole {
                let reference = captures[1].trim().to_string();
                return self.value_at(key, &reference);
            }
        }

        let mut rendered = String::with_capacity(text.len());
        let mut last = 0;
        for captures in pattern.captures_iter(text) {
            let span = match captures.get(0) {
                Some(span) => span,
                None => continue,
            };
            rendered.push_str(&text[last..span.start()]);
            let value = self.value_at(key, captures[1].trim())?;
            rendered.push_str(&render(&value));
            last = span.end();
        }
        rendered.push_str(&text[last..]);
        Ok(Value::String(rendered))
    }

    fn value_at(&mut self, key: &str, reference: &str) -> Result<Value, ConfigError> {
        let failure = |reason: &str| ConfigError::Interpolation {
            key: key.to_string(),
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if let Some(value) = self.resolved.get(reference) {
            return Ok(value.clone());
        }
        if self.stack.iter().any(|entry| entry == reference) {
            return Err(failure("reference cycle"));
        }

        let mut value = lookup(self.snapshot, reference)
            .cloned()
            .ok_or_else(|| failure("key not found"))?;

        self.stack.push(reference.to_string());
        let outcome = self.resolve_node(&mut value, reference);
        self.stack.pop();
        outcome?;

        self.resolved.insert(reference.to_string(), value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whole_reference_keeps_type() {
        let mut root = json!({
            "trainer": {"precision": 16},
            "model": {"precision": "${trainer.precision}"}
        });
        resolve(&mut root).unwrap();
        assert_eq!(root["model"]["precision"], json!(16));
    }

    #[test]
    fn test_embedded_and_chained_references() {
        let mut root = json!({
            "name": "diar",
            "exp_dir": "./runs/${name}",
            "log_dir": "${exp_dir}/logs"
        });
        resolve(&mut root).unwrap();
        assert_eq!(root["log_dir"], json!("./runs/diar/logs"));
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let mut root = json!({"a": "${b.c}"});
        let err = resolve(&mut root).unwrap_err();
        assert!(err.to_string().contains("b.c"));
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut root = json!({"a": "${b}", "b": "${a}"});
        let err = resolve(&mut root).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
