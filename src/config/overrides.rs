use regex::Regex;
use serde_json::{Number, Value};
use std::str::FromStr;
use std::sync::OnceLock;

use super::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    /// `key=value`, the key must already exist
    Set,
    /// `+key=value`, the key must not exist yet
    Add,
    /// `++key=value`
    ForceSet,
    /// `~key`
    Delete,
}

/// One command-line override in the `key=value` grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub kind: OverrideKind,
    pub key: String,
    pub value: Value,
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)*$").expect("static key pattern is valid")
    })
}

impl FromStr for Override {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ConfigError::MalformedOverride {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        if let Some(key) = trimmed.strip_prefix('~') {
            if key.contains('=') {
                return Err(malformed("a delete override takes no value"));
            }
            if !key_pattern().is_match(key) {
                return Err(malformed("invalid key"));
            }
            return Ok(Self {
                kind: OverrideKind::Delete,
                key: key.to_string(),
                value: Value::Null,
            });
        }

        let (kind, body) = if let Some(rest) = trimmed.strip_prefix("++") {
            (OverrideKind::ForceSet, rest)
        } else if let Some(rest) = trimmed.strip_prefix('+') {
            (OverrideKind::Add, rest)
        } else {
            (OverrideKind::Set, trimmed)
        };

        let (key, raw_value) = body
            .split_once('=')
            .ok_or_else(|| malformed("expected key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed("empty key"));
        }
        if !key_pattern().is_match(key) {
            return Err(malformed("invalid key"));
        }
        let value = parse_value(raw_value).map_err(|reason| malformed(&reason))?;

        Ok(Self {
            kind,
            key: key.to_string(),
            value,
        })
    }
}

/// Split list items on commas outside nested brackets, braces and quotes.
fn split_top_level(text: &str) -> Result<Vec<&str>, String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[' | '{') => depth += 1,
            (None, ']' | '}') => {
                depth = depth.checked_sub(1).ok_or_else(|| format!("unbalanced '{c}' in list"))?;
            }
            (None, ',') if depth == 0 => {
                items.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unbalanced quotes in list".to_string());
    }
    if depth != 0 {
        return Err("unterminated nested list".to_string());
    }
    items.push(&text[start..]);
    Ok(items)
}

/// Parse the right-hand side of an override into a typed value.
pub fn parse_value(raw: &str) -> Result<Value, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(Value::String(String::new()));
    }

    if let Some(quote) = text.chars().next().filter(|c| *c == '\'' || *c == '"') {
        if text.len() < 2 || !text.ends_with(quote) {
            return Err("unbalanced quotes".to_string());
        }
        return Ok(Value::String(text[1..text.len() - 1].to_string()));
    }

    if text.starts_with('{') {
        return serde_json::from_str(text).map_err(|e| format!("invalid mapping: {e}"));
    }
    if text.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return Ok(value);
        }
        let inner = text
            .strip_suffix(']')
            .map(|t| &t[1..])
            .ok_or_else(|| "unterminated list".to_string())?;
        if inner.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let items = split_top_level(inner)?
            .into_iter()
            .map(parse_value)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::Array(items));
    }

    if text == "null" {
        return Ok(Value::Null);
    }
    if text.eq_ignore_ascii_case("true") {
        return Ok(Value::Bool(true));
    }
    if text.eq_ignore_ascii_case("false") {
        return Ok(Value::Bool(false));
    }
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::from(int));
    }
    if let Some(number) = text.parse::<f64>().ok().and_then(Number::from_f64) {
        return Ok(Value::Number(number));
    }

    Ok(Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_kinds() {
        let set: Override = "trainer.devices=1".parse().unwrap();
        assert_eq!(set.kind, OverrideKind::Set);
        assert_eq!(set.key, "trainer.devices");
        assert_eq!(set.value, json!(1));

        let add: Override = "+model.extra=x".parse().unwrap();
        assert_eq!(add.kind, OverrideKind::Add);

        let force: Override = "++exp_manager.name=run".parse().unwrap();
        assert_eq!(force.kind, OverrideKind::ForceSet);

        let delete: Override = "~model.restore_path".parse().unwrap();
        assert_eq!(delete.kind, OverrideKind::Delete);
    }

    #[test]
    fn test_value_types() {
        assert_eq!(parse_value("null").unwrap(), Value::Null);
        assert_eq!(parse_value("True").unwrap(), json!(true));
        assert_eq!(parse_value("32").unwrap(), json!(32));
        assert_eq!(parse_value("1e-4").unwrap(), json!(1e-4));
        assert_eq!(parse_value("'16'").unwrap(), json!("16"));
        assert_eq!(parse_value("bf16").unwrap(), json!("bf16"));
        assert_eq!(parse_value("[0.9, 0.98]").unwrap(), json!([0.9, 0.98]));
        assert_eq!(parse_value("[a,b]").unwrap(), json!(["a", "b"]));
        assert_eq!(parse_value("00:01:00:00").unwrap(), json!("00:01:00:00"));
        assert_eq!(
            parse_value("/data/fisher_tarred/audio__OP_0..18_CL_.tar").unwrap(),
            json!("/data/fisher_tarred/audio__OP_0..18_CL_.tar")
        );
    }

    #[test]
    fn test_nested_lists() {
        assert_eq!(parse_value("[[1,2],[3]]").unwrap(), json!([[1, 2], [3]]));
        assert_eq!(parse_value("[[a,b],[c]]").unwrap(), json!([["a", "b"], ["c"]]));
        assert_eq!(parse_value("['x,y', z]").unwrap(), json!(["x,y", "z"]));
        assert_eq!(parse_value(r#"[{"k": 1}, b]"#).unwrap(), json!([{"k": 1}, "b"]));
        assert!(parse_value("[[a,b]").is_err());
        assert!(parse_value("[a]]").is_err());
    }

    #[test]
    fn test_value_containing_equals() {
        let item: Override = "exp_manager.name=a=b".parse().unwrap();
        assert_eq!(item.value, json!("a=b"));
    }

    #[test]
    fn test_malformed_overrides_name_the_text() {
        for text in ["trainer.devices", "=1", "trainer..devices=1", "x='abc", "~a=1"] {
            let err = text.parse::<Override>().unwrap_err();
            assert!(
                matches!(err, ConfigError::MalformedOverride { text: ref t, .. } if t == text),
                "unexpected error for {text}: {err}"
            );
        }
    }
}
