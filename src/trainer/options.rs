use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;

/// Numeric training precision as written in `trainer.precision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Half,
    Bf16,
    Full,
    Double,
}

impl Precision {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: "trainer.precision".to_string(),
            source: serde::de::Error::custom(format!("unsupported precision {value}")),
        };
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(16) => Ok(Self::Half),
                Some(32) => Ok(Self::Full),
                Some(64) => Ok(Self::Double),
                _ => Err(invalid()),
            },
            Value::String(s) => match s.as_str() {
                "16" | "16-mixed" => Ok(Self::Half),
                "bf16" | "bf16-mixed" => Ok(Self::Bf16),
                "32" | "32-true" => Ok(Self::Full),
                "64" | "64-true" => Ok(Self::Double),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Half => write!(f, "16"),
            Self::Bf16 => write!(f, "bf16"),
            Self::Full => write!(f, "32"),
            Self::Double => write!(f, "64"),
        }
    }
}

/// Integer batch count or fraction of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchLimit {
    Count(usize),
    Fraction(f64),
}

impl BatchLimit {
    pub fn resolve(&self, available: Option<usize>) -> Option<usize> {
        match (self, available) {
            (Self::Count(n), _) => Some(*n),
            (Self::Fraction(f), Some(total)) => Some(((total as f64) * f.clamp(0.0, 1.0)).floor() as usize),
            (Self::Fraction(f), None) if *f >= 1.0 => None,
            (Self::Fraction(_), None) => Some(0),
        }
    }
}

/// Options read from the `trainer` section. Keys not listed here are kept in
/// `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerOptions {
    pub devices: Value,
    pub num_nodes: usize,
    pub accelerator: Option<String>,
    pub precision: Value,
    pub max_epochs: Option<i64>,
    pub max_steps: i64,
    pub max_time: Option<Value>,
    pub log_every_n_steps: usize,
    pub check_val_every_n_epoch: usize,
    pub limit_train_batches: Option<BatchLimit>,
    pub limit_val_batches: Option<BatchLimit>,
    pub accumulate_grad_batches: usize,
    pub gradient_clip_val: Option<f32>,
    pub enable_checkpointing: bool,
    pub default_root_dir: Option<PathBuf>,
    pub strategy: Option<String>,
    pub plugins: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            devices: Value::from(1),
            num_nodes: 1,
            accelerator: None,
            precision: Value::from(32),
            max_epochs: None,
            max_steps: -1,
            max_time: None,
            log_every_n_steps: 50,
            check_val_every_n_epoch: 1,
            limit_train_batches: None,
            limit_val_batches: None,
            accumulate_grad_batches: 1,
            gradient_clip_val: None,
            enable_checkpointing: true,
            default_root_dir: None,
            strategy: None,
            plugins: None,
            extra: Map::new(),
        }
    }
}

impl TrainerOptions {
    pub fn precision(&self) -> Result<Precision, ConfigError> {
        Precision::from_value(&self.precision)
    }

    /// Devices requested per node: an integer, a list of ids, or `"auto"`/`-1`.
    pub fn device_count(&self) -> usize {
        match &self.devices {
            Value::Number(n) => n.as_u64().map(|n| n.max(1) as usize).unwrap_or(1),
            Value::Array(ids) => ids.len().max(1),
            Value::String(s) => s.parse::<usize>().unwrap_or(1).max(1),
            _ => 1,
        }
    }

    /// Epoch budget: `max_epochs`, or 1000 when neither epochs nor steps bound the run.
    pub fn epoch_budget(&self) -> usize {
        match self.max_epochs {
            Some(n) if n >= 0 => n as usize,
            Some(_) => usize::MAX,
            None if self.max_steps >= 0 => usize::MAX,
            None => 1000,
        }
    }

    pub fn step_budget(&self) -> Option<usize> {
        (self.max_steps >= 0).then_some(self.max_steps as usize)
    }

    pub fn max_duration(&self) -> Result<Option<Duration>, ConfigError> {
        match &self.max_time {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_max_time(value).map(Some),
        }
    }

    pub fn root_dir(&self) -> PathBuf {
        self.default_root_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// `"DD:HH:MM:SS"`, `{days, hours, minutes, seconds}` or plain seconds.
pub fn parse_max_time(value: &Value) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "trainer.max_time".to_string(),
        source: serde::de::Error::custom(reason),
    };

    match value {
        Value::String(text) => {
            let parts: Vec<&str> = text.split(':').collect();
            if parts.len() != 4 {
                return Err(invalid(format!("expected DD:HH:MM:SS, got '{text}'")));
            }
            let mut units = [0u64; 4];
            for (slot, part) in units.iter_mut().zip(&parts) {
                *slot = part
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("'{part}' is not a whole number in '{text}'")))?;
            }
            let [days, hours, minutes, seconds] = units;
            Ok(Duration::from_secs(
                days * 86_400 + hours * 3_600 + minutes * 60 + seconds,
            ))
        }
        Value::Object(map) => {
            let mut total = 0.0;
            for (unit, scale) in [("days", 86_400.0), ("hours", 3_600.0), ("minutes", 60.0), ("seconds", 1.0)] {
                if let Some(amount) = map.get(unit) {
                    let amount = amount
                        .as_f64()
                        .ok_or_else(|| invalid(format!("'{unit}' must be a number")))?;
                    total += amount * scale;
                }
            }
            if let Some(unknown) = map
                .keys()
                .find(|k| !matches!(k.as_str(), "days" | "hours" | "minutes" | "seconds"))
            {
                return Err(invalid(format!("unknown unit '{unknown}'")));
            }
            if total < 0.0 {
                return Err(invalid("duration must not be negative".to_string()));
            }
            Ok(Duration::from_secs_f64(total))
        }
        Value::Number(n) => n
            .as_f64()
            .filter(|s| *s >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| invalid(format!("invalid number of seconds {n}"))),
        other => Err(invalid(format!("unsupported max_time {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precision_values() {
        assert_eq!(Precision::from_value(&json!(16)).unwrap(), Precision::Half);
        assert_eq!(Precision::from_value(&json!("16-mixed")).unwrap(), Precision::Half);
        assert_eq!(Precision::from_value(&json!("bf16")).unwrap(), Precision::Bf16);
        assert_eq!(Precision::from_value(&json!(32)).unwrap(), Precision::Full);
        assert!(Precision::from_value(&json!(8)).is_err());
    }

    #[test]
    fn test_max_time_formats() {
        assert_eq!(
            parse_max_time(&json!("00:01:30:00")).unwrap(),
            Duration::from_secs(5_400)
        );
        assert_eq!(
            parse_max_time(&json!({"hours": 1, "minutes": 30})).unwrap(),
            Duration::from_secs(5_400)
        );
        assert_eq!(parse_max_time(&json!(90)).unwrap(), Duration::from_secs(90));
        assert!(parse_max_time(&json!("01:30:00")).is_err());
        assert!(parse_max_time(&json!({"weeks": 1})).is_err());
    }

    #[test]
    fn test_unknown_options_are_kept() {
        let options: TrainerOptions = serde_json::from_value(json!({
            "devices": 2,
            "max_epochs": 3,
            "replace_sampler_ddp": false,
            "benchmark": false
        }))
        .unwrap();
        assert_eq!(options.device_count(), 2);
        assert_eq!(options.epoch_budget(), 3);
        assert_eq!(options.extra.len(), 2);
        assert_eq!(options.extra.get("replace_sampler_ddp"), Some(&json!(false)));
    }

    #[test]
    fn test_epoch_and_step_budgets() {
        let defaults = TrainerOptions::default();
        assert_eq!(defaults.epoch_budget(), 1000);
        assert_eq!(defaults.step_budget(), None);

        let steps_only = TrainerOptions {
            max_steps: 20,
            ..TrainerOptions::default()
        };
        assert_eq!(steps_only.epoch_budget(), usize::MAX);
        assert_eq!(steps_only.step_budget(), Some(20));
    }

    #[test]
    fn test_batch_limits() {
        let fraction: BatchLimit = serde_json::from_value(json!(0.5)).unwrap();
        assert_eq!(fraction.resolve(Some(10)), Some(5));
        let count: BatchLimit = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(count.resolve(None), Some(3));
        let full: BatchLimit = serde_json::from_value(json!(1.0)).unwrap();
        assert_eq!(full.resolve(None), None);
    }
}
