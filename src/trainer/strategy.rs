use serde::Serialize;
use std::fmt;

use crate::config::ConfigError;

/// Data-parallel strategy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DdpStrategy {
    pub no_ddp_communication_hook: bool,
    pub find_unused_parameters: bool,
}

impl Default for DdpStrategy {
    fn default() -> Self {
        Self {
            no_ddp_communication_hook: false,
            find_unused_parameters: true,
        }
    }
}

impl DdpStrategy {
    /// Communication hook and unused-parameter detection both disabled.
    pub fn without_hooks() -> Self {
        Self {
            no_ddp_communication_hook: true,
            find_unused_parameters: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    Auto,
    SingleDevice,
    Ddp(DdpStrategy),
}

impl Strategy {
    pub fn from_name(name: Option<&str>) -> Result<Self, ConfigError> {
        match name {
            None | Some("auto") => Ok(Self::Auto),
            Some("single_device") => Ok(Self::SingleDevice),
            Some("ddp") | Some("ddp_spawn") => Ok(Self::Ddp(DdpStrategy::default())),
            Some("ddp_find_unused_parameters_false") => Ok(Self::Ddp(DdpStrategy {
                find_unused_parameters: false,
                ..DdpStrategy::default()
            })),
            Some(other) => Err(ConfigError::InvalidValue {
                key: "trainer.strategy".to_string(),
                source: serde::de::Error::custom(format!("unknown strategy '{other}'")),
            }),
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, Self::Ddp(_))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::SingleDevice => write!(f, "single_device"),
            Self::Ddp(ddp) => write!(
                f,
                "ddp(no_ddp_communication_hook={}, find_unused_parameters={})",
                ddp.no_ddp_communication_hook, ddp.find_unused_parameters
            ),
        }
    }
}
