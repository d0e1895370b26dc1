use serde::Serialize;
use tracing::info;

use super::environment::ElasticEnvironment;
use super::options::Precision;
use crate::backend::ACCELERATOR;
use crate::config::{ConfigError, ConfigTree};

/// `cluster_type` value selecting the elastic cluster environment.
pub const BATCH_CLUSTER: &str = "BCP";

const DEFAULT_INIT_SCALE: f64 = 4_294_967_296.0; // 2^32
const DEFAULT_GROWTH_INTERVAL: u64 = 1000;
const DEFAULT_HYSTERESIS: u32 = 2;

/// Dynamic loss-scale settings for half-precision training.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradScaler {
    pub init_scale: f64,
    pub growth_interval: u64,
    pub hysteresis: u32,
    pub enabled: bool,
}

impl GradScaler {
    /// Reads the scaler knobs from the `model` section. Scaling is disabled
    /// whenever the model is split into more than one pipeline stage, since
    /// scaler state is not coordinated across stages.
    pub fn from_config(cfg: &ConfigTree) -> Result<Self, ConfigError> {
        let pipeline_stages: i64 = cfg.get_or("model.pipeline_model_parallel_size", 1)?;
        Ok(Self {
            init_scale: cfg.get_or("model.native_amp_init_scale", DEFAULT_INIT_SCALE)?,
            growth_interval: cfg.get_or("model.native_amp_growth_interval", DEFAULT_GROWTH_INTERVAL)?,
            hysteresis: cfg.get_or("model.hysteresis", DEFAULT_HYSTERESIS)?,
            enabled: pipeline_stages <= 1,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecisionPlugin {
    pub precision: String,
    pub device: String,
    pub scaler: GradScaler,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plugin {
    Precision(PrecisionPlugin),
    ClusterEnvironment(ElasticEnvironment),
}

impl Plugin {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Precision(_) => "PipelineMixedPrecisionPlugin",
            Self::ClusterEnvironment(_) => "ElasticEnvironment",
        }
    }
}

/// One conditional entry of the plugin list.
pub struct PluginRule {
    pub name: &'static str,
    pub applies: fn(&ConfigTree) -> Result<bool, ConfigError>,
    pub build: fn(&ConfigTree) -> Result<Plugin, ConfigError>,
}

fn is_half_precision(cfg: &ConfigTree) -> Result<bool, ConfigError> {
    match cfg.get("trainer.precision") {
        None => Ok(false),
        Some(value) => Ok(Precision::from_value(value)? == Precision::Half),
    }
}

fn build_precision_plugin(cfg: &ConfigTree) -> Result<Plugin, ConfigError> {
    let scaler = GradScaler::from_config(cfg)?;
    let precision = cfg
        .get("trainer.precision")
        .map(|v| Precision::from_value(v).map(|p| p.to_string()))
        .transpose()?
        .unwrap_or_else(|| Precision::Half.to_string());
    Ok(Plugin::Precision(PrecisionPlugin {
        precision,
        device: ACCELERATOR.to_string(),
        scaler,
    }))
}

fn is_batch_cluster(cfg: &ConfigTree) -> Result<bool, ConfigError> {
    Ok(cfg.get_str("cluster_type") == Some(BATCH_CLUSTER))
}

fn build_cluster_environment(_cfg: &ConfigTree) -> Result<Plugin, ConfigError> {
    Ok(Plugin::ClusterEnvironment(ElasticEnvironment))
}

/// The plugin rules in the order the plugin list is assembled.
pub fn plugin_rules() -> [PluginRule; 2] {
    [
        PluginRule {
            name: "mixed_precision",
            applies: is_half_precision,
            build: build_precision_plugin,
        },
        PluginRule {
            name: "cluster_environment",
            applies: is_batch_cluster,
            build: build_cluster_environment,
        },
    ]
}

pub fn assemble_plugins(cfg: &ConfigTree) -> Result<Vec<Plugin>, ConfigError> {
    let mut plugins = Vec::new();
    for rule in plugin_rules() {
        if (rule.applies)(cfg)? {
            let plugin = (rule.build)(cfg)?;
            info!("Plugin {} enabled ({})", plugin.name(), rule.name);
            plugins.push(plugin);
        }
    }
    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(precision: serde_json::Value, pipeline: i64, cluster: Option<&str>) -> ConfigTree {
        let mut root = json!({
            "trainer": {"precision": precision},
            "model": {"pipeline_model_parallel_size": pipeline}
        });
        if let Some(cluster) = cluster {
            root["cluster_type"] = json!(cluster);
        }
        ConfigTree::new(root)
    }

    fn scaler(plugins: &[Plugin]) -> Option<&GradScaler> {
        plugins.iter().find_map(|p| match p {
            Plugin::Precision(pp) => Some(&pp.scaler),
            _ => None,
        })
    }

    #[test]
    fn test_scaler_disabled_for_pipeline_parallel() {
        for stages in [2, 4, 8] {
            let plugins = assemble_plugins(&cfg(json!(16), stages, None)).unwrap();
            assert!(!scaler(&plugins).unwrap().enabled, "stages = {stages}");
        }
        for stages in [0, 1] {
            let plugins = assemble_plugins(&cfg(json!(16), stages, None)).unwrap();
            assert!(scaler(&plugins).unwrap().enabled, "stages = {stages}");
        }
    }

    #[test]
    fn test_scaler_defaults_and_overrides() {
        let plugins = assemble_plugins(&cfg(json!(16), 1, None)).unwrap();
        let defaults = scaler(&plugins).unwrap();
        assert_eq!(defaults.init_scale, 4_294_967_296.0);
        assert_eq!(defaults.growth_interval, 1000);
        assert_eq!(defaults.hysteresis, 2);

        let mut custom = cfg(json!(16), 1, None);
        custom.set("model.native_amp_init_scale", json!(65536)).unwrap();
        custom.set("model.hysteresis", json!(5)).unwrap();
        let plugins = assemble_plugins(&custom).unwrap();
        assert_eq!(scaler(&plugins).unwrap().init_scale, 65536.0);
        assert_eq!(scaler(&plugins).unwrap().hysteresis, 5);
    }

    #[test]
    fn test_no_precision_plugin_at_full_precision() {
        for precision in [json!(32), json!("bf16")] {
            let plugins = assemble_plugins(&cfg(precision, 4, None)).unwrap();
            assert!(scaler(&plugins).is_none());
        }
    }

    #[test]
    fn test_elastic_plugin_only_for_batch_cluster() {
        let count = |plugins: &[Plugin]| {
            plugins
                .iter()
                .filter(|p| matches!(p, Plugin::ClusterEnvironment(_)))
                .count()
        };
        assert_eq!(count(&assemble_plugins(&cfg(json!(16), 1, Some("BCP"))).unwrap()), 1);
        assert_eq!(count(&assemble_plugins(&cfg(json!(32), 1, Some("BCP"))).unwrap()), 1);
        assert_eq!(count(&assemble_plugins(&cfg(json!(16), 1, Some("slurm"))).unwrap()), 0);
        assert_eq!(count(&assemble_plugins(&cfg(json!(16), 1, None)).unwrap()), 0);
    }

    #[test]
    fn test_plugin_order_is_fixed() {
        let plugins = assemble_plugins(&cfg(json!(16), 1, Some("BCP"))).unwrap();
        let names: Vec<&str> = plugins.iter().map(Plugin::name).collect();
        assert_eq!(names, vec!["PipelineMixedPrecisionPlugin", "ElasticEnvironment"]);
    }
}
