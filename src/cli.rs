use clap::Args;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, ConfigTree};

/// Arguments shared by the training binaries:
/// `--config-path=DIR --config-name=NAME key=value ...`
#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    /// Directory holding the base configuration
    #[arg(long = "config-path")]
    pub config_path: Option<PathBuf>,

    /// Base configuration file name (`.json` is appended when no extension is given)
    #[arg(long = "config-name")]
    pub config_name: Option<String>,

    /// Dotted-path overrides: `a.b=v`, `+a.b=v`, `++a.b=v`, `~a.b`
    #[arg(value_name = "OVERRIDE")]
    pub overrides: Vec<String>,
}

impl LaunchArgs {
    pub fn config_file(&self, default_path: &str, default_name: &str) -> PathBuf {
        let dir = self
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_path));
        let name = self.config_name.as_deref().unwrap_or(default_name);
        resolve_config_file(&dir, name)
    }

    /// Base file, then overrides in order, then interpolation.
    pub fn load_config(&self, default_path: &str, default_name: &str) -> Result<ConfigTree, ConfigError> {
        let path = self.config_file(default_path, default_name);
        info!("Loading configuration from: {:?}", path);

        let mut cfg = ConfigTree::load(&path)?;
        cfg.apply_overrides(&self.overrides)?;
        cfg.resolve_interpolations()?;
        Ok(cfg)
    }
}

fn resolve_config_file(dir: &Path, name: &str) -> PathBuf {
    let file = dir.join(name);
    if file.extension().is_some() {
        file
    } else {
        file.with_extension("json")
    }
}

/// Install the `tracing` subscriber used by every binary.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        launch: LaunchArgs,
    }

    #[test]
    fn test_hydra_style_arguments() {
        let cli = TestCli::parse_from([
            "train",
            "--config-path=../conf/neural_diarizer",
            "--config-name=deep_diarize.json",
            "trainer.devices=1",
            "+model.extra=1",
            "~exp_manager.name",
        ]);
        assert_eq!(cli.launch.config_path, Some(PathBuf::from("../conf/neural_diarizer")));
        assert_eq!(cli.launch.config_name.as_deref(), Some("deep_diarize.json"));
        assert_eq!(cli.launch.overrides.len(), 3);
    }

    #[test]
    fn test_config_name_gets_json_extension() {
        let args = LaunchArgs {
            config_path: None,
            config_name: Some("deep_diarize".to_string()),
            overrides: Vec::new(),
        };
        assert_eq!(
            args.config_file("conf", "ignored"),
            PathBuf::from("conf/deep_diarize.json")
        );
    }

    #[test]
    fn test_load_config_applies_overrides_and_interpolation() {
        let dir = TempDir::new().unwrap();
        let base = json!({
            "trainer": {"precision": 32},
            "model": {"precision": "${trainer.precision}"}
        });
        fs::write(dir.path().join("base.json"), base.to_string()).unwrap();

        let args = LaunchArgs {
            config_path: Some(dir.path().to_path_buf()),
            config_name: Some("base".to_string()),
            overrides: vec!["trainer.precision=16".to_string()],
        };
        let cfg = args.load_config("unused", "unused").unwrap();
        assert_eq!(cfg.get("model.precision"), Some(&json!(16)));
    }

    #[test]
    fn test_missing_base_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let args = LaunchArgs {
            config_path: Some(dir.path().to_path_buf()),
            config_name: None,
            overrides: Vec::new(),
        };
        let err = args.load_config("unused", "missing").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
