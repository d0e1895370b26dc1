// Library exports for the training binaries in scripts/

pub mod backend;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod exp_manager;
pub mod launch;
pub mod models;
pub mod trainer;

// Re-export commonly used types
pub use config::{ConfigError, ConfigTree};
pub use exp_manager::{ExpManager, ExpManagerConfig, ExperimentManager};
pub use models::{DeepDiarizeModel, ModelInit, TrainableModel, UniversalPromptModel};
pub use trainer::{Trainer, TrainerBuilder, TrainerOptions};
