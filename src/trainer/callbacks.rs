use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    /// Elapsed time is saved in checkpoints and restored on resume.
    Stateful,
    /// Nothing is saved; every process start gets the full `max_time` budget.
    Stateless,
}

/// Wall-clock budget for a run (`trainer.max_time`).
#[derive(Debug, Clone)]
pub struct Timer {
    kind: TimerKind,
    duration: Duration,
    max_time: Value,
    started: Option<Instant>,
    offset: Duration,
}

impl Timer {
    pub fn new(kind: TimerKind, duration: Duration, max_time: Value) -> Self {
        Self {
            kind,
            duration,
            max_time,
            started: None,
            offset: Duration::ZERO,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The `trainer.max_time` value this timer was built from.
    pub fn max_time(&self) -> &Value {
        &self.max_time
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn time_elapsed(&self) -> Duration {
        self.offset + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn time_remaining(&self) -> Duration {
        self.duration.saturating_sub(self.time_elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.time_elapsed() >= self.duration
    }

    pub fn state_dict(&self) -> Option<Value> {
        match self.kind {
            TimerKind::Stateful => Some(json!({
                "time_elapsed": self.time_elapsed().as_secs_f64()
            })),
            TimerKind::Stateless => None,
        }
    }

    pub fn load_state_dict(&mut self, state: &Value) {
        match self.kind {
            TimerKind::Stateful => {
                if let Some(secs) = state.get("time_elapsed").and_then(Value::as_f64) {
                    self.offset = Duration::from_secs_f64(secs.max(0.0));
                    info!("Timer resumed with {:.1}s already elapsed", secs);
                }
            }
            TimerKind::Stateless => {
                debug!("Stateless timer ignores restored state");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointParams {
    pub monitor: String,
    pub mode: MonitorMode,
    pub save_top_k: i64,
    pub save_last: bool,
    pub every_n_epochs: usize,
    pub save_model_on_train_end: bool,
    pub filename_prefix: Option<String>,
}

impl Default for CheckpointParams {
    fn default() -> Self {
        Self {
            monitor: "val_loss".to_string(),
            mode: MonitorMode::Min,
            save_top_k: 3,
            save_last: true,
            every_n_epochs: 1,
            save_model_on_train_end: true,
            filename_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedCheckpoint {
    pub path: PathBuf,
    pub score: Option<f64>,
    pub step: usize,
}

/// Periodic checkpointing with top-k retention on the monitored metric.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    dirpath: PathBuf,
    prefix: String,
    params: CheckpointParams,
    kept: Vec<SavedCheckpoint>,
}

impl ModelCheckpoint {
    pub fn new(dirpath: PathBuf, prefix: &str, params: CheckpointParams) -> Self {
        let prefix = params
            .filename_prefix
            .clone()
            .unwrap_or_else(|| prefix.to_string());
        Self {
            dirpath,
            prefix,
            params,
            kept: Vec::new(),
        }
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    pub fn params(&self) -> &CheckpointParams {
        &self.params
    }

    pub fn should_save(&self, epochs_completed: usize) -> bool {
        self.params.save_top_k != 0
            && self.params.every_n_epochs > 0
            && epochs_completed % self.params.every_n_epochs == 0
    }

    pub fn checkpoint_path(&self, epoch: usize, step: usize, score: Option<f64>) -> PathBuf {
        let name = match score {
            Some(score) => format!(
                "{}--{}={:.4}-epoch={}-step={}",
                self.prefix, self.params.monitor, score, epoch, step
            ),
            None => format!("{}--epoch={}-step={}", self.prefix, epoch, step),
        };
        self.dirpath.join(name)
    }

    pub fn last_path(&self) -> PathBuf {
        self.dirpath.join(format!("{}-last", self.prefix))
    }

    /// Directory the final model is exported to at the end of training.
    pub fn model_export_path(&self) -> PathBuf {
        self.dirpath.join(format!("{}.model", self.prefix))
    }

    /// Record a newly written checkpoint and return the ones that fell out of the top k.
    pub fn register(&mut self, saved: SavedCheckpoint) -> Vec<PathBuf> {
        self.kept.retain(|c| c.path != saved.path);
        self.kept.push(saved);

        let mode = self.params.mode;
        self.kept.sort_by(|a, b| match (a.score, b.score) {
            (Some(x), Some(y)) => match mode {
                MonitorMode::Min => x.total_cmp(&y),
                MonitorMode::Max => y.total_cmp(&x),
            },
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.step.cmp(&a.step),
        });

        if self.params.save_top_k < 0 {
            return Vec::new();
        }
        let keep = self.params.save_top_k as usize;
        if self.kept.len() <= keep {
            return Vec::new();
        }
        self.kept.split_off(keep).into_iter().map(|c| c.path).collect()
    }

    pub fn state_dict(&self) -> Value {
        json!({ "kept": self.kept })
    }

    pub fn load_state_dict(&mut self, state: &Value) {
        if let Some(kept) = state
            .get("kept")
            .and_then(|v| serde_json::from_value::<Vec<SavedCheckpoint>>(v.clone()).ok())
        {
            self.kept = kept.into_iter().filter(|c| c.path.exists()).collect();
        }
    }
}

#[derive(Debug, Clone)]
pub enum Callback {
    Timer(Timer),
    ModelCheckpoint(ModelCheckpoint),
}

impl Callback {
    /// Key under which the callback state is stored in checkpoints.
    pub fn state_key(&self) -> &'static str {
        match self {
            Self::Timer(_) => "Timer",
            Self::ModelCheckpoint(_) => "ModelCheckpoint",
        }
    }

    pub fn state_dict(&self) -> Option<Value> {
        match self {
            Self::Timer(timer) => timer.state_dict(),
            Self::ModelCheckpoint(checkpoint) => Some(checkpoint.state_dict()),
        }
    }

    pub fn load_state_dict(&mut self, state: &Value) {
        match self {
            Self::Timer(timer) => timer.load_state_dict(state),
            Self::ModelCheckpoint(checkpoint) => checkpoint.load_state_dict(state),
        }
    }
}
