use burn::module::{Module, ModuleVisitor, Param};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Int, Tensor};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{CheckpointError, CheckpointMeta, Checkpointable, TrainingProgress};

pub const META_FILE: &str = "meta.json";
pub const OPTIMIZER_FILE: &str = "optimizer.mpk";

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn with_mpk_extension(path: &Path) -> PathBuf {
    if path.extension().and_then(|e| e.to_str()) == Some("mpk") {
        path.to_path_buf()
    } else {
        path.with_extension("mpk")
    }
}

/// Write any burn record to `path` (`.mpk`).
pub fn save_record<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<(), CheckpointError> {
    let path = with_mpk_extension(path);
    Recorder::<B>::record(&recorder(), record, path.clone())
        .map_err(|source| CheckpointError::Record {
            name: path.display().to_string(),
            path: path.clone(),
            source,
        })?;
    debug!("Record written to {:?}", path);
    Ok(())
}

pub fn load_record<B: Backend, R: Record<B>>(path: &Path, device: &B::Device) -> Result<R, CheckpointError> {
    let path = with_mpk_extension(path);
    if !path.exists() {
        return Err(CheckpointError::NotFound(path));
    }
    Recorder::<B>::load(&recorder(), path.clone(), device)
        .map_err(|source| CheckpointError::Record {
            name: path.display().to_string(),
            path,
            source,
        })
}

/// Dotted parameter paths and their shapes, in visit order.
#[derive(Default)]
struct ParamShapes {
    path: Vec<String>,
    shapes: Vec<(String, Vec<usize>)>,
}

impl ParamShapes {
    fn of<B: Backend, M: Module<B>>(module: &M) -> Vec<(String, Vec<usize>)> {
        let mut visitor = Self::default();
        module.visit(&mut visitor);
        visitor.shapes
    }

    fn push(&mut self, dims: &[usize]) {
        self.shapes.push((self.path.join("."), dims.to_vec()));
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.push(&param.val().dims());
    }

    fn visit_int<const D: usize>(&mut self, param: &Param<Tensor<B, D, Int>>) {
        self.push(&param.val().dims());
    }

    fn visit_bool<const D: usize>(&mut self, param: &Param<Tensor<B, D, Bool>>) {
        self.push(&param.val().dims());
    }

    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }
}

/// Apply `record` to `module`, failing on the first parameter whose stored
/// shape differs from the one the module was built with.
fn load_checked<B: Backend, M: Module<B>>(module: M, record: M::Record, path: &Path) -> Result<M, CheckpointError> {
    let expected = ParamShapes::of::<B, M>(&module);
    let loaded = module.load_record(record);
    let found = ParamShapes::of::<B, M>(&loaded);
    for ((param, expected), (_, found)) in expected.into_iter().zip(found) {
        if expected != found {
            return Err(CheckpointError::ParamShape {
                path: path.to_path_buf(),
                param,
                expected,
                found,
            });
        }
    }
    Ok(loaded)
}

pub fn save_component<B: Backend, M: Module<B>>(module: &M, dir: &Path, name: &str) -> Result<(), CheckpointError> {
    save_record(module.clone().into_record(), &dir.join(format!("{name}.mpk")))
}

pub fn load_component<B: Backend, M: Module<B>>(
    module: M,
    dir: &Path,
    name: &str,
    device: &B::Device,
) -> Result<M, CheckpointError> {
    let path = dir.join(format!("{name}.mpk"));
    let record = load_record::<B, M::Record>(&path, device)?;
    load_checked(module, record, &path)
}

/// Save every component of `model` plus metadata into the directory `dir`.
pub fn save_model<B: Backend, M: Checkpointable<B>>(
    model: &M,
    dir: &Path,
    progress: Option<TrainingProgress>,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;

    let components = model.component_specs();
    for spec in &components {
        model.save_component(&spec.name, dir)?;
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let meta = CheckpointMeta {
        model_config: model.model_config(),
        components,
        progress,
        timestamp,
    };

    let meta_path = dir.join(META_FILE);
    let meta_json = serde_json::to_string_pretty(&meta).map_err(|e| CheckpointError::Metadata {
        path: meta_path.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&meta_path, meta_json).map_err(io_error(&meta_path))?;

    info!("Checkpoint saved: {:?}", dir);
    Ok(dir.to_path_buf())
}

pub fn read_meta(dir: &Path) -> Result<CheckpointMeta, CheckpointError> {
    if !dir.exists() {
        return Err(CheckpointError::NotFound(dir.to_path_buf()));
    }
    let meta_path = dir.join(META_FILE);
    if !meta_path.exists() {
        return Err(CheckpointError::Metadata {
            path: meta_path,
            reason: "missing metadata file".to_string(),
        });
    }
    let meta_json = fs::read_to_string(&meta_path).map_err(io_error(&meta_path))?;
    serde_json::from_str(&meta_json).map_err(|e| CheckpointError::Metadata {
        path: meta_path,
        reason: e.to_string(),
    })
}

/// Whole-model weights as a single record file, independent of the checkpoint layout.
pub fn save_state_dict<B: Backend, M: Module<B>>(model: &M, path: &Path) -> Result<PathBuf, CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    save_record(model.clone().into_record(), path)?;
    Ok(with_mpk_extension(path))
}

pub fn load_state_dict<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, CheckpointError> {
    if !with_mpk_extension(path).exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let record = load_record::<B, M::Record>(path, device)?;
    let model = load_checked(model, record, path)?;
    info!("Loaded model weights from {:?}", path);
    Ok(model)
}

pub fn remove_checkpoint(dir: &Path) -> Result<(), CheckpointError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_error(dir))?;
        debug!("Removed checkpoint {:?}", dir);
    }
    Ok(())
}

/// Trainer checkpoints directly under `dir`, ordered by global step.
pub fn list_checkpoints(dir: &Path) -> Vec<(PathBuf, usize)> {
    if !dir.exists() {
        warn!("Checkpoint directory does not exist: {:?}", dir);
        return Vec::new();
    }

    let mut checkpoints = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        if let Ok(meta) = read_meta(entry.path()) {
            if let Some(progress) = meta.progress {
                checkpoints.push((entry.path().to_path_buf(), progress.global_step));
            }
        }
    }

    checkpoints.sort_by_key(|(_, step)| *step);
    checkpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_empty_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        assert!(list_checkpoints(temp_dir.path()).is_empty());
        assert!(list_checkpoints(&temp_dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_read_meta_missing_dir_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        let err = read_meta(&missing).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_read_meta_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(META_FILE), "not json").unwrap();
        assert!(matches!(
            read_meta(temp_dir.path()),
            Err(CheckpointError::Metadata { .. })
        ));
    }

    #[test]
    fn test_mpk_extension() {
        assert_eq!(with_mpk_extension(Path::new("a/w.mpk")), PathBuf::from("a/w.mpk"));
        assert_eq!(with_mpk_extension(Path::new("a/w")), PathBuf::from("a/w.mpk"));
    }
}
