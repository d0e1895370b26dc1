use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::loader::Collate;

/// One line of a diarization manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub feature_filepath: PathBuf,
    pub rttm_filepath: PathBuf,
    #[serde(default)]
    pub uniq_id: Option<String>,
}

/// `model.train_ds` / `model.validation_ds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiarizeDatasetConfig {
    pub manifest_filepath: Option<PathBuf>,
    pub batch_size: usize,
    pub shuffle: bool,
    /// Sessions generated when no manifest is configured.
    pub synthetic_sessions: usize,
}

impl Default for DiarizeDatasetConfig {
    fn default() -> Self {
        Self {
            manifest_filepath: None,
            batch_size: 4,
            shuffle: true,
            synthetic_sessions: 8,
        }
    }
}

/// Frame geometry shared by every dataset of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLayout {
    pub feat_dim: usize,
    pub max_speakers: usize,
    /// Seconds per feature frame.
    pub frame_shift: f64,
    /// Frames per training segment.
    pub segment_frames: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub start: f64,
    pub duration: f64,
}

/// Relative paths in a manifest resolve against the manifest's directory.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(path).with_context(|| format!("Failed to open manifest {:?}", path))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut entry: ManifestEntry = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid manifest entry", path.display(), idx + 1))?;
        if entry.feature_filepath.is_relative() {
            entry.feature_filepath = base.join(&entry.feature_filepath);
        }
        if entry.rttm_filepath.is_relative() {
            entry.rttm_filepath = base.join(&entry.rttm_filepath);
        }
        entries.push(entry);
    }
    info!("Manifest {:?}: {} sessions", path, entries.len());
    Ok(entries)
}

/// Parse `SPEAKER` lines of an RTTM file; other record types are skipped.
pub fn parse_rttm(text: &str, origin: &str) -> Result<Vec<SpeakerTurn>> {
    let mut turns = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"SPEAKER") {
            continue;
        }
        if fields.len() < 8 {
            bail!("{}:{}: expected at least 8 fields, found {}", origin, idx + 1, fields.len());
        }
        let start: f64 = fields[3]
            .parse()
            .with_context(|| format!("{}:{}: bad onset '{}'", origin, idx + 1, fields[3]))?;
        let duration: f64 = fields[4]
            .parse()
            .with_context(|| format!("{}:{}: bad duration '{}'", origin, idx + 1, fields[4]))?;
        if start < 0.0 || duration < 0.0 {
            bail!("{}:{}: negative onset or duration", origin, idx + 1);
        }
        turns.push(SpeakerTurn {
            speaker: fields[7].to_string(),
            start,
            duration,
        });
    }
    Ok(turns)
}

/// Per-frame speaker activity, `num_frames x max_speakers`, row-major.
///
/// Speakers take columns in order of first appearance; extra speakers are dropped.
pub fn frame_labels(turns: &[SpeakerTurn], num_frames: usize, frame_shift: f64, max_speakers: usize) -> Vec<i64> {
    let mut labels = vec![0i64; num_frames * max_speakers];
    let mut speakers: Vec<&str> = Vec::new();
    let mut dropped = false;

    let mut ordered: Vec<&SpeakerTurn> = turns.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    for turn in ordered {
        let column = match speakers.iter().position(|s| *s == turn.speaker) {
            Some(column) => column,
            None if speakers.len() < max_speakers => {
                speakers.push(&turn.speaker);
                speakers.len() - 1
            }
            None => {
                dropped = true;
                continue;
            }
        };
        let first = (turn.start / frame_shift).round() as usize;
        let last = (((turn.start + turn.duration) / frame_shift).round() as usize).min(num_frames);
        for frame in first..last {
            labels[frame * max_speakers + column] = 1;
        }
    }
    if dropped {
        warn!("More than {} speakers in session, extra speakers ignored", max_speakers);
    }
    labels
}

/// Feature file: a JSON array of frames, each an array of `feat_dim` numbers.
pub fn load_features(path: &Path, feat_dim: usize) -> Result<Vec<Vec<f32>>> {
    let json = fs::read_to_string(path).with_context(|| format!("Failed to read features {:?}", path))?;
    let frames: Vec<Vec<f32>> =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse features {:?}", path))?;
    if let Some((idx, frame)) = frames.iter().enumerate().find(|(_, f)| f.len() != feat_dim) {
        bail!(
            "{:?}: frame {} has {} features, expected {}",
            path,
            idx,
            frame.len(),
            feat_dim
        );
    }
    Ok(frames)
}

/// Fixed-length training window.
#[derive(Debug, Clone, PartialEq)]
pub struct DiarizeSample {
    /// `segment_frames x feat_dim`
    pub features: Vec<f32>,
    /// `segment_frames x max_speakers`
    pub labels: Vec<i64>,
}

/// Cut a session into windows; the last one is zero padded.
pub fn segment_session(features: &[Vec<f32>], labels: &[i64], layout: &FrameLayout) -> Vec<DiarizeSample> {
    let FrameLayout {
        feat_dim,
        max_speakers,
        segment_frames,
        ..
    } = *layout;
    let segment_frames = segment_frames.max(1);

    let mut samples = Vec::new();
    let mut start = 0;
    while start < features.len() {
        let end = (start + segment_frames).min(features.len());
        let mut feats = vec![0.0f32; segment_frames * feat_dim];
        let mut labs = vec![0i64; segment_frames * max_speakers];
        for (offset, frame) in (start..end).enumerate() {
            feats[offset * feat_dim..(offset + 1) * feat_dim].copy_from_slice(&features[frame]);
            labs[offset * max_speakers..(offset + 1) * max_speakers]
                .copy_from_slice(&labels[frame * max_speakers..(frame + 1) * max_speakers]);
        }
        samples.push(DiarizeSample {
            features: feats,
            labels: labs,
        });
        start = end;
    }
    samples
}

pub fn load_session(entry: &ManifestEntry, layout: &FrameLayout) -> Result<Vec<DiarizeSample>> {
    let features = load_features(&entry.feature_filepath, layout.feat_dim)?;
    let rttm = fs::read_to_string(&entry.rttm_filepath)
        .with_context(|| format!("Failed to read RTTM {:?}", entry.rttm_filepath))?;
    let turns = parse_rttm(&rttm, &entry.rttm_filepath.display().to_string())?;
    let labels = frame_labels(&turns, features.len(), layout.frame_shift, layout.max_speakers);
    Ok(segment_session(&features, &labels, layout))
}

pub fn load_dataset(manifest: &Path, layout: &FrameLayout) -> Result<Vec<DiarizeSample>> {
    let mut samples = Vec::new();
    for entry in load_manifest(manifest)? {
        samples.extend(load_session(&entry, layout)?);
    }
    Ok(samples)
}

/// Seeded sessions: each speaker has its own feature centroid, turns alternate
/// with occasional overlap and silence.
pub fn synthetic_sessions(sessions: usize, layout: &FrameLayout, seed: u64) -> Vec<DiarizeSample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let speakers = layout.max_speakers.max(1);
    let centroids: Vec<Vec<f32>> = (0..speakers)
        .map(|_| (0..layout.feat_dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();

    let mut samples = Vec::new();
    for _ in 0..sessions {
        let num_frames = layout.segment_frames * rng.gen_range(1..=3);
        let mut turns = Vec::new();
        let mut t = 0.0;
        let total = num_frames as f64 * layout.frame_shift;
        while t < total {
            let duration = layout.frame_shift * rng.gen_range(4..16) as f64;
            let speaker = rng.gen_range(0..speakers);
            turns.push(SpeakerTurn {
                speaker: format!("spk{speaker}"),
                start: t,
                duration,
            });
            if rng.gen_bool(0.2) {
                let other = (speaker + 1) % speakers;
                turns.push(SpeakerTurn {
                    speaker: format!("spk{other}"),
                    start: t + duration / 2.0,
                    duration: duration / 2.0,
                });
            }
            t += duration + layout.frame_shift * rng.gen_range(0..4) as f64;
        }

        let labels = frame_labels(&turns, num_frames, layout.frame_shift, speakers);
        let features: Vec<Vec<f32>> = (0..num_frames)
            .map(|frame| {
                (0..layout.feat_dim)
                    .map(|d| {
                        let active: f32 = (0..speakers)
                            .filter(|&s| labels[frame * speakers + s] == 1)
                            .map(|s| centroids[s][d])
                            .sum();
                        active + rng.gen_range(-0.1..0.1)
                    })
                    .collect()
            })
            .collect();
        samples.extend(segment_session(&features, &labels, layout));
    }
    samples
}

#[derive(Clone, Debug)]
pub struct DiarizeBatch<B: Backend> {
    /// `[batch, frames, feat_dim]`
    pub features: Tensor<B, 3>,
    /// `[batch, frames, max_speakers]`
    pub labels: Tensor<B, 3, Int>,
}

#[derive(Debug, Clone)]
pub struct DiarizeCollate {
    pub layout: FrameLayout,
}

impl<B: Backend> Collate<B> for DiarizeCollate {
    type Item = DiarizeSample;
    type Batch = DiarizeBatch<B>;

    fn collate(&self, items: &[&DiarizeSample], device: &B::Device) -> DiarizeBatch<B> {
        let b = items.len();
        let frames = self.layout.segment_frames;
        let features: Vec<f32> = items.iter().flat_map(|s| s.features.iter().copied()).collect();
        let labels: Vec<i64> = items.iter().flat_map(|s| s.labels.iter().copied()).collect();

        DiarizeBatch {
            features: Tensor::<B, 1>::from_floats(features.as_slice(), device)
                .reshape([b, frames, self.layout.feat_dim]),
            labels: Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device)
                .reshape([b, frames, self.layout.max_speakers]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use serde_json::json;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn layout() -> FrameLayout {
        FrameLayout {
            feat_dim: 2,
            max_speakers: 2,
            frame_shift: 0.1,
            segment_frames: 4,
        }
    }

    const RTTM: &str = "\
SPEAKER sess1 1 0.00 0.30 <NA> <NA> alice <NA> <NA>
SPEAKER sess1 1 0.20 0.30 <NA> <NA> bob <NA> <NA>
SPKR-INFO sess1 1 <NA> <NA> <NA> unknown carol <NA> <NA>
SPEAKER sess1 1 0.50 0.10 <NA> <NA> carol <NA> <NA>
";

    #[test]
    fn test_parse_rttm_skips_other_records() {
        let turns = parse_rttm(RTTM, "sess1.rttm").unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].speaker, "bob");
        assert!((turns[1].start - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_parse_rttm_reports_line() {
        let err = parse_rttm("SPEAKER s 1 zero 0.1 <NA> <NA> a <NA> <NA>", "x.rttm").unwrap_err();
        assert!(err.to_string().contains("x.rttm:1"));
    }

    #[test]
    fn test_frame_labels_overlap_and_speaker_limit() {
        let turns = parse_rttm(RTTM, "sess1.rttm").unwrap();
        let labels = frame_labels(&turns, 6, 0.1, 2);
        // frames x [alice, bob]; carol is a third speaker and is dropped
        assert_eq!(labels, vec![1, 0, 1, 0, 1, 1, 0, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn test_segment_pads_last_window() {
        let features: Vec<Vec<f32>> = (0..6).map(|i| vec![i as f32, -(i as f32)]).collect();
        let labels = vec![1i64; 12];
        let samples = segment_session(&features, &labels, &layout());
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].features[..4], [4.0, -4.0, 5.0, -5.0]);
        assert!(samples[1].features[4..].iter().all(|&v| v == 0.0));
        assert_eq!(samples[1].labels, vec![1, 1, 1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_load_dataset_from_manifest() {
        let dir = TempDir::new().unwrap();
        let features: Vec<Vec<f32>> = (0..5).map(|_| vec![0.5, 0.5]).collect();
        fs::write(dir.path().join("s1.json"), serde_json::to_string(&features).unwrap()).unwrap();
        fs::write(dir.path().join("s1.rttm"), RTTM).unwrap();
        let manifest = dir.path().join("train.json");
        fs::write(
            &manifest,
            json!({"feature_filepath": "s1.json", "rttm_filepath": "s1.rttm"}).to_string() + "\n",
        )
        .unwrap();

        let samples = load_dataset(&manifest, &layout()).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels[..2], [1, 0]);
    }

    #[test]
    fn test_feature_dim_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "[[1.0, 2.0], [3.0]]").unwrap();
        let err = load_features(&path, 2).unwrap_err();
        assert!(err.to_string().contains("frame 1"));
    }

    #[test]
    fn test_synthetic_collate_shapes() {
        let layout = layout();
        let samples = synthetic_sessions(3, &layout, 11);
        assert!(samples.len() >= 3);
        assert_eq!(samples, synthetic_sessions(3, &layout, 11));

        let collate = DiarizeCollate { layout };
        let refs: Vec<&DiarizeSample> = samples.iter().take(2).collect();
        let batch: DiarizeBatch<TestBackend> = Collate::<TestBackend>::collate(&collate, &refs, &Default::default());
        assert_eq!(batch.features.dims(), [2, 4, 2]);
        assert_eq!(batch.labels.dims(), [2, 4, 2]);
    }
}
