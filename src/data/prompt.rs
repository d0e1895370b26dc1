use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

use super::loader::Collate;
use super::tokenizer::Tokenizer;

/// Placeholder the virtual prompt tokens are spliced into.
pub const VIRTUAL_PROMPT: &str = "<|VIRTUAL_PROMPT_0|>";

fn field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid field regex"))
}

/// One entry of `model.task_templates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub taskname: String,
    pub prompt_template: String,
    pub total_virtual_tokens: usize,
    #[serde(default)]
    pub answer_only_loss: bool,
    #[serde(default)]
    pub answer_field: Option<String>,
}

impl TaskTemplate {
    pub fn validate(&self) -> Result<()> {
        if !self.prompt_template.starts_with(VIRTUAL_PROMPT) {
            bail!(
                "prompt_template of task '{}' must begin with {}",
                self.taskname,
                VIRTUAL_PROMPT
            );
        }
        if self.total_virtual_tokens == 0 {
            bail!("task '{}' needs at least one virtual token", self.taskname);
        }
        if self.answer_only_loss {
            let Some(field) = &self.answer_field else {
                bail!("task '{}' sets answer_only_loss without answer_field", self.taskname);
            };
            if !self.prompt_template.trim_end().ends_with(&format!("{{{field}}}")) {
                bail!(
                    "task '{}': answer field '{{{}}}' must close the prompt_template",
                    self.taskname,
                    field
                );
            }
        }
        Ok(())
    }

    /// Field names referenced by the template, in order.
    pub fn fields(&self) -> Vec<String> {
        field_pattern()
            .captures_iter(&self.prompt_template)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Render a record into `(context, answer)` text, without the virtual prompt.
    ///
    /// Without `answer_only_loss` the whole rendering is returned as context.
    pub fn render(&self, record: &Map<String, Value>) -> Result<(String, String)> {
        let body = self.prompt_template[VIRTUAL_PROMPT.len()..].trim_start();
        let answer_field = self.answer_field.as_deref().filter(|_| self.answer_only_loss);

        let mut missing = None;
        let rendered = field_pattern().replace_all(body, |caps: &regex::Captures| {
            let name = &caps[1];
            if Some(name) == answer_field {
                return String::new();
            }
            match record.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });
        if let Some(name) = missing {
            bail!("record for task '{}' has no field '{}'", self.taskname, name);
        }

        let answer = match answer_field {
            Some(field) => match record.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => bail!("record for task '{}' has no answer field '{}'", self.taskname, field),
            },
            None => String::new(),
        };
        Ok((rendered.into_owned(), answer))
    }
}

/// Dataset section of the prompt-learning model config (`model.data`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptDataConfig {
    pub train_ds: Vec<PathBuf>,
    pub validation_ds: Vec<PathBuf>,
    pub batch_size: usize,
    pub max_seq_length: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Records generated per task when no dataset files are configured.
    pub synthetic_samples: usize,
}

impl Default for PromptDataConfig {
    fn default() -> Self {
        Self {
            train_ds: Vec::new(),
            validation_ds: Vec::new(),
            batch_size: 4,
            max_seq_length: 64,
            shuffle: true,
            seed: 1234,
            synthetic_samples: 16,
        }
    }
}

/// A tokenized example: task id, text tokens and where the loss starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSample {
    pub task_id: usize,
    pub tokens: Vec<i64>,
    /// Index of the first token that is a prediction target.
    pub loss_start: usize,
}

pub fn encode_record<T: Tokenizer + ?Sized>(
    templates: &[TaskTemplate],
    record: &Map<String, Value>,
    tokenizer: &T,
    max_seq_length: usize,
) -> Result<PromptSample> {
    let taskname = record
        .get("taskname")
        .and_then(Value::as_str)
        .context("record has no 'taskname'")?;
    let task_id = templates
        .iter()
        .position(|t| t.taskname == taskname)
        .with_context(|| format!("unknown taskname '{taskname}'"))?;
    let template = &templates[task_id];

    let (context, answer) = template.render(record)?;
    let mut tokens = tokenizer.encode(&context);
    let mut loss_start = if template.answer_only_loss { tokens.len() } else { 1 };
    tokens.extend(tokenizer.encode(&answer));
    tokens.push(tokenizer.eos_id());

    // Keep the tail so the answer survives truncation.
    let limit = max_seq_length.max(2);
    if tokens.len() > limit {
        let cut = tokens.len() - limit;
        tokens.drain(..cut);
        loss_start = loss_start.saturating_sub(cut).max(1);
    }

    Ok(PromptSample {
        task_id,
        tokens,
        loss_start,
    })
}

/// Read JSON-lines records; errors name the file and line.
pub fn load_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let file = File::open(path).with_context(|| format!("Failed to open dataset {:?}", path))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON record", path.display(), idx + 1))?;
        match value {
            Value::Object(map) => records.push(map),
            _ => bail!("{}:{}: record must be a JSON object", path.display(), idx + 1),
        }
    }
    info!("Loaded {} records from {:?}", records.len(), path);
    Ok(records)
}

pub fn load_samples<T: Tokenizer + ?Sized>(
    paths: &[PathBuf],
    templates: &[TaskTemplate],
    tokenizer: &T,
    max_seq_length: usize,
) -> Result<Vec<PromptSample>> {
    let mut samples = Vec::new();
    for path in paths {
        for (idx, record) in load_records(path)?.iter().enumerate() {
            let sample = encode_record(templates, record, tokenizer, max_seq_length)
                .with_context(|| format!("{}: record {}", path.display(), idx + 1))?;
            samples.push(sample);
        }
    }
    Ok(samples)
}

const SYNTHETIC_WORDS: [&str; 12] = [
    "river", "stone", "cloud", "amber", "quiet", "swift", "lemon", "north", "glass", "ember", "maple", "tide",
];

/// Seeded records for every task. The answer is a function of the first field
/// so the prompt has something to learn.
pub fn synthetic_records(templates: &[TaskTemplate], per_task: usize, seed: u64) -> Vec<Map<String, Value>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::with_capacity(templates.len() * per_task);
    for template in templates {
        let answer_field = template.answer_field.clone();
        let fields: Vec<String> = template
            .fields()
            .into_iter()
            .filter(|f| Some(f) != answer_field.as_ref())
            .collect();

        for _ in 0..per_task {
            let mut record = Map::new();
            record.insert("taskname".into(), Value::from(template.taskname.clone()));
            let mut first_len = 0;
            for (i, field) in fields.iter().enumerate() {
                let n = rng.gen_range(1..=3);
                let words: Vec<&str> = (0..n)
                    .filter_map(|_| SYNTHETIC_WORDS.choose(&mut rng).copied())
                    .collect();
                let text = words.join(" ");
                if i == 0 {
                    first_len = words.len();
                }
                record.insert(field.clone(), Value::from(text));
            }
            if let Some(field) = &answer_field {
                let answer = if first_len % 2 == 0 { "even" } else { "odd" };
                record.insert(field.clone(), Value::from(answer));
            }
            records.push(record);
        }
    }
    records
}

pub fn synthetic_samples<T: Tokenizer + ?Sized>(
    templates: &[TaskTemplate],
    tokenizer: &T,
    per_task: usize,
    seed: u64,
    max_seq_length: usize,
) -> Result<Vec<PromptSample>> {
    if per_task == 0 {
        warn!("synthetic_samples is 0, dataset will be empty");
    }
    synthetic_records(templates, per_task, seed)
        .iter()
        .map(|record| encode_record(templates, record, tokenizer, max_seq_length))
        .collect()
}

#[derive(Clone, Debug)]
pub struct PromptBatch<B: Backend> {
    pub task_ids: Tensor<B, 1, Int>,
    pub tokens: Tensor<B, 2, Int>,
    /// Next-token targets; positions outside the loss window hold `pad_id`.
    pub targets: Tensor<B, 2, Int>,
}

/// Pads samples to the longest in the batch and shifts targets by one.
#[derive(Debug, Clone)]
pub struct PromptCollate {
    pub pad_id: i64,
}

impl<B: Backend> Collate<B> for PromptCollate {
    type Item = PromptSample;
    type Batch = PromptBatch<B>;

    fn collate(&self, items: &[&PromptSample], device: &B::Device) -> PromptBatch<B> {
        let batch_size = items.len();
        let seq_len = items
            .iter()
            .map(|s| s.tokens.len().saturating_sub(1))
            .max()
            .unwrap_or(0)
            .max(1);

        let mut tokens = vec![self.pad_id; batch_size * seq_len];
        let mut targets = vec![self.pad_id; batch_size * seq_len];
        let mut task_ids = Vec::with_capacity(batch_size);

        for (row, sample) in items.iter().enumerate() {
            task_ids.push(sample.task_id as i64);
            let n = sample.tokens.len().saturating_sub(1);
            for pos in 0..n {
                tokens[row * seq_len + pos] = sample.tokens[pos];
                if pos + 1 >= sample.loss_start {
                    targets[row * seq_len + pos] = sample.tokens[pos + 1];
                }
            }
        }

        PromptBatch {
            task_ids: Tensor::<B, 1, Int>::from_ints(task_ids.as_slice(), device),
            tokens: Tensor::<B, 1, Int>::from_ints(tokens.as_slice(), device).reshape([batch_size, seq_len]),
            targets: Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device).reshape([batch_size, seq_len]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CharTokenizer;
    use burn_ndarray::NdArray;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    type TestBackend = NdArray<f32>;

    fn sentiment() -> TaskTemplate {
        TaskTemplate {
            taskname: "sentiment".into(),
            prompt_template: "<|VIRTUAL_PROMPT_0|> {sentence} sentiment: {label}".into(),
            total_virtual_tokens: 4,
            answer_only_loss: true,
            answer_field: Some("label".into()),
        }
    }

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_template_must_start_with_virtual_prompt() {
        let mut template = sentiment();
        assert!(template.validate().is_ok());
        template.prompt_template = "{sentence} <|VIRTUAL_PROMPT_0|> {label}".into();
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_answer_field_must_close_template() {
        let mut template = sentiment();
        template.prompt_template = "<|VIRTUAL_PROMPT_0|> {label} {sentence}".into();
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_render_splits_answer() {
        let (context, answer) = sentiment()
            .render(&record(json!({"sentence": "fine day", "label": "positive"})))
            .unwrap();
        assert_eq!(context, "fine day sentiment: ");
        assert_eq!(answer, "positive");
    }

    #[test]
    fn test_render_missing_field() {
        let err = sentiment().render(&record(json!({"label": "x"}))).unwrap_err();
        assert!(err.to_string().contains("sentence"));
    }

    #[test]
    fn test_answer_only_loss_window() {
        let tokenizer = CharTokenizer::ascii();
        let sample = encode_record(
            &[sentiment()],
            &record(json!({"taskname": "sentiment", "sentence": "ok", "label": "yes"})),
            &tokenizer,
            64,
        )
        .unwrap();
        let context_len = "ok sentiment: ".len();
        assert_eq!(sample.loss_start, context_len);
        assert_eq!(sample.tokens.len(), context_len + 3 + 1);
        assert_eq!(*sample.tokens.last().unwrap(), tokenizer.eos_id());
    }

    #[test]
    fn test_truncation_keeps_answer() {
        let tokenizer = CharTokenizer::ascii();
        let sample = encode_record(
            &[sentiment()],
            &record(json!({"taskname": "sentiment", "sentence": "a very long sentence indeed", "label": "yes"})),
            &tokenizer,
            8,
        )
        .unwrap();
        assert_eq!(sample.tokens.len(), 8);
        assert_eq!(tokenizer.decode(&sample.tokens), "nt: yes");
        assert_eq!(sample.loss_start, 4);
    }

    #[test]
    fn test_unknown_task_is_an_error() {
        let tokenizer = CharTokenizer::ascii();
        let err = encode_record(&[sentiment()], &record(json!({"taskname": "nli"})), &tokenizer, 64).unwrap_err();
        assert!(err.to_string().contains("nli"));
    }

    #[test]
    fn test_load_records_reports_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{\"taskname\": \"sentiment\"}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        let err = load_records(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(":3:"));
    }

    #[test]
    fn test_synthetic_records_are_seeded() {
        let a = synthetic_records(&[sentiment()], 5, 3);
        let b = synthetic_records(&[sentiment()], 5, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert!(a.iter().all(|r| r.contains_key("sentence") && r.contains_key("label")));
    }

    #[test]
    fn test_collate_masks_context_targets() {
        let collate = PromptCollate { pad_id: 0 };
        let short = PromptSample {
            task_id: 1,
            tokens: vec![5, 6, 7],
            loss_start: 2,
        };
        let long = PromptSample {
            task_id: 0,
            tokens: vec![5, 6, 7, 8, 9],
            loss_start: 1,
        };
        let batch: PromptBatch<TestBackend> =
            Collate::<TestBackend>::collate(&collate, &[&short, &long], &Default::default());

        assert_eq!(batch.tokens.dims(), [2, 4]);
        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, vec![0, 7, 0, 0, 6, 7, 8, 9]);
        let tokens: Vec<i64> = batch.tokens.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(tokens, vec![5, 6, 0, 0, 5, 6, 7, 8]);
    }
}
