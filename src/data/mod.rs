pub mod diarize;
mod loader;
pub mod prompt;
mod tokenizer;

pub use diarize::{DiarizeBatch, DiarizeCollate, DiarizeDatasetConfig, DiarizeSample, FrameLayout};
pub use loader::{BatchLoader, Collate, DataLoader};
pub use prompt::{PromptBatch, PromptCollate, PromptDataConfig, PromptSample, TaskTemplate};
pub use tokenizer::{CharTokenizer, Tokenizer};
