//! Embedding providers.
//!
//! - `FastEmbedder`: local ONNX model through fastembed, downloaded on first use
//! - `HashingEmbedder`: deterministic token-hashing embedder, no model files
//! - `TimeoutEmbedder`: bounds every call of another embedder with a timeout

use std::path::Path;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};

use crate::config::{EmbeddingConfig, EmbeddingProvider};

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("Embedding provider busy: earlier calls have not finished")]
    Busy,

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Converts text into a fixed-dimension vector.
///
/// Implementations must be deterministic for a given model: the same text
/// always yields the same vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;

    /// SHA256 of the model name, stored in snapshots to detect model changes.
    fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Build the configured provider, wrapped in a [`TimeoutEmbedder`].
pub fn from_config(
    config: &EmbeddingConfig,
    base_path: &Path,
) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    let inner: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Fastembed => Arc::new(FastEmbedder::new(&config.model, base_path)?),
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.hashing_dimensions)),
    };

    log::info!(
        "Using embedding model '{}' ({} dimensions)",
        inner.model_name(),
        inner.dimensions()
    );

    Ok(Arc::new(TimeoutEmbedder::new(
        inner,
        Duration::from_secs(config.timeout_secs),
    )?))
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedder {
    /// Load a fastembed model, downloading it into `<cache_dir>/models` if needed.
    pub fn new(model_name: &str, cache_dir: &Path) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
            "paraphrase-multilingual-minilm-l12-v2" => {
                Ok(fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2)
            }
            "paraphrase-multilingual-minilm-l12-v2-q" => {
                Ok(fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2Q)
            }
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, paraphrase-multilingual-MiniLM-L12-v2, multilingual-e5-small, multilingual-e5-base, bge-small-en-v1.5, bge-base-en-v1.5",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Bag-of-words embedder built from hashed tokens.
///
/// Every lowercase alphanumeric token maps to a pseudo-random unit vector
/// seeded by its SHA256; a text is the normalized sum of its tokens. Texts
/// sharing words end up close in L2 distance, unrelated ones near-orthogonal.
pub struct HashingEmbedder {
    dimensions: usize,
    model_name: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model_name: format!("hashing-{dimensions}"),
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        if tokens.is_empty() && !text.trim().is_empty() {
            // punctuation-only text still gets a stable vector
            return vec![text.trim().to_lowercase()];
        }
        tokens
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let digest = Sha256::digest(token.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut state = u64::from_le_bytes(seed);

        let mut vector: Vec<f32> = (0..self.dimensions)
            .map(|_| {
                let bits = splitmix64(&mut state);
                // top 24 bits -> [-1, 1)
                ((bits >> 40) as f32 / (1u64 << 23) as f32) - 1.0
            })
            .collect();
        normalize(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = Self::tokens(text);
        if tokens.is_empty() {
            return Err(EmbeddingError::EmbeddingFailed(
                "Cannot embed empty text".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            for (acc, x) in vector.iter_mut().zip(self.token_vector(token)) {
                *acc += x;
            }
        }
        normalize(&mut vector);

        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Most calls that may wait for the worker at once. Further calls fail
/// immediately instead of piling up behind a stuck model.
const WORKER_QUEUE: usize = 4;

struct EmbedJob {
    text: String,
    deadline: Instant,
    reply: mpsc::Sender<Result<Vec<f32>, EmbeddingError>>,
}

/// Runs embeddings on one long-lived worker thread and gives up waiting
/// after `timeout`.
///
/// A timed-out call keeps the worker busy until the inner embedder returns.
/// Queued jobs whose caller already gave up are skipped.
pub struct TimeoutEmbedder {
    inner: Arc<dyn Embedder>,
    timeout: Duration,
    jobs: mpsc::SyncSender<EmbedJob>,
}

impl TimeoutEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, timeout: Duration) -> Result<Self, EmbeddingError> {
        let (jobs, queue) = mpsc::sync_channel::<EmbedJob>(WORKER_QUEUE);
        let worker = Arc::clone(&inner);

        std::thread::Builder::new()
            .name("embed".to_string())
            .spawn(move || {
                for job in queue {
                    if Instant::now() >= job.deadline {
                        log::debug!("Skipping embedding whose caller timed out");
                        continue;
                    }
                    let result = panic::catch_unwind(AssertUnwindSafe(|| worker.embed(&job.text)))
                        .unwrap_or_else(|_| {
                            Err(EmbeddingError::EmbeddingFailed(
                                "Embedding worker panicked".to_string(),
                            ))
                        });
                    let _ = job.reply.send(result);
                }
            })
            .map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to spawn embedding worker: {}", e))
            })?;

        Ok(Self {
            inner,
            timeout,
            jobs,
        })
    }
}

impl Embedder for TimeoutEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let (reply, rx) = mpsc::channel();
        let job = EmbedJob {
            text: text.to_string(),
            deadline: Instant::now() + self.timeout,
            reply,
        };

        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Embedding worker is backed up, rejecting call");
                return Err(EmbeddingError::Busy);
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(EmbeddingError::EmbeddingFailed(
                    "Embedding worker has stopped".to_string(),
                ))
            }
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Embedding call exceeded {:?}", self.timeout);
                Err(EmbeddingError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EmbeddingError::EmbeddingFailed(
                "Embedding worker exited without a result".to_string(),
            )),
        }
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return;
    }
    for x in vector {
        *x /= norm;
    }
}
