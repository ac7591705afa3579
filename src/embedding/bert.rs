//! Candle BERT backend.
//!
//! Runs a sentence-transformer (all-MiniLM-L6-v2 by default) on the CPU and
//! returns the last hidden state; pooling happens in the engine.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;

use super::engine::{EmbeddingError, InferenceBackend};

/// Files required to load the model
pub const MODEL_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

/// Local copy of a HuggingFace model repository.
#[derive(Debug, Clone)]
pub struct ModelCache {
    pub cache_dir: PathBuf,
    pub repo_id: String,
}

impl ModelCache {
    pub fn new(cache_dir: impl Into<PathBuf>, repo_id: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            repo_id: repo_id.into(),
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.cache_dir.join(self.repo_id.replace('/', "_"))
    }

    pub fn is_cached(&self) -> bool {
        let model_dir = self.model_dir();
        MODEL_FILES.iter().all(|f| model_dir.join(f).exists())
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.model_dir().join(filename)
    }

    /// Download any missing model files.
    fn ensure_downloaded(&self) -> Result<(), EmbeddingError> {
        if self.is_cached() {
            log::debug!("using cached model at {:?}", self.model_dir());
            return Ok(());
        }

        use hf_hub::api::sync::Api;

        log::info!("downloading model files for {}", self.repo_id);

        let api = Api::new().map_err(|e| EmbeddingError::Download(e.to_string()))?;
        let repo = api.model(self.repo_id.clone());

        std::fs::create_dir_all(self.model_dir())?;

        for filename in MODEL_FILES {
            let source_path = repo
                .get(filename)
                .map_err(|e| EmbeddingError::Download(format!("{}: {}", filename, e)))?;

            let dest_path = self.file_path(filename);
            std::fs::copy(&source_path, &dest_path)?;
            log::debug!("downloaded {} to {:?}", filename, dest_path);
        }

        Ok(())
    }
}

pub struct BertBackend {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimensions: usize,
}

impl BertBackend {
    /// Load the model from the cache, downloading it first if needed.
    pub fn load(cache: &ModelCache) -> Result<Self, EmbeddingError> {
        cache.ensure_downloaded()?;
        Self::load_from_paths(
            &cache.file_path("config.json"),
            &cache.file_path("tokenizer.json"),
            &cache.file_path("model.safetensors"),
        )
    }

    pub fn load_from_paths(
        config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
    ) -> Result<Self, EmbeddingError> {
        let device = Device::Cpu;

        let config_str = std::fs::read_to_string(config_path)?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .map_err(|e| EmbeddingError::ModelNotFound(format!("invalid config: {}", e)))?;
        let dimensions = serde_json::from_str::<serde_json::Value>(&config_str)
            .ok()
            .and_then(|raw| raw["hidden_size"].as_u64())
            .ok_or_else(|| EmbeddingError::ModelNotFound("config has no hidden_size".to_string()))?
            as usize;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        // SAFETY: the weights file is not modified while mapped
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path.to_path_buf()], DType::F32, &device)?
        };
        let model = BertModel::load(vb, &config)?;

        log::info!(
            "loaded BERT model ({} dims) from {:?}",
            dimensions,
            weights_path
        );

        Ok(Self {
            model,
            tokenizer,
            device,
            dimensions,
        })
    }
}

impl InferenceBackend for BertBackend {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn tokenize(
        &self,
        text: &str,
        ids: &mut [u32],
        mask: &mut [u32],
    ) -> Result<usize, EmbeddingError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        let n = encoding.get_ids().len().min(ids.len());
        ids[..n].copy_from_slice(&encoding.get_ids()[..n]);
        mask[..n].copy_from_slice(&encoding.get_attention_mask()[..n]);

        Ok(mask[..n].iter().filter(|&&m| m != 0).count())
    }

    fn forward(
        &mut self,
        ids: &[u32],
        mask: &[u32],
        hidden: &mut [f32],
    ) -> Result<(), EmbeddingError> {
        let seq_len = ids.len();

        let input_ids = Tensor::from_slice(ids, (1, seq_len), &self.device)?;
        let attention_mask = Tensor::from_slice(mask, (1, seq_len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let output = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let values: Vec<f32> = output.squeeze(0)?.flatten_all()?.to_vec1()?;

        if values.len() != hidden.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: hidden.len(),
                actual: values.len(),
            });
        }
        hidden.copy_from_slice(&values);

        Ok(())
    }
}
