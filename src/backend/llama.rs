//! GGUF inference through llama.cpp (`llama-cpp-2`).
//!
//! One native context is created per generation call; the model weights stay
//! resident until `unload`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend as NativeBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use tracing::{debug, info};

use super::pieces::PieceDecoder;
use super::{BackendError, BackendModelId, InferenceBackend, LoadParams};
use crate::error::AppError;
use crate::session::GenerationRequest;

/// llama.cpp rejects larger decode batches during prefill.
const PREFILL_BATCH: usize = 512;
const GPU_ALL_LAYERS: u32 = 1000;

struct Resident {
    model: LlamaModel,
    params: LoadParams,
}

pub struct LlamaBackend {
    native: NativeBackend,
    next_id: AtomicU64,
    models: Mutex<HashMap<u64, Arc<Resident>>>,
}

impl LlamaBackend {
    pub fn new() -> Result<Self, AppError> {
        let native = NativeBackend::init()
            .map_err(|e| AppError::Config(format!("llama.cpp init failed: {e}")))?;
        Ok(Self {
            native,
            next_id: AtomicU64::new(0),
            models: Mutex::new(HashMap::new()),
        })
    }

    fn resident(&self, id: BackendModelId) -> Option<Arc<Resident>> {
        self.models
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id.0)
            .cloned()
    }
}

fn gen_err(e: impl std::fmt::Display) -> BackendError {
    BackendError::Generation(e.to_string())
}

impl InferenceBackend for LlamaBackend {
    fn name(&self) -> &'static str {
        "llama"
    }

    fn load(&self, path: &Path, params: &LoadParams) -> Result<BackendModelId, BackendError> {
        let layers = if params.use_gpu { GPU_ALL_LAYERS } else { 0 };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(layers);
        let model = LlamaModel::load_from_file(&self.native, path, &model_params)
            .map_err(|e| BackendError::Load(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.models
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Arc::new(Resident { model, params: *params }));
        info!(id, path = %path.display(), gpu = params.use_gpu, "llama model resident");
        Ok(BackendModelId(id))
    }

    fn generate(
        &self,
        model: BackendModelId,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String, BackendError> {
        let resident = self
            .resident(model)
            .ok_or_else(|| gen_err(format!("model {} is not loaded", model.0)))?;
        let llm = &resident.model;
        let threads = resident.params.threads.max(1) as i32;

        let n_ctx = NonZeroU32::new(resident.params.context_size)
            .ok_or_else(|| gen_err("context size must be > 0"))?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_threads(threads)
            .with_n_threads_batch(threads);
        let mut ctx = llm.new_context(&self.native, ctx_params).map_err(gen_err)?;

        let prompt_tokens = llm.str_to_token(&request.prompt, AddBos::Always).map_err(gen_err)?;
        let n_prompt = prompt_tokens.len();
        if n_prompt >= n_ctx.get() as usize {
            return Err(gen_err(format!(
                "prompt of {n_prompt} tokens does not fit a context of {}",
                n_ctx.get()
            )));
        }
        debug!(n_prompt, "prefill");

        let mut batch = LlamaBatch::new(PREFILL_BATCH, 1);
        let last = n_prompt.saturating_sub(1);
        for (c, chunk) in prompt_tokens.chunks(PREFILL_BATCH).enumerate() {
            batch.clear();
            for (j, &token) in chunk.iter().enumerate() {
                let pos = c * PREFILL_BATCH + j;
                batch.add(token, pos as i32, &[0], pos == last).map_err(gen_err)?;
            }
            ctx.decode(&mut batch).map_err(gen_err)?;
        }

        let p = &request.params;
        let mut samplers = Vec::with_capacity(4);
        if p.top_k > 0 {
            samplers.push(LlamaSampler::top_k(p.top_k as i32));
        }
        samplers.push(LlamaSampler::top_p(p.top_p, 1));
        samplers.push(LlamaSampler::temp(p.temperature));
        samplers.push(LlamaSampler::dist(rand_seed()));
        let mut sampler = LlamaSampler::chain_simple(samplers);

        let room = n_ctx.get() as usize - n_prompt;
        let budget = (p.max_tokens as usize).min(room);
        let mut out = String::new();
        let mut cur = n_prompt as i32;
        let mut pieces = PieceDecoder::default();

        for _ in 0..budget {
            if cancel.load(Ordering::Acquire) {
                return Err(BackendError::Cancelled);
            }
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if llm.is_eog_token(token) {
                break;
            }

            let bytes = llm.token_to_bytes(token, Special::Tokenize).unwrap_or_else(|e| {
                debug!(token = token.0, "token has no text: {e}");
                Vec::new()
            });
            let piece = pieces.push(&bytes);
            if !piece.is_empty() {
                on_token(&piece);
                out.push_str(&piece);
            }

            batch.clear();
            batch.add(token, cur, &[0], true).map_err(gen_err)?;
            cur += 1;
            ctx.decode(&mut batch).map_err(gen_err)?;
        }

        let tail = pieces.finish();
        if !tail.is_empty() {
            on_token(&tail);
            out.push_str(&tail);
        }
        Ok(out)
    }

    fn unload(&self, model: BackendModelId) {
        let removed = self
            .models
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&model.0);
        if removed.is_some() {
            info!(id = model.0, "llama model released");
        }
    }
}

fn rand_seed() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}
