//! Accelerator boundary
//!
//! The engine never calls the vendor ABI directly; it talks to the
//! [`Accelerator`] trait. Two implementations exist: the deterministic
//! [`SimAccelerator`](sim::SimAccelerator) used by default and by every
//! test, and the `vendor`-feature adapter over `inferd-accel-sys`.
//!
//! Methods that mirror vendor entry points return the vendor's raw
//! status code on failure; `Error::from_accel_status` owns the mapping
//! to JSON-RPC errors so the table lives in one place.
//!
//! Token delivery is callback-driven and blocking: `run` / `run_async`
//! invoke the sink inline on the calling thread (the scheduler worker),
//! exactly as the vendor library drives its C callback. Returning
//! [`CallbackDecision::Abort`] from the sink maps to the non-zero C
//! return that interrupts generation.

pub mod sim;
#[cfg(feature = "vendor")]
pub mod vendor;

pub use sim::SimAccelerator;

/// Vendor status code carried on failure.
pub type AccelStatus = i32;

/// Result alias for accelerator calls.
pub type CallResult<T> = std::result::Result<T, AccelStatus>;

/// State reported with every token callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Normal,
    Waiting,
    Finish,
    Error,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Normal => "normal",
            CallState::Waiting => "waiting",
            CallState::Finish => "finish",
            CallState::Error => "error",
        }
    }

    /// Whether this state terminates the stream.
    pub fn is_final(&self) -> bool {
        matches!(self, CallState::Finish | CallState::Error)
    }
}

/// One token callback payload.
#[derive(Debug, Clone, Copy)]
pub struct TokenEvent<'a> {
    /// UTF-8 token fragment; may be empty (state-only callbacks).
    pub text: &'a str,
    pub token_id: i32,
    pub state: CallState,
}

/// What the sink tells the accelerator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDecision {
    Continue,
    Abort,
}

/// Token sink driven inline on the worker thread.
pub type TokenSink<'a> = &'a mut dyn FnMut(&TokenEvent<'_>) -> CallbackDecision;

/// Resolved generation parameters, the safe mirror of the vendor's
/// parameter struct.
#[derive(Debug, Clone, PartialEq)]
pub struct GenParams {
    pub model_path: Option<String>,
    pub max_context_len: i32,
    pub max_new_tokens: i32,
    pub top_k: i32,
    pub n_keep: i32,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub skip_special_token: bool,
    pub img_start: Option<String>,
    pub img_end: Option<String>,
    pub img_content: Option<String>,
    pub extend: ExtendParams,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendParams {
    pub base_domain_id: i32,
    pub embed_flash: i8,
    pub enabled_cpus_num: i8,
    pub enabled_cpus_mask: u32,
    pub n_batch: u8,
    pub use_cross_attn: i8,
}

/// Inference input, tagged the way the wire tags it.
#[derive(Debug, Clone, PartialEq)]
pub enum InferInput {
    Prompt {
        role: Option<String>,
        enable_thinking: bool,
        prompt: String,
    },
    Embed {
        n_tokens: usize,
        embed: Vec<f32>,
    },
    Token {
        n_tokens: usize,
        input_ids: Vec<i32>,
    },
    Multimodal {
        prompt: String,
        image_embed: Vec<f32>,
        n_image_tokens: usize,
        n_image: usize,
        image_width: usize,
        image_height: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferMode {
    Generate,
    GetLastHiddenLayer,
    GetLogits,
}

/// Per-run inference parameters with the nested lora and prompt-cache
/// sub-params.
#[derive(Debug, Clone, PartialEq)]
pub struct InferParams {
    pub mode: InferMode,
    pub keep_history: bool,
    pub lora: Option<LoraSelect>,
    pub prompt_cache: Option<PromptCacheCtl>,
}

impl Default for InferParams {
    fn default() -> Self {
        Self {
            mode: InferMode::Generate,
            keep_history: true,
            lora: None,
            prompt_cache: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoraSelect {
    pub adapter_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptCacheCtl {
    pub save_prompt_cache: bool,
    pub prompt_cache_path: Option<String>,
}

/// A LoRA adapter to load onto the current model.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub lora_adapter_path: String,
    pub lora_adapter_name: String,
    pub scale: f32,
}

/// Cross-attention parameters: 4-D encoder tensor (row-major, declared
/// dimensions) plus mask and position vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossAttnParams {
    pub encoder_k_cache: Vec<f32>,
    pub dims: [usize; 4],
    pub encoder_mask: Vec<f32>,
    pub encoder_pos: Vec<i32>,
    pub num_tokens: usize,
}

/// The seam between the engine and the accelerator library.
///
/// Implementations own the process-wide singleton handle: `init`
/// creates it, `destroy` releases it, a second `init` without an
/// intervening `destroy` fails, and "initialised" is defined as the
/// handle being present.
pub trait Accelerator: Send + Sync {
    /// The library's own parameter baseline.
    fn create_default_params(&self) -> GenParams;

    /// Load a model and create the singleton handle.
    fn init(&self, params: &GenParams) -> CallResult<()>;

    /// Destroy the handle and release the model.
    fn destroy(&self) -> CallResult<()>;

    /// Whether the singleton handle exists.
    fn is_initialised(&self) -> bool;

    /// Synchronous inference; the sink still sees every token.
    fn run(&self, input: &InferInput, infer: &InferParams, sink: TokenSink<'_>) -> CallResult<()>;

    /// Streaming inference. Blocks until the callback reports
    /// Finish/Error or the sink aborts.
    fn run_async(
        &self,
        input: &InferInput,
        infer: &InferParams,
        sink: TokenSink<'_>,
    ) -> CallResult<()>;

    /// Interrupt any in-progress generation. Always accepted.
    fn abort(&self) -> CallResult<()>;

    /// Whether a generation is currently running.
    fn is_running(&self) -> CallResult<bool>;

    fn load_lora(&self, adapter: &LoraAdapter) -> CallResult<()>;

    fn load_prompt_cache(&self, path: &str) -> CallResult<()>;

    fn release_prompt_cache(&self) -> CallResult<()>;

    fn clear_kv_cache(
        &self,
        keep_system_prompt: bool,
        start_pos: Option<&[i32]>,
        end_pos: Option<&[i32]>,
    ) -> CallResult<()>;

    fn get_kv_cache_size(&self) -> CallResult<Vec<i32>>;

    fn set_chat_template(
        &self,
        system_prompt: &str,
        prompt_prefix: &str,
        prompt_postfix: &str,
    ) -> CallResult<()>;

    fn set_function_tools(
        &self,
        system_prompt: &str,
        tools: &str,
        tool_response_str: &str,
    ) -> CallResult<()>;

    fn set_cross_attn_params(&self, params: &CrossAttnParams) -> CallResult<()>;
}
