//! Raw ABI surface for the vendor inference accelerator.
//!
//! Everything here mirrors the vendor header byte for byte: `#[repr(C)]`
//! structs, the callback signature, and the status codes the library
//! returns. Nothing in this crate is safe to use directly; the safe seam
//! lives in `inferd-core`'s `accel` module.
//!
//! The `extern "C"` block is only compiled with the `vendor` feature so
//! that hosts without the proprietary shared library still build and run
//! against the simulated backend.

use std::os::raw::{c_char, c_int, c_void};

/// Opaque accelerator handle. The library owns the pointee; at most one
/// handle exists per process.
pub type AccelHandle = *mut c_void;

/// Callback state reported with every result callback invocation.
pub const ACCEL_RUN_NORMAL: c_int = 0;
pub const ACCEL_RUN_WAITING: c_int = 1;
pub const ACCEL_RUN_FINISH: c_int = 2;
pub const ACCEL_RUN_ERROR: c_int = 3;

/// Input discriminants for [`AccelInput::input_type`].
pub const ACCEL_INPUT_PROMPT: c_int = 0;
pub const ACCEL_INPUT_TOKEN: c_int = 1;
pub const ACCEL_INPUT_EMBED: c_int = 2;
pub const ACCEL_INPUT_MULTIMODAL: c_int = 3;

/// Inference modes for [`AccelInferParam::mode`].
pub const ACCEL_INFER_GENERATE: c_int = 0;
pub const ACCEL_INFER_GET_LAST_HIDDEN_LAYER: c_int = 1;
pub const ACCEL_INFER_GET_LOGITS: c_int = 2;

/// Extension parameters nested inside [`AccelParam`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelExtendParam {
    pub base_domain_id: i32,
    pub embed_flash: i8,
    pub enabled_cpus_num: i8,
    pub enabled_cpus_mask: u32,
    pub n_batch: u8,
    pub use_cross_attn: i8,
    pub reserved: [u8; 104],
}

/// Model/session parameters consumed by `accel_init`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelParam {
    pub model_path: *const c_char,
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
    pub is_async: bool,
    pub img_start: *const c_char,
    pub img_end: *const c_char,
    pub img_content: *const c_char,
    pub extend_param: AccelExtendParam,
}

/// Embedding input: `n_tokens` embeddings of the model's hidden size,
/// packed row-major.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelEmbedInput {
    pub embed: *mut f32,
    pub n_tokens: usize,
}

/// Token-id input.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelTokenInput {
    pub input_ids: *mut i32,
    pub n_tokens: usize,
}

/// Multimodal input: text prompt plus pre-computed image embeddings.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelMultimodalInput {
    pub prompt: *const c_char,
    pub image_embed: *mut f32,
    pub n_image_tokens: usize,
    pub n_image: usize,
    pub image_width: usize,
    pub image_height: usize,
}

/// Input union selected by `input_type`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union AccelInputUnion {
    pub prompt_input: *const c_char,
    pub embed_input: AccelEmbedInput,
    pub token_input: AccelTokenInput,
    pub multimodal_input: AccelMultimodalInput,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AccelInput {
    pub role: *const c_char,
    pub enable_thinking: bool,
    pub input_type: c_int,
    pub input: AccelInputUnion,
}

/// LoRA selection nested inside [`AccelInferParam`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelLoraParam {
    pub lora_adapter_name: *const c_char,
}

/// Prompt-cache control nested inside [`AccelInferParam`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelPromptCacheParam {
    pub save_prompt_cache: c_int,
    pub prompt_cache_path: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelInferParam {
    pub mode: c_int,
    pub lora_params: *mut AccelLoraParam,
    pub prompt_cache_params: *mut AccelPromptCacheParam,
    pub keep_history: c_int,
}

/// A LoRA adapter to load.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelLoraAdapter {
    pub lora_adapter_path: *const c_char,
    pub lora_adapter_name: *const c_char,
    pub scale: f32,
}

/// Cross-attention parameters: a 4-D encoder tensor plus mask and
/// position vectors. The tensor is packed row-major as
/// `[d1][d2][d3][d4]`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelCrossAttnParam {
    pub encoder_k_cache: *mut f32,
    pub encoder_mask: *mut f32,
    pub encoder_pos: *mut c_int,
    pub num_tokens: usize,
}

/// One result callback payload: a UTF-8 token fragment and its id.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AccelResult {
    pub text: *const c_char,
    pub token_id: i32,
}

/// Result callback. Returning non-zero aborts the in-flight run.
pub type AccelResultCallback =
    unsafe extern "C" fn(result: *mut AccelResult, userdata: *mut c_void, state: c_int) -> c_int;

#[cfg(feature = "vendor")]
#[link(name = "accel")]
extern "C" {
    pub fn accel_create_default_param() -> AccelParam;
    pub fn accel_init(
        handle: *mut AccelHandle,
        param: *mut AccelParam,
        callback: AccelResultCallback,
    ) -> c_int;
    pub fn accel_destroy(handle: AccelHandle) -> c_int;
    pub fn accel_run(
        handle: AccelHandle,
        input: *mut AccelInput,
        infer_param: *mut AccelInferParam,
        userdata: *mut c_void,
    ) -> c_int;
    pub fn accel_run_async(
        handle: AccelHandle,
        input: *mut AccelInput,
        infer_param: *mut AccelInferParam,
        userdata: *mut c_void,
    ) -> c_int;
    pub fn accel_abort(handle: AccelHandle) -> c_int;
    pub fn accel_is_running(handle: AccelHandle) -> c_int;
    pub fn accel_load_lora(handle: AccelHandle, adapter: *mut AccelLoraAdapter) -> c_int;
    pub fn accel_load_prompt_cache(handle: AccelHandle, path: *const c_char) -> c_int;
    pub fn accel_release_prompt_cache(handle: AccelHandle) -> c_int;
    pub fn accel_clear_kv_cache(
        handle: AccelHandle,
        keep_system_prompt: c_int,
        start_pos: *mut c_int,
        end_pos: *mut c_int,
    ) -> c_int;
    pub fn accel_get_kv_cache_size(handle: AccelHandle, cache_sizes: *mut c_int) -> c_int;
    pub fn accel_set_chat_template(
        handle: AccelHandle,
        system_prompt: *const c_char,
        prompt_prefix: *const c_char,
        prompt_postfix: *const c_char,
    ) -> c_int;
    pub fn accel_set_function_tools(
        handle: AccelHandle,
        system_prompt: *const c_char,
        tools: *const c_char,
        tool_response_str: *const c_char,
    ) -> c_int;
    pub fn accel_set_cross_attn_params(
        handle: AccelHandle,
        params: *mut AccelCrossAttnParam,
    ) -> c_int;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_param_is_pointer_free() {
        // The extend block is embedded by value in AccelParam; a stray
        // pointer here would change the ABI layout.
        let ext = AccelExtendParam {
            base_domain_id: 0,
            embed_flash: 0,
            enabled_cpus_num: 4,
            enabled_cpus_mask: 0xF0,
            n_batch: 1,
            use_cross_attn: 0,
            reserved: [0; 104],
        };
        let copy = ext;
        assert_eq!(copy.enabled_cpus_mask, 0xF0);
    }

    #[test]
    fn input_union_size_covers_largest_variant() {
        assert!(
            std::mem::size_of::<AccelInputUnion>()
                >= std::mem::size_of::<AccelMultimodalInput>()
        );
    }
}
