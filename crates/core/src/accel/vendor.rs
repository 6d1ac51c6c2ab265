//! Vendor accelerator adapter
//!
//! Bridges the safe [`Accelerator`] trait onto the raw ABI in
//! `inferd-accel-sys`. All unsafe lives here: C string staging, array
//! staging through the bump arena, and the callback trampoline that
//! carries the token sink through `userdata`.
//!
//! The vendor runtime serialises accelerator work internally; this
//! adapter only guards the handle word itself. Array buffers handed to
//! the vendor are valid for the duration of the call that staged them:
//! the arena is reset at the start of the next staging call, which the
//! single-worker scheduler guarantees is after the previous call
//! returned.

use super::{
    Accelerator, CallResult, CallState, CallbackDecision, CrossAttnParams, ExtendParams,
    GenParams, InferInput, InferParams, LoraAdapter, TokenEvent, TokenSink,
};
use crate::marshal::arena::{Arena, DEFAULT_ARENA_CAPACITY};
use inferd_accel_sys as sys;
use parking_lot::Mutex;
use std::ffi::{c_int, c_void, CStr, CString};
use std::ptr;

const STATUS_NOT_INITIALISED: i32 = -5;
const STATUS_ALREADY_INITIALISED: i32 = -6;
const STATUS_INVALID_PARAM: i32 = -1;

/// The raw handle word. The vendor runtime owns the pointee and is
/// documented thread-safe for control calls, so carrying the pointer
/// across threads is sound.
struct HandleCell(sys::AccelHandle);
unsafe impl Send for HandleCell {}

pub struct VendorAccelerator {
    handle: Mutex<Option<HandleCell>>,
    arena: Arena,
}

impl VendorAccelerator {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            arena: Arena::new(DEFAULT_ARENA_CAPACITY),
        }
    }

    fn current_handle(&self) -> CallResult<sys::AccelHandle> {
        self.handle
            .lock()
            .as_ref()
            .map(|cell| cell.0)
            .ok_or(STATUS_NOT_INITIALISED)
    }

    /// Stage a float slice for the vendor call, preferring the arena
    /// and falling back to a heap buffer kept alive in `keepalive`.
    fn stage_f32(&self, data: &[f32], keepalive: &mut Vec<Vec<f32>>) -> *mut f32 {
        if data.is_empty() {
            return ptr::null_mut();
        }
        match self.arena.stage_f32(data) {
            Some(ptr) => ptr,
            None => {
                keepalive.push(data.to_vec());
                keepalive
                    .last_mut()
                    .map(|v| v.as_mut_ptr())
                    .unwrap_or(ptr::null_mut())
            }
        }
    }

    fn stage_i32(&self, data: &[i32], keepalive: &mut Vec<Vec<i32>>) -> *mut i32 {
        if data.is_empty() {
            return ptr::null_mut();
        }
        match self.arena.stage_i32(data) {
            Some(ptr) => ptr,
            None => {
                keepalive.push(data.to_vec());
                keepalive
                    .last_mut()
                    .map(|v| v.as_mut_ptr())
                    .unwrap_or(ptr::null_mut())
            }
        }
    }

    fn generate(
        &self,
        input: &InferInput,
        infer: &InferParams,
        sink: TokenSink<'_>,
        asynchronous: bool,
    ) -> CallResult<()> {
        let handle = self.current_handle()?;
        self.arena.reset();

        let mut f32_keep: Vec<Vec<f32>> = Vec::new();
        let mut i32_keep: Vec<Vec<i32>> = Vec::new();
        let mut cstrings: Vec<CString> = Vec::new();

        let mut c_input = self.build_input(input, &mut cstrings, &mut f32_keep, &mut i32_keep)?;
        let (mut c_infer, _lora, _cache) = build_infer(infer, &mut cstrings)?;

        // The sink travels through userdata as a pointer to the fat
        // reference; the trampoline unwraps it per callback.
        let mut sink_holder: TokenSink<'_> = sink;
        let userdata = &mut sink_holder as *mut TokenSink<'_> as *mut c_void;

        let status = unsafe {
            if asynchronous {
                sys::accel_run_async(handle, &mut c_input, &mut c_infer, userdata)
            } else {
                sys::accel_run(handle, &mut c_input, &mut c_infer, userdata)
            }
        };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn build_input(
        &self,
        input: &InferInput,
        cstrings: &mut Vec<CString>,
        f32_keep: &mut Vec<Vec<f32>>,
        i32_keep: &mut Vec<Vec<i32>>,
    ) -> CallResult<sys::AccelInput> {
        let (role, enable_thinking) = match input {
            InferInput::Prompt {
                role,
                enable_thinking,
                ..
            } => (role.as_deref(), *enable_thinking),
            _ => (None, false),
        };

        let role_ptr = stage_str(role, cstrings)?;
        let mut c_input = sys::AccelInput {
            role: role_ptr,
            enable_thinking,
            input_type: sys::ACCEL_INPUT_PROMPT,
            input: sys::AccelInputUnion {
                prompt_input: ptr::null(),
            },
        };

        match input {
            InferInput::Prompt { prompt, .. } => {
                c_input.input_type = sys::ACCEL_INPUT_PROMPT;
                c_input.input.prompt_input = stage_str(Some(prompt), cstrings)?;
            }
            InferInput::Token {
                n_tokens,
                input_ids,
            } => {
                c_input.input_type = sys::ACCEL_INPUT_TOKEN;
                c_input.input.token_input = sys::AccelTokenInput {
                    input_ids: self.stage_i32(input_ids, i32_keep),
                    n_tokens: *n_tokens,
                };
            }
            InferInput::Embed { n_tokens, embed } => {
                c_input.input_type = sys::ACCEL_INPUT_EMBED;
                c_input.input.embed_input = sys::AccelEmbedInput {
                    embed: self.stage_f32(embed, f32_keep),
                    n_tokens: *n_tokens,
                };
            }
            InferInput::Multimodal {
                prompt,
                image_embed,
                n_image_tokens,
                n_image,
                image_width,
                image_height,
            } => {
                c_input.input_type = sys::ACCEL_INPUT_MULTIMODAL;
                c_input.input.multimodal_input = sys::AccelMultimodalInput {
                    prompt: stage_str(Some(prompt), cstrings)?,
                    image_embed: self.stage_f32(image_embed, f32_keep),
                    n_image_tokens: *n_image_tokens,
                    n_image: *n_image,
                    image_width: *image_width,
                    image_height: *image_height,
                };
            }
        }
        Ok(c_input)
    }
}

impl Default for VendorAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_str(
    value: Option<&str>,
    cstrings: &mut Vec<CString>,
) -> CallResult<*const std::os::raw::c_char> {
    match value {
        None => Ok(ptr::null()),
        Some(s) => {
            let cstring = CString::new(s).map_err(|_| STATUS_INVALID_PARAM)?;
            cstrings.push(cstring);
            Ok(cstrings
                .last()
                .map(|c| c.as_ptr())
                .unwrap_or(ptr::null()))
        }
    }
}

fn build_infer(
    infer: &InferParams,
    cstrings: &mut Vec<CString>,
) -> CallResult<(
    sys::AccelInferParam,
    Box<Option<sys::AccelLoraParam>>,
    Box<Option<sys::AccelPromptCacheParam>>,
)> {
    let mode = match infer.mode {
        super::InferMode::Generate => sys::ACCEL_INFER_GENERATE,
        super::InferMode::GetLastHiddenLayer => sys::ACCEL_INFER_GET_LAST_HIDDEN_LAYER,
        super::InferMode::GetLogits => sys::ACCEL_INFER_GET_LOGITS,
    };

    let mut lora = Box::new(match &infer.lora {
        Some(select) => Some(sys::AccelLoraParam {
            lora_adapter_name: stage_str(Some(&select.adapter_name), cstrings)?,
        }),
        None => None,
    });
    let mut cache = Box::new(match &infer.prompt_cache {
        Some(ctl) => Some(sys::AccelPromptCacheParam {
            save_prompt_cache: ctl.save_prompt_cache as c_int,
            prompt_cache_path: stage_str(ctl.prompt_cache_path.as_deref(), cstrings)?,
        }),
        None => None,
    });

    let lora_ptr = match &mut *lora {
        Some(p) => p as *mut sys::AccelLoraParam,
        None => ptr::null_mut(),
    };
    let cache_ptr = match &mut *cache {
        Some(p) => p as *mut sys::AccelPromptCacheParam,
        None => ptr::null_mut(),
    };
    let c_infer = sys::AccelInferParam {
        mode,
        lora_params: lora_ptr,
        prompt_cache_params: cache_ptr,
        keep_history: infer.keep_history as c_int,
    };
    Ok((c_infer, lora, cache))
}

fn params_to_c(params: &GenParams, cstrings: &mut Vec<CString>) -> CallResult<sys::AccelParam> {
    let mut c_param = unsafe { default_c_param() };
    c_param.model_path = stage_str(params.model_path.as_deref(), cstrings)?;
    c_param.max_context_len = params.max_context_len;
    c_param.max_new_tokens = params.max_new_tokens;
    c_param.top_k = params.top_k;
    c_param.n_keep = params.n_keep;
    c_param.top_p = params.top_p;
    c_param.temperature = params.temperature;
    c_param.repeat_penalty = params.repeat_penalty;
    c_param.frequency_penalty = params.frequency_penalty;
    c_param.presence_penalty = params.presence_penalty;
    c_param.mirostat = params.mirostat;
    c_param.mirostat_tau = params.mirostat_tau;
    c_param.mirostat_eta = params.mirostat_eta;
    c_param.skip_special_token = params.skip_special_token;
    c_param.img_start = stage_str(params.img_start.as_deref(), cstrings)?;
    c_param.img_end = stage_str(params.img_end.as_deref(), cstrings)?;
    c_param.img_content = stage_str(params.img_content.as_deref(), cstrings)?;
    c_param.extend_param.base_domain_id = params.extend.base_domain_id;
    c_param.extend_param.embed_flash = params.extend.embed_flash;
    c_param.extend_param.enabled_cpus_num = params.extend.enabled_cpus_num;
    c_param.extend_param.enabled_cpus_mask = params.extend.enabled_cpus_mask;
    c_param.extend_param.n_batch = params.extend.n_batch;
    c_param.extend_param.use_cross_attn = params.extend.use_cross_attn;
    Ok(c_param)
}

unsafe fn default_c_param() -> sys::AccelParam {
    sys::accel_create_default_param()
}

fn c_param_to_params(c_param: &sys::AccelParam) -> GenParams {
    let read_str = |ptr: *const std::os::raw::c_char| -> Option<String> {
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
        }
    };
    GenParams {
        model_path: read_str(c_param.model_path),
        max_context_len: c_param.max_context_len,
        max_new_tokens: c_param.max_new_tokens,
        top_k: c_param.top_k,
        n_keep: c_param.n_keep,
        top_p: c_param.top_p,
        temperature: c_param.temperature,
        repeat_penalty: c_param.repeat_penalty,
        frequency_penalty: c_param.frequency_penalty,
        presence_penalty: c_param.presence_penalty,
        mirostat: c_param.mirostat,
        mirostat_tau: c_param.mirostat_tau,
        mirostat_eta: c_param.mirostat_eta,
        skip_special_token: c_param.skip_special_token,
        img_start: read_str(c_param.img_start),
        img_end: read_str(c_param.img_end),
        img_content: read_str(c_param.img_content),
        extend: ExtendParams {
            base_domain_id: c_param.extend_param.base_domain_id,
            embed_flash: c_param.extend_param.embed_flash,
            enabled_cpus_num: c_param.extend_param.enabled_cpus_num,
            enabled_cpus_mask: c_param.extend_param.enabled_cpus_mask,
            n_batch: c_param.extend_param.n_batch,
            use_cross_attn: c_param.extend_param.use_cross_attn,
        },
    }
}

/// C callback: unwraps the sink from userdata and forwards the event.
/// Returning non-zero asks the vendor runtime to abort the run.
unsafe extern "C" fn trampoline(
    result: *mut sys::AccelResult,
    userdata: *mut c_void,
    state: c_int,
) -> c_int {
    if userdata.is_null() {
        return -1;
    }
    let sink = &mut *(userdata as *mut TokenSink<'_>);

    let call_state = match state {
        sys::ACCEL_RUN_NORMAL => CallState::Normal,
        sys::ACCEL_RUN_WAITING => CallState::Waiting,
        sys::ACCEL_RUN_FINISH => CallState::Finish,
        _ => CallState::Error,
    };

    let (text, token_id) = if result.is_null() {
        (std::borrow::Cow::Borrowed(""), 0)
    } else {
        let r = &*result;
        let text = if r.text.is_null() {
            std::borrow::Cow::Borrowed("")
        } else {
            CStr::from_ptr(r.text).to_string_lossy()
        };
        (text, r.token_id)
    };

    let event = TokenEvent {
        text: &text,
        token_id,
        state: call_state,
    };
    match sink(&event) {
        CallbackDecision::Continue => 0,
        CallbackDecision::Abort => -1,
    }
}

impl Accelerator for VendorAccelerator {
    fn create_default_params(&self) -> GenParams {
        let c_param = unsafe { default_c_param() };
        c_param_to_params(&c_param)
    }

    fn init(&self, params: &GenParams) -> CallResult<()> {
        // Never hold the handle lock across the vendor call; model
        // loading can take tens of seconds.
        if self.handle.lock().is_some() {
            return Err(STATUS_ALREADY_INITIALISED);
        }
        self.arena.reset();
        let mut cstrings = Vec::new();
        let mut c_param = params_to_c(params, &mut cstrings)?;
        let mut handle: sys::AccelHandle = ptr::null_mut();
        let status = unsafe { sys::accel_init(&mut handle, &mut c_param, trampoline) };
        if status != 0 {
            return Err(status);
        }
        let mut guard = self.handle.lock();
        if guard.is_some() {
            unsafe { sys::accel_destroy(handle) };
            return Err(STATUS_ALREADY_INITIALISED);
        }
        *guard = Some(HandleCell(handle));
        Ok(())
    }

    fn destroy(&self) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let cell = guard.take().ok_or(STATUS_NOT_INITIALISED)?;
        let status = unsafe { sys::accel_destroy(cell.0) };
        if status != 0 {
            // the handle is gone either way; report the vendor status
            return Err(status);
        }
        Ok(())
    }

    fn is_initialised(&self) -> bool {
        self.handle.lock().is_some()
    }

    fn run(&self, input: &InferInput, infer: &InferParams, sink: TokenSink<'_>) -> CallResult<()> {
        self.generate(input, infer, sink, false)
    }

    fn run_async(
        &self,
        input: &InferInput,
        infer: &InferParams,
        sink: TokenSink<'_>,
    ) -> CallResult<()> {
        self.generate(input, infer, sink, true)
    }

    fn abort(&self) -> CallResult<()> {
        let handle = self.current_handle()?;
        let status = unsafe { sys::accel_abort(handle) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn is_running(&self) -> CallResult<bool> {
        let handle = self.current_handle()?;
        let status = unsafe { sys::accel_is_running(handle) };
        match status {
            0 => Ok(false),
            1 => Ok(true),
            err => Err(err),
        }
    }

    fn load_lora(&self, adapter: &LoraAdapter) -> CallResult<()> {
        let handle = self.current_handle()?;
        let mut cstrings = Vec::new();
        let mut c_adapter = sys::AccelLoraAdapter {
            lora_adapter_path: stage_str(Some(&adapter.lora_adapter_path), &mut cstrings)?,
            lora_adapter_name: stage_str(Some(&adapter.lora_adapter_name), &mut cstrings)?,
            scale: adapter.scale,
        };
        let status = unsafe { sys::accel_load_lora(handle, &mut c_adapter) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn load_prompt_cache(&self, path: &str) -> CallResult<()> {
        let handle = self.current_handle()?;
        let mut cstrings = Vec::new();
        let c_path = stage_str(Some(path), &mut cstrings)?;
        let status = unsafe { sys::accel_load_prompt_cache(handle, c_path) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn release_prompt_cache(&self) -> CallResult<()> {
        let handle = self.current_handle()?;
        let status = unsafe { sys::accel_release_prompt_cache(handle) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn clear_kv_cache(
        &self,
        keep_system_prompt: bool,
        start_pos: Option<&[i32]>,
        end_pos: Option<&[i32]>,
    ) -> CallResult<()> {
        let handle = self.current_handle()?;
        let mut start: Vec<c_int> = start_pos.map(|s| s.to_vec()).unwrap_or_default();
        let mut end: Vec<c_int> = end_pos.map(|s| s.to_vec()).unwrap_or_default();
        let status = unsafe {
            sys::accel_clear_kv_cache(
                handle,
                keep_system_prompt as c_int,
                if start.is_empty() {
                    ptr::null_mut()
                } else {
                    start.as_mut_ptr()
                },
                if end.is_empty() {
                    ptr::null_mut()
                } else {
                    end.as_mut_ptr()
                },
            )
        };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn get_kv_cache_size(&self) -> CallResult<Vec<i32>> {
        let handle = self.current_handle()?;
        let mut sizes = vec![0 as c_int; 8];
        let status = unsafe { sys::accel_get_kv_cache_size(handle, sizes.as_mut_ptr()) };
        if status != 0 {
            return Err(status);
        }
        Ok(sizes)
    }

    fn set_chat_template(
        &self,
        system_prompt: &str,
        prompt_prefix: &str,
        prompt_postfix: &str,
    ) -> CallResult<()> {
        let handle = self.current_handle()?;
        let mut cstrings = Vec::new();
        let system = stage_str(Some(system_prompt), &mut cstrings)?;
        let prefix = stage_str(Some(prompt_prefix), &mut cstrings)?;
        let postfix = stage_str(Some(prompt_postfix), &mut cstrings)?;
        let status = unsafe { sys::accel_set_chat_template(handle, system, prefix, postfix) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn set_function_tools(
        &self,
        system_prompt: &str,
        tools: &str,
        tool_response_str: &str,
    ) -> CallResult<()> {
        let handle = self.current_handle()?;
        let mut cstrings = Vec::new();
        let system = stage_str(Some(system_prompt), &mut cstrings)?;
        let tools_ptr = stage_str(Some(tools), &mut cstrings)?;
        let response = stage_str(Some(tool_response_str), &mut cstrings)?;
        let status =
            unsafe { sys::accel_set_function_tools(handle, system, tools_ptr, response) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }

    fn set_cross_attn_params(&self, params: &CrossAttnParams) -> CallResult<()> {
        let handle = self.current_handle()?;
        self.arena.reset();
        let mut f32_keep = Vec::new();
        let mut i32_keep = Vec::new();
        let mut c_params = sys::AccelCrossAttnParam {
            encoder_k_cache: self.stage_f32(&params.encoder_k_cache, &mut f32_keep),
            encoder_mask: self.stage_f32(&params.encoder_mask, &mut f32_keep),
            encoder_pos: self.stage_i32(&params.encoder_pos, &mut i32_keep),
            num_tokens: params.num_tokens,
        };
        let status = unsafe { sys::accel_set_cross_attn_params(handle, &mut c_params) };
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }
}
