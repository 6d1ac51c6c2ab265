//! Simulated accelerator backend
//!
//! A deterministic in-process stand-in for the vendor library, used by
//! default builds and by every test. It enforces the same contract the
//! vendor does (singleton handle, blocking callback-driven generation,
//! abort via flag or sink decision, vendor status codes on failure)
//! while generating tokens by echoing the prompt fragment by fragment.

use super::{
    Accelerator, CallResult, CallState, CallbackDecision, CrossAttnParams, ExtendParams,
    GenParams, InferInput, InferParams, LoraAdapter, TokenEvent, TokenSink,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

// Vendor status codes the simulator reproduces.
const STATUS_INVALID_PARAM: i32 = -1;
const STATUS_NOT_INITIALISED: i32 = -5;
const STATUS_ALREADY_INITIALISED: i32 = -6;
const STATUS_ABORTED: i32 = -9;
const STATUS_FILE_NOT_FOUND: i32 = -12;
const STATUS_BUSY: i32 = -15;

/// Model state behind the singleton handle.
#[derive(Debug, Default)]
struct LoadedModel {
    model_path: String,
    max_new_tokens: i32,
    loras: Vec<String>,
    prompt_cache_loaded: bool,
    chat_template: Option<(String, String, String)>,
    function_tools: Option<String>,
    cross_attn_tokens: usize,
}

/// Deterministic accelerator simulator.
pub struct SimAccelerator {
    handle: Mutex<Option<LoadedModel>>,
    running: AtomicBool,
    abort_requested: AtomicBool,
    token_delay: std::time::Duration,
}

impl SimAccelerator {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            running: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            token_delay: std::time::Duration::ZERO,
        }
    }

    /// Slow generation down to one fragment per `delay`, for exercising
    /// abort and backpressure paths.
    pub fn with_token_delay(delay: std::time::Duration) -> Self {
        Self {
            token_delay: delay,
            ..Self::new()
        }
    }

    /// Introspection for tests and diagnostics: the loaded model's
    /// state, or `None` when no handle exists.
    pub fn state_snapshot(&self) -> Option<serde_json::Value> {
        let guard = self.handle.lock();
        guard.as_ref().map(|model| {
            serde_json::json!({
                "model_path": model.model_path,
                "max_new_tokens": model.max_new_tokens,
                "loras": model.loras,
                "prompt_cache_loaded": model.prompt_cache_loaded,
                "chat_template_set": model.chat_template.is_some(),
                "function_tools_set": model.function_tools.is_some(),
                "cross_attn_tokens": model.cross_attn_tokens,
            })
        })
    }

    /// Split a prompt into the fragments the simulator streams:
    /// whitespace-separated words, each carrying its following space so
    /// the concatenation reproduces the prompt.
    fn fragments(prompt: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        for ch in prompt.chars() {
            current.push(ch);
            if ch.is_whitespace() {
                out.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    fn generate(
        &self,
        input: &InferInput,
        _infer: &InferParams,
        sink: TokenSink<'_>,
    ) -> CallResult<()> {
        let max_new_tokens = {
            let guard = self.handle.lock();
            let model = guard.as_ref().ok_or(STATUS_NOT_INITIALISED)?;
            model.max_new_tokens
        };

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(STATUS_BUSY);
        }
        self.abort_requested.store(false, Ordering::SeqCst);

        let result = self.drive_callbacks(input, max_new_tokens, sink);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn drive_callbacks(
        &self,
        input: &InferInput,
        max_new_tokens: i32,
        sink: TokenSink<'_>,
    ) -> CallResult<()> {
        let fragments = match input {
            InferInput::Prompt { prompt, .. } => Self::fragments(prompt),
            InferInput::Multimodal { prompt, .. } => Self::fragments(prompt),
            InferInput::Token { input_ids, .. } => input_ids
                .iter()
                .map(|id| format!("<{id}>"))
                .collect(),
            InferInput::Embed { n_tokens, .. } => {
                vec![format!("[embedding:{n_tokens}]")]
            }
        };

        // Prefill phase: one state-only Waiting callback before tokens.
        let waiting = TokenEvent {
            text: "",
            token_id: 0,
            state: CallState::Waiting,
        };
        if sink(&waiting) == CallbackDecision::Abort {
            return Err(STATUS_ABORTED);
        }

        let cap = if max_new_tokens > 0 {
            max_new_tokens as usize
        } else {
            usize::MAX
        };

        for (i, fragment) in fragments.iter().take(cap).enumerate() {
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            if self.abort_requested.load(Ordering::SeqCst) {
                return Err(STATUS_ABORTED);
            }
            let event = TokenEvent {
                text: fragment,
                token_id: i as i32 + 1,
                state: CallState::Normal,
            };
            if sink(&event) == CallbackDecision::Abort {
                return Err(STATUS_ABORTED);
            }
        }

        if self.abort_requested.load(Ordering::SeqCst) {
            return Err(STATUS_ABORTED);
        }

        let finish = TokenEvent {
            text: "",
            token_id: 0,
            state: CallState::Finish,
        };
        if sink(&finish) == CallbackDecision::Abort {
            return Err(STATUS_ABORTED);
        }
        Ok(())
    }
}

impl Default for SimAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for SimAccelerator {
    fn create_default_params(&self) -> GenParams {
        // The library baseline the three-tier resolution starts from.
        GenParams {
            model_path: None,
            max_context_len: 512,
            max_new_tokens: 256,
            top_k: 40,
            n_keep: 0,
            top_p: 0.9,
            temperature: 0.8,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            skip_special_token: false,
            img_start: None,
            img_end: None,
            img_content: None,
            extend: ExtendParams {
                base_domain_id: 0,
                embed_flash: 0,
                enabled_cpus_num: 4,
                enabled_cpus_mask: 0xF0,
                n_batch: 1,
                use_cross_attn: 0,
            },
        }
    }

    fn init(&self, params: &GenParams) -> CallResult<()> {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return Err(STATUS_ALREADY_INITIALISED);
        }
        let model_path = match params.model_path.as_deref() {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return Err(STATUS_INVALID_PARAM),
        };
        *guard = Some(LoadedModel {
            model_path,
            max_new_tokens: params.max_new_tokens,
            ..LoadedModel::default()
        });
        Ok(())
    }

    fn destroy(&self) -> CallResult<()> {
        let mut guard = self.handle.lock();
        if guard.take().is_none() {
            return Err(STATUS_NOT_INITIALISED);
        }
        Ok(())
    }

    fn is_initialised(&self) -> bool {
        self.handle.lock().is_some()
    }

    fn run(&self, input: &InferInput, infer: &InferParams, sink: TokenSink<'_>) -> CallResult<()> {
        self.generate(input, infer, sink)
    }

    fn run_async(
        &self,
        input: &InferInput,
        infer: &InferParams,
        sink: TokenSink<'_>,
    ) -> CallResult<()> {
        self.generate(input, infer, sink)
    }

    fn abort(&self) -> CallResult<()> {
        self.abort_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> CallResult<bool> {
        if !self.is_initialised() {
            return Err(STATUS_NOT_INITIALISED);
        }
        Ok(self.running.load(Ordering::SeqCst))
    }

    fn load_lora(&self, adapter: &LoraAdapter) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let model = guard.as_mut().ok_or(STATUS_NOT_INITIALISED)?;
        if !Path::new(&adapter.lora_adapter_path).exists() {
            return Err(STATUS_FILE_NOT_FOUND);
        }
        model.loras.push(adapter.lora_adapter_name.clone());
        Ok(())
    }

    fn load_prompt_cache(&self, path: &str) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let model = guard.as_mut().ok_or(STATUS_NOT_INITIALISED)?;
        if !Path::new(path).exists() {
            return Err(STATUS_FILE_NOT_FOUND);
        }
        model.prompt_cache_loaded = true;
        Ok(())
    }

    fn release_prompt_cache(&self) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let model = guard.as_mut().ok_or(STATUS_NOT_INITIALISED)?;
        model.prompt_cache_loaded = false;
        Ok(())
    }

    fn clear_kv_cache(
        &self,
        _keep_system_prompt: bool,
        _start_pos: Option<&[i32]>,
        _end_pos: Option<&[i32]>,
    ) -> CallResult<()> {
        let guard = self.handle.lock();
        guard.as_ref().ok_or(STATUS_NOT_INITIALISED)?;
        Ok(())
    }

    fn get_kv_cache_size(&self) -> CallResult<Vec<i32>> {
        let guard = self.handle.lock();
        guard.as_ref().ok_or(STATUS_NOT_INITIALISED)?;
        Ok(vec![0, 0])
    }

    fn set_chat_template(
        &self,
        system_prompt: &str,
        prompt_prefix: &str,
        prompt_postfix: &str,
    ) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let model = guard.as_mut().ok_or(STATUS_NOT_INITIALISED)?;
        model.chat_template = Some((
            system_prompt.to_string(),
            prompt_prefix.to_string(),
            prompt_postfix.to_string(),
        ));
        Ok(())
    }

    fn set_function_tools(
        &self,
        _system_prompt: &str,
        tools: &str,
        _tool_response_str: &str,
    ) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let model = guard.as_mut().ok_or(STATUS_NOT_INITIALISED)?;
        model.function_tools = Some(tools.to_string());
        Ok(())
    }

    fn set_cross_attn_params(&self, params: &CrossAttnParams) -> CallResult<()> {
        let mut guard = self.handle.lock();
        let model = guard.as_mut().ok_or(STATUS_NOT_INITIALISED)?;
        model.cross_attn_tokens = params.num_tokens;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_sim() -> SimAccelerator {
        let sim = SimAccelerator::new();
        let mut params = sim.create_default_params();
        params.model_path = Some("/tmp/test-model.bin".to_string());
        sim.init(&params).unwrap();
        sim
    }

    #[test]
    fn init_is_singleton() {
        let sim = init_sim();
        let mut params = sim.create_default_params();
        params.model_path = Some("/tmp/other.bin".to_string());
        assert_eq!(sim.init(&params), Err(STATUS_ALREADY_INITIALISED));
        sim.destroy().unwrap();
        assert_eq!(sim.destroy(), Err(STATUS_NOT_INITIALISED));
        assert!(sim.init(&params).is_ok());
    }

    #[test]
    fn init_without_model_path_fails() {
        let sim = SimAccelerator::new();
        let params = sim.create_default_params();
        assert_eq!(sim.init(&params), Err(STATUS_INVALID_PARAM));
    }

    #[test]
    fn generation_echoes_prompt_and_finishes() {
        let sim = init_sim();
        let input = InferInput::Prompt {
            role: None,
            enable_thinking: false,
            prompt: "hello brave world".to_string(),
        };
        let mut collected = String::new();
        let mut states = Vec::new();
        let mut sink = |event: &TokenEvent<'_>| {
            collected.push_str(event.text);
            states.push(event.state);
            CallbackDecision::Continue
        };
        sim.run_async(&input, &InferParams::default(), &mut sink)
            .unwrap();

        assert_eq!(collected, "hello brave world");
        assert_eq!(states.first(), Some(&CallState::Waiting));
        assert_eq!(states.last(), Some(&CallState::Finish));
        assert_eq!(
            states.iter().filter(|s| **s == CallState::Normal).count(),
            3
        );
    }

    #[test]
    fn sink_abort_interrupts_generation() {
        let sim = init_sim();
        let input = InferInput::Prompt {
            role: None,
            enable_thinking: false,
            prompt: "one two three four".to_string(),
        };
        let mut seen = 0;
        let mut sink = |event: &TokenEvent<'_>| {
            if event.state == CallState::Normal {
                seen += 1;
                if seen == 2 {
                    return CallbackDecision::Abort;
                }
            }
            CallbackDecision::Continue
        };
        let status = sim.run_async(&input, &InferParams::default(), &mut sink);
        assert_eq!(status, Err(STATUS_ABORTED));
        assert_eq!(seen, 2);
        // a failed run leaves the accelerator idle again
        assert!(!sim.is_running().unwrap());
    }

    #[test]
    fn uninitialised_calls_report_status() {
        let sim = SimAccelerator::new();
        assert_eq!(sim.is_running(), Err(STATUS_NOT_INITIALISED));
        assert_eq!(sim.get_kv_cache_size(), Err(STATUS_NOT_INITIALISED));
        let input = InferInput::Prompt {
            role: None,
            enable_thinking: false,
            prompt: "x".to_string(),
        };
        let mut sink = |_: &TokenEvent<'_>| CallbackDecision::Continue;
        assert_eq!(
            sim.run(&input, &InferParams::default(), &mut sink),
            Err(STATUS_NOT_INITIALISED)
        );
    }

    #[test]
    fn missing_lora_file_is_a_file_error() {
        let sim = init_sim();
        let adapter = LoraAdapter {
            lora_adapter_path: "/nonexistent/adapter.bin".to_string(),
            lora_adapter_name: "style".to_string(),
            scale: 1.0,
        };
        assert_eq!(sim.load_lora(&adapter), Err(STATUS_FILE_NOT_FOUND));
    }

    #[test]
    fn prompt_cache_round_trip() {
        let sim = init_sim();
        let file = tempfile::NamedTempFile::new().unwrap();
        sim.load_prompt_cache(file.path().to_str().unwrap()).unwrap();
        assert_eq!(
            sim.state_snapshot().unwrap()["prompt_cache_loaded"],
            true
        );
        sim.release_prompt_cache().unwrap();
        assert_eq!(
            sim.state_snapshot().unwrap()["prompt_cache_loaded"],
            false
        );
    }

    #[test]
    fn handle_state_tracks_configuration_calls() {
        let sim = init_sim();
        sim.set_chat_template("system", "<user>", "</user>").unwrap();
        sim.set_function_tools("system", "[]", "tool_response").unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        let adapter = LoraAdapter {
            lora_adapter_path: file.path().to_str().unwrap().to_string(),
            lora_adapter_name: "style".to_string(),
            scale: 0.5,
        };
        sim.load_lora(&adapter).unwrap();

        let snapshot = sim.state_snapshot().unwrap();
        assert_eq!(snapshot["model_path"], "/tmp/test-model.bin");
        assert_eq!(snapshot["chat_template_set"], true);
        assert_eq!(snapshot["function_tools_set"], true);
        assert_eq!(snapshot["loras"][0], "style");
    }

    #[test]
    fn token_input_renders_ids() {
        let sim = init_sim();
        let input = InferInput::Token {
            n_tokens: 3,
            input_ids: vec![5, 6, 7],
        };
        let mut collected = String::new();
        let mut sink = |event: &TokenEvent<'_>| {
            collected.push_str(event.text);
            CallbackDecision::Continue
        };
        sim.run(&input, &InferParams::default(), &mut sink).unwrap();
        assert_eq!(collected, "<5><6><7>");
    }
}
