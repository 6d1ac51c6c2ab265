//! JSON ↔ accelerator parameter marshalling
//!
//! Accelerator-bound requests are converted into a tagged [`Operation`]
//! with per-variant parameter structs; execution is a single match over
//! the variant. Each arm performs its own JSON conversion and its own
//! accelerator call, so there is no function-pointer table and no
//! type-erased argument passing anywhere in the dispatch path.

pub mod arena;
pub mod arrays;
pub mod input;
pub mod meta;
pub mod params;

use crate::accel::{
    Accelerator, CallbackDecision, CrossAttnParams, GenParams, InferInput, InferParams,
    LoraAdapter, TokenEvent, TokenSink,
};
use crate::config::AccelDefaults;
use crate::error::{Error, Result};
use serde_json::{json, Value};

/// One fully converted accelerator operation, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CreateDefaultParams(GenParams),
    Init(GenParams),
    Destroy,
    Run {
        input: InferInput,
        infer: InferParams,
    },
    RunAsync {
        input: InferInput,
        infer: InferParams,
    },
    Abort,
    IsRunning,
    ClearKvCache {
        keep_system_prompt: bool,
        start_pos: Option<Vec<i32>>,
        end_pos: Option<Vec<i32>>,
    },
    GetKvCacheSize,
    SetChatTemplate {
        system_prompt: String,
        prompt_prefix: String,
        prompt_postfix: String,
    },
    SetFunctionTools {
        system_prompt: String,
        tools: String,
        tool_response_str: String,
    },
    SetCrossAttnParams(CrossAttnParams),
    LoadLora(LoraAdapter),
    LoadPromptCache {
        path: String,
    },
    ReleasePromptCache,
}

impl Operation {
    /// Convert a request's method + params into an operation. The
    /// library baseline for parameter resolution comes from the
    /// accelerator itself; `config` supplies the operator overlay.
    pub fn parse(
        method: &str,
        request_params: &Value,
        accel: &dyn Accelerator,
        config: &AccelDefaults,
    ) -> Result<Operation> {
        match method {
            "create_default_params" => {
                let mut baseline = accel.create_default_params();
                params::apply_config_defaults(&mut baseline, config);
                Ok(Operation::CreateDefaultParams(baseline))
            }
            "init" => {
                let resolved =
                    params::resolve(accel.create_default_params(), config, request_params)?;
                Ok(Operation::Init(resolved))
            }
            "destroy" => Ok(Operation::Destroy),
            "run" => Ok(Operation::Run {
                input: input::parse_input(request_params)?,
                infer: input::parse_infer_params(request_params)?,
            }),
            "run_async" => Ok(Operation::RunAsync {
                input: input::parse_input(request_params)?,
                infer: input::parse_infer_params(request_params)?,
            }),
            "abort" => Ok(Operation::Abort),
            "is_running" => Ok(Operation::IsRunning),
            "clear_kv_cache" => {
                let obj = params::as_object(request_params, "params").ok();
                let keep_system_prompt = match obj {
                    Some(o) => params::opt_bool(o, "keep_system_prompt")?.unwrap_or(true),
                    None => true,
                };
                let start_pos = match obj.and_then(|o| o.get("start_pos")) {
                    Some(v) => Some(arrays::to_i32_array(v, "start_pos")?),
                    None => None,
                };
                let end_pos = match obj.and_then(|o| o.get("end_pos")) {
                    Some(v) => Some(arrays::to_i32_array(v, "end_pos")?),
                    None => None,
                };
                Ok(Operation::ClearKvCache {
                    keep_system_prompt,
                    start_pos,
                    end_pos,
                })
            }
            "get_kv_cache_size" => Ok(Operation::GetKvCacheSize),
            "set_chat_template" => {
                let obj = params::as_object(request_params, "params")?;
                Ok(Operation::SetChatTemplate {
                    system_prompt: params::req_str(obj, "system_prompt")?,
                    prompt_prefix: params::opt_str(obj, "prompt_prefix")?.unwrap_or_default(),
                    prompt_postfix: params::opt_str(obj, "prompt_postfix")?.unwrap_or_default(),
                })
            }
            "set_function_tools" => {
                let obj = params::as_object(request_params, "params")?;
                Ok(Operation::SetFunctionTools {
                    system_prompt: params::opt_str(obj, "system_prompt")?.unwrap_or_default(),
                    tools: params::req_str(obj, "tools")?,
                    tool_response_str: params::opt_str(obj, "tool_response_str")?
                        .unwrap_or_default(),
                })
            }
            "set_cross_attn_params" => Ok(Operation::SetCrossAttnParams(
                arrays::parse_cross_attn(request_params)?,
            )),
            "load_lora" => {
                let obj = params::as_object(request_params, "params")?;
                Ok(Operation::LoadLora(LoraAdapter {
                    lora_adapter_path: params::req_str(obj, "lora_adapter_path")?,
                    lora_adapter_name: params::req_str(obj, "lora_adapter_name")?,
                    scale: params::opt_f32(obj, "scale")?.unwrap_or(1.0),
                }))
            }
            "load_prompt_cache" => {
                let obj = params::as_object(request_params, "params")?;
                Ok(Operation::LoadPromptCache {
                    path: params::req_str(obj, "prompt_cache_path")?,
                })
            }
            "release_prompt_cache" => Ok(Operation::ReleasePromptCache),
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    /// The wire method name of this operation.
    pub fn method(&self) -> &'static str {
        match self {
            Operation::CreateDefaultParams(_) => "create_default_params",
            Operation::Init(_) => "init",
            Operation::Destroy => "destroy",
            Operation::Run { .. } => "run",
            Operation::RunAsync { .. } => "run_async",
            Operation::Abort => "abort",
            Operation::IsRunning => "is_running",
            Operation::ClearKvCache { .. } => "clear_kv_cache",
            Operation::GetKvCacheSize => "get_kv_cache_size",
            Operation::SetChatTemplate { .. } => "set_chat_template",
            Operation::SetFunctionTools { .. } => "set_function_tools",
            Operation::SetCrossAttnParams(_) => "set_cross_attn_params",
            Operation::LoadLora(_) => "load_lora",
            Operation::LoadPromptCache { .. } => "load_prompt_cache",
            Operation::ReleasePromptCache => "release_prompt_cache",
        }
    }

    /// Execute a non-streaming operation and marshal the result back to
    /// JSON. `RunAsync` must go through [`Operation::execute_streaming`].
    pub fn execute(&self, accel: &dyn Accelerator) -> Result<Value> {
        let method = self.method();
        match self {
            Operation::CreateDefaultParams(resolved) => Ok(params::to_json(resolved)),
            Operation::Init(resolved) => {
                accel
                    .init(resolved)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "handle_id": 1 }))
            }
            Operation::Destroy => {
                accel
                    .destroy()
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::Run { input, infer } => {
                let mut text = String::new();
                let mut tokens: u64 = 0;
                let mut sink = |event: &TokenEvent<'_>| {
                    if !event.text.is_empty() {
                        text.push_str(event.text);
                        tokens += 1;
                    }
                    CallbackDecision::Continue
                };
                accel
                    .run(input, infer, &mut sink)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "text": text, "tokens": tokens }))
            }
            Operation::RunAsync { .. } => Err(Error::Internal(
                "run_async requires a streaming sink".to_string(),
            )),
            Operation::Abort => {
                accel
                    .abort()
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::IsRunning => {
                let running = accel
                    .is_running()
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "running": running }))
            }
            Operation::ClearKvCache {
                keep_system_prompt,
                start_pos,
                end_pos,
            } => {
                accel
                    .clear_kv_cache(
                        *keep_system_prompt,
                        start_pos.as_deref(),
                        end_pos.as_deref(),
                    )
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::GetKvCacheSize => {
                let sizes = accel
                    .get_kv_cache_size()
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "cache_sizes": sizes }))
            }
            Operation::SetChatTemplate {
                system_prompt,
                prompt_prefix,
                prompt_postfix,
            } => {
                accel
                    .set_chat_template(system_prompt, prompt_prefix, prompt_postfix)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::SetFunctionTools {
                system_prompt,
                tools,
                tool_response_str,
            } => {
                accel
                    .set_function_tools(system_prompt, tools, tool_response_str)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::SetCrossAttnParams(cross_attn) => {
                accel
                    .set_cross_attn_params(cross_attn)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::LoadLora(adapter) => {
                accel
                    .load_lora(adapter)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok", "adapter": adapter.lora_adapter_name }))
            }
            Operation::LoadPromptCache { path } => {
                accel
                    .load_prompt_cache(path)
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
            Operation::ReleasePromptCache => {
                accel
                    .release_prompt_cache()
                    .map_err(|s| Error::from_accel_status(s, method))?;
                Ok(json!({ "status": "ok" }))
            }
        }
    }

    /// Execute `run_async`, driving the provided sink from the
    /// accelerator callback on the calling thread.
    pub fn execute_streaming(
        &self,
        accel: &dyn Accelerator,
        sink: TokenSink<'_>,
    ) -> Result<()> {
        match self {
            Operation::RunAsync { input, infer } => accel
                .run_async(input, infer, sink)
                .map_err(|s| Error::from_accel_status(s, self.method())),
            _ => Err(Error::Internal(format!(
                "{} is not a streaming operation",
                self.method()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::SimAccelerator;
    use serde_json::json;

    fn sim_with_model() -> SimAccelerator {
        let sim = SimAccelerator::new();
        let op = Operation::parse(
            "init",
            &json!({ "model_path": "/tmp/m.bin" }),
            &sim,
            &AccelDefaults::default(),
        )
        .unwrap();
        op.execute(&sim).unwrap();
        sim
    }

    #[test]
    fn unknown_method_fails_parse() {
        let sim = SimAccelerator::new();
        let err = Operation::parse("no_such_thing", &Value::Null, &sim, &AccelDefaults::default())
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[test]
    fn init_returns_handle_id() {
        let sim = SimAccelerator::new();
        let op = Operation::parse(
            "init",
            &json!({ "model_path": "/tmp/m.bin" }),
            &sim,
            &AccelDefaults::default(),
        )
        .unwrap();
        let result = op.execute(&sim).unwrap();
        assert_eq!(result, json!({ "handle_id": 1 }));
    }

    #[test]
    fn run_collects_generated_text() {
        let sim = sim_with_model();
        let op = Operation::parse(
            "run",
            &json!({ "prompt": "three short words" }),
            &sim,
            &AccelDefaults::default(),
        )
        .unwrap();
        let result = op.execute(&sim).unwrap();
        assert_eq!(result["text"], "three short words");
        assert_eq!(result["tokens"], 3);
    }

    #[test]
    fn is_running_uninitialised_maps_to_not_initialised() {
        let sim = SimAccelerator::new();
        let op = Operation::parse("is_running", &json!({}), &sim, &AccelDefaults::default())
            .unwrap();
        let err = op.execute(&sim).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32010);
    }

    #[test]
    fn run_async_refuses_blocking_execute() {
        let sim = sim_with_model();
        let op = Operation::parse(
            "run_async",
            &json!({ "prompt": "hi" }),
            &sim,
            &AccelDefaults::default(),
        )
        .unwrap();
        assert!(op.execute(&sim).is_err());
    }

    #[test]
    fn config_overlay_flows_into_create_default_params() {
        let sim = SimAccelerator::new();
        let config = AccelDefaults {
            max_new_tokens: Some(1024),
            ..AccelDefaults::default()
        };
        let op =
            Operation::parse("create_default_params", &Value::Null, &sim, &config).unwrap();
        let result = op.execute(&sim).unwrap();
        assert_eq!(result["max_new_tokens"], 1024);
        assert_eq!(result["max_context_len"], 512);
    }

    #[test]
    fn malformed_init_param_is_invalid_params() {
        let sim = SimAccelerator::new();
        let err = Operation::parse(
            "init",
            &json!({ "max_context_len": "not_a_number" }),
            &sim,
            &AccelDefaults::default(),
        )
        .unwrap_err();
        assert_eq!(err.json_rpc_code(), -32602);
    }
}
