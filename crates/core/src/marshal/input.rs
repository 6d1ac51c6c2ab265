//! Inference input and per-run parameter conversion
//!
//! The wire input is a tagged map: `input_type` selects prompt, embed,
//! token or multimodal; the matching payload object supplies the packed
//! arrays. `infer_params` carries the run mode plus the nested lora and
//! prompt-cache sub-params.

use super::arrays::{to_f32_array, to_i32_array};
use super::params::{as_object, opt_bool, opt_i32, opt_str, opt_u64, req_str};
use crate::accel::{InferInput, InferMode, InferParams, LoraSelect, PromptCacheCtl};
use crate::error::{Error, Result};
use serde_json::{Map, Value};

// Wire values of the input_type selector.
const INPUT_TYPE_PROMPT: i64 = 0;
const INPUT_TYPE_TOKEN: i64 = 1;
const INPUT_TYPE_EMBED: i64 = 2;
const INPUT_TYPE_MULTIMODAL: i64 = 3;

/// Parse the inference input from a request params object.
///
/// For prompt inputs the shorthand `{"prompt": "..."}` (no selector) is
/// accepted; everything else requires the `input_type` tag.
pub fn parse_input(params: &Value) -> Result<InferInput> {
    let obj = as_object(params, "params")?;

    let role = opt_str(obj, "role")?;
    let enable_thinking = opt_bool(obj, "enable_thinking")?.unwrap_or(false);

    let input_type = match obj.get("input_type") {
        None => INPUT_TYPE_PROMPT,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| Error::invalid_param("input_type", "integer"))?,
    };

    match input_type {
        INPUT_TYPE_PROMPT => {
            let prompt = req_str(obj, "prompt")?;
            Ok(InferInput::Prompt {
                role,
                enable_thinking,
                prompt,
            })
        }
        INPUT_TYPE_TOKEN => {
            let payload = nested(obj, "token_input")?;
            let input_ids = match payload.get("input_ids") {
                Some(v) => to_i32_array(v, "token_input.input_ids")?,
                None => return Err(Error::invalid_param("token_input.input_ids", "array of integers")),
            };
            let n_tokens = opt_u64(payload, "n_tokens")?
                .map(|n| n as usize)
                .unwrap_or(input_ids.len());
            if n_tokens != input_ids.len() {
                return Err(Error::InvalidParams {
                    message: "Invalid parameters".to_string(),
                    data: Some(serde_json::json!({
                        "field": "token_input.input_ids",
                        "expected": format!("{n_tokens} elements"),
                        "found": input_ids.len(),
                    })),
                });
            }
            Ok(InferInput::Token {
                n_tokens,
                input_ids,
            })
        }
        INPUT_TYPE_EMBED => {
            let payload = nested(obj, "embed_input")?;
            let embed = match payload.get("embed") {
                Some(v) => to_f32_array(v, "embed_input.embed")?,
                None => return Err(Error::invalid_param("embed_input.embed", "array of numbers")),
            };
            let n_tokens = opt_u64(payload, "n_tokens")?
                .map(|n| n as usize)
                .unwrap_or(embed.len());
            Ok(InferInput::Embed { n_tokens, embed })
        }
        INPUT_TYPE_MULTIMODAL => {
            let payload = nested(obj, "multimodal_input")?;
            let prompt = req_str(payload, "prompt")?;
            let image_embed = match payload.get("image_embed") {
                Some(v) => to_f32_array(v, "multimodal_input.image_embed")?,
                None => Vec::new(),
            };
            Ok(InferInput::Multimodal {
                prompt,
                image_embed,
                n_image_tokens: opt_u64(payload, "n_image_tokens")?.unwrap_or(0) as usize,
                n_image: opt_u64(payload, "n_image")?.unwrap_or(0) as usize,
                image_width: opt_u64(payload, "image_width")?.unwrap_or(0) as usize,
                image_height: opt_u64(payload, "image_height")?.unwrap_or(0) as usize,
            })
        }
        other => Err(Error::InvalidParams {
            message: "Invalid parameters".to_string(),
            data: Some(serde_json::json!({
                "field": "input_type",
                "expected": "0 (prompt), 1 (token), 2 (embed) or 3 (multimodal)",
                "found": other,
            })),
        }),
    }
}

fn nested<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a Map<String, Value>> {
    obj.get(field)
        .ok_or_else(|| Error::invalid_param(field, "object"))?
        .as_object()
        .ok_or_else(|| Error::invalid_param(field, "object"))
}

/// Parse the optional `infer_params` object from a request.
pub fn parse_infer_params(params: &Value) -> Result<InferParams> {
    let root = match params.as_object() {
        Some(o) => o,
        None => return Ok(InferParams::default()),
    };
    let obj = match root.get("infer_params") {
        Some(Value::Object(o)) => o,
        Some(Value::Null) | None => return Ok(InferParams::default()),
        Some(_) => return Err(Error::invalid_param("infer_params", "object")),
    };

    let mode = match opt_i32(obj, "mode")? {
        None | Some(0) => InferMode::Generate,
        Some(1) => InferMode::GetLastHiddenLayer,
        Some(2) => InferMode::GetLogits,
        Some(other) => {
            return Err(Error::InvalidParams {
                message: "Invalid parameters".to_string(),
                data: Some(serde_json::json!({
                    "field": "infer_params.mode",
                    "expected": "0, 1 or 2",
                    "found": other,
                })),
            })
        }
    };

    let keep_history = match obj.get("keep_history") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(v) => v
            .as_i64()
            .map(|n| n != 0)
            .ok_or_else(|| Error::invalid_param("infer_params.keep_history", "boolean"))?,
    };

    let lora = match obj.get("lora_params") {
        Some(Value::Object(lp)) => Some(LoraSelect {
            adapter_name: req_str(lp, "lora_adapter_name")?,
        }),
        Some(Value::Null) | None => None,
        Some(_) => return Err(Error::invalid_param("infer_params.lora_params", "object")),
    };

    let prompt_cache = match obj.get("prompt_cache_params") {
        Some(Value::Object(pc)) => {
            // the wire accepts 0/1 as well as booleans here
            let save_prompt_cache = match pc.get("save_prompt_cache") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(b)) => *b,
                Some(v) => v.as_i64().map(|n| n != 0).ok_or_else(|| {
                    Error::invalid_param("infer_params.prompt_cache_params.save_prompt_cache", "boolean")
                })?,
            };
            Some(PromptCacheCtl {
                save_prompt_cache,
                prompt_cache_path: opt_str(pc, "prompt_cache_path")?,
            })
        }
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(Error::invalid_param(
                "infer_params.prompt_cache_params",
                "object",
            ))
        }
    };

    Ok(InferParams {
        mode,
        keep_history,
        lora,
        prompt_cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_shorthand() {
        let params = json!({ "prompt": "hi", "stream": true });
        let input = parse_input(&params).unwrap();
        assert_eq!(
            input,
            InferInput::Prompt {
                role: None,
                enable_thinking: false,
                prompt: "hi".to_string(),
            }
        );
    }

    #[test]
    fn token_input_checks_length() {
        let params = json!({
            "input_type": 1,
            "token_input": { "n_tokens": 2, "input_ids": [1, 2, 3] }
        });
        let err = parse_input(&params).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32602);

        let params = json!({
            "input_type": 1,
            "token_input": { "input_ids": [1, 2, 3] }
        });
        let input = parse_input(&params).unwrap();
        assert_eq!(
            input,
            InferInput::Token {
                n_tokens: 3,
                input_ids: vec![1, 2, 3],
            }
        );
    }

    #[test]
    fn embed_input_widens_integers() {
        let params = json!({
            "input_type": 2,
            "embed_input": { "embed": [1, 2.5] }
        });
        let input = parse_input(&params).unwrap();
        assert_eq!(
            input,
            InferInput::Embed {
                n_tokens: 2,
                embed: vec![1.0, 2.5],
            }
        );
    }

    #[test]
    fn unknown_selector_is_structured_error() {
        let params = json!({ "input_type": 9, "prompt": "x" });
        let err = parse_input(&params).unwrap_err();
        let data = err.json_rpc_data().unwrap();
        assert_eq!(data["field"], "input_type");
    }

    #[test]
    fn infer_params_defaults() {
        let parsed = parse_infer_params(&json!({ "prompt": "hi" })).unwrap();
        assert_eq!(parsed, InferParams::default());
    }

    #[test]
    fn infer_params_nested_structs() {
        let parsed = parse_infer_params(&json!({
            "infer_params": {
                "mode": 0,
                "keep_history": 0,
                "lora_params": { "lora_adapter_name": "style" },
                "prompt_cache_params": {
                    "save_prompt_cache": true,
                    "prompt_cache_path": "/tmp/cache.bin"
                }
            }
        }))
        .unwrap();
        assert!(!parsed.keep_history);
        assert_eq!(parsed.lora.unwrap().adapter_name, "style");
        let cache = parsed.prompt_cache.unwrap();
        assert!(cache.save_prompt_cache);
        assert_eq!(cache.prompt_cache_path.as_deref(), Some("/tmp/cache.bin"));
    }
}
