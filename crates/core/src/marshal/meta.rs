//! Meta methods
//!
//! `list_functions` exposes the static operation descriptors and
//! `get_constants` the wire enums, so clients can discover the surface
//! without out-of-band documentation. Both answer directly from the
//! tables below; neither touches the accelerator.

use crate::classify::{self, CLASSIFICATION};
use serde_json::{json, Value};

/// One parameter of an exposed operation.
struct ParamDesc {
    name: &'static str,
    kind: &'static str,
    required: bool,
}

/// Static descriptor for one exposed operation.
struct OpDesc {
    name: &'static str,
    params: &'static [ParamDesc],
    returns: &'static str,
    description: &'static str,
}

const DESCRIPTORS: &[OpDesc] = &[
    OpDesc {
        name: "list_functions",
        params: &[],
        returns: "json",
        description: "List every exposed operation with its parameters and classification",
    },
    OpDesc {
        name: "get_constants",
        params: &[],
        returns: "json",
        description: "Wire enums: input types, inference modes, callback states, error codes",
    },
    OpDesc {
        name: "create_default_params",
        params: &[],
        returns: "params",
        description: "Resolved default generation parameters (library defaults plus configuration overlay)",
    },
    OpDesc {
        name: "init",
        params: &[
            ParamDesc { name: "model_path", kind: "string", required: false },
            ParamDesc { name: "max_context_len", kind: "integer", required: false },
            ParamDesc { name: "max_new_tokens", kind: "integer", required: false },
            ParamDesc { name: "extend_param", kind: "object", required: false },
        ],
        returns: "status",
        description: "Load a model and create the singleton accelerator handle",
    },
    OpDesc {
        name: "destroy",
        params: &[],
        returns: "status",
        description: "Destroy the accelerator handle and release the model",
    },
    OpDesc {
        name: "run",
        params: &[
            ParamDesc { name: "prompt", kind: "string", required: false },
            ParamDesc { name: "input_type", kind: "integer", required: false },
            ParamDesc { name: "infer_params", kind: "object", required: false },
        ],
        returns: "json",
        description: "Synchronous inference; one response when generation completes",
    },
    OpDesc {
        name: "run_async",
        params: &[
            ParamDesc { name: "prompt", kind: "string", required: false },
            ParamDesc { name: "input_type", kind: "integer", required: false },
            ParamDesc { name: "infer_params", kind: "object", required: false },
        ],
        returns: "stream",
        description: "Streaming inference; chunks flow as notifications on the originating connection",
    },
    OpDesc {
        name: "abort",
        params: &[],
        returns: "status",
        description: "Interrupt any in-progress generation and abort the active stream",
    },
    OpDesc {
        name: "is_running",
        params: &[],
        returns: "json",
        description: "Whether a generation is currently running",
    },
    OpDesc {
        name: "clear_kv_cache",
        params: &[
            ParamDesc { name: "keep_system_prompt", kind: "boolean", required: false },
            ParamDesc { name: "start_pos", kind: "int[]", required: false },
            ParamDesc { name: "end_pos", kind: "int[]", required: false },
        ],
        returns: "status",
        description: "Clear the key-value cache",
    },
    OpDesc {
        name: "get_kv_cache_size",
        params: &[],
        returns: "json",
        description: "Current key-value cache sizes",
    },
    OpDesc {
        name: "set_chat_template",
        params: &[
            ParamDesc { name: "system_prompt", kind: "string", required: true },
            ParamDesc { name: "prompt_prefix", kind: "string", required: false },
            ParamDesc { name: "prompt_postfix", kind: "string", required: false },
        ],
        returns: "status",
        description: "Set the chat template",
    },
    OpDesc {
        name: "set_function_tools",
        params: &[
            ParamDesc { name: "system_prompt", kind: "string", required: false },
            ParamDesc { name: "tools", kind: "string", required: true },
            ParamDesc { name: "tool_response_str", kind: "string", required: false },
        ],
        returns: "status",
        description: "Set the function-calling configuration",
    },
    OpDesc {
        name: "set_cross_attn_params",
        params: &[
            ParamDesc { name: "encoder_k_cache", kind: "float[][][][]", required: true },
            ParamDesc { name: "encoder_mask", kind: "float[]", required: false },
            ParamDesc { name: "encoder_pos", kind: "int[]", required: false },
            ParamDesc { name: "num_tokens", kind: "integer", required: false },
        ],
        returns: "status",
        description: "Set the decoder cross-attention parameters",
    },
    OpDesc {
        name: "load_lora",
        params: &[
            ParamDesc { name: "lora_adapter_path", kind: "string", required: true },
            ParamDesc { name: "lora_adapter_name", kind: "string", required: true },
            ParamDesc { name: "scale", kind: "number", required: false },
        ],
        returns: "status",
        description: "Load a LoRA adapter",
    },
    OpDesc {
        name: "load_prompt_cache",
        params: &[ParamDesc { name: "prompt_cache_path", kind: "string", required: true }],
        returns: "status",
        description: "Load a prompt cache from a file",
    },
    OpDesc {
        name: "release_prompt_cache",
        params: &[],
        returns: "status",
        description: "Release the prompt cache from memory",
    },
    OpDesc {
        name: "queue_status",
        params: &[],
        returns: "json",
        description: "Scheduler queue depth, busy state and statistics",
    },
    OpDesc {
        name: "stream_pause",
        params: &[ParamDesc { name: "session_id", kind: "string", required: false }],
        returns: "status",
        description: "Withhold chunk delivery for a streaming session",
    },
    OpDesc {
        name: "stream_resume",
        params: &[ParamDesc { name: "session_id", kind: "string", required: false }],
        returns: "status",
        description: "Resume chunk delivery for a paused session",
    },
    OpDesc {
        name: "stream_stats",
        params: &[ParamDesc { name: "session_id", kind: "string", required: false }],
        returns: "json",
        description: "Statistics for a streaming session",
    },
];

/// Response body of `list_functions`.
pub fn list_functions() -> Value {
    let functions: Vec<Value> = DESCRIPTORS
        .iter()
        .map(|desc| {
            json!({
                "name": desc.name,
                "classification": classify::classify(desc.name).as_str(),
                "needs_accel_memory": classify::needs_accel_memory(desc.name),
                "estimated_ms": classify_estimate(desc.name),
                "returns": desc.returns,
                "description": desc.description,
                "params": desc.params.iter().map(|p| json!({
                    "name": p.name,
                    "type": p.kind,
                    "required": p.required,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "functions": functions })
}

fn classify_estimate(method: &str) -> Value {
    CLASSIFICATION
        .iter()
        .find(|e| e.method == method)
        .and_then(|e| e.estimated_ms)
        .map(|ms| json!(ms))
        .unwrap_or(Value::Null)
}

/// Response body of `get_constants`.
pub fn get_constants() -> Value {
    json!({
        "input_types": {
            "prompt": 0,
            "token": 1,
            "embed": 2,
            "multimodal": 3,
        },
        "infer_modes": {
            "generate": 0,
            "get_last_hidden_layer": 1,
            "get_logits": 2,
        },
        "call_states": {
            "normal": 0,
            "waiting": 1,
            "finish": 2,
            "error": 3,
        },
        "error_codes": {
            "parse": -32700,
            "invalid_request": -32600,
            "method_not_found": -32601,
            "invalid_params": -32602,
            "internal": -32603,
            "init_failed": -32001,
            "memory": -32003,
            "inference": -32004,
            "timeout": -32005,
            "aborted": -32006,
            "busy": -32007,
            "file": -32008,
            "config": -32009,
            "not_initialised": -32010,
            "unsupported": -32011,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_descriptor_is_classified() {
        let listing = list_functions();
        let functions = listing["functions"].as_array().unwrap();
        assert_eq!(functions.len(), DESCRIPTORS.len());
        for f in functions {
            assert!(
                ["instant", "accelerator_queued", "streaming"]
                    .contains(&f["classification"].as_str().unwrap()),
                "{} has no classification",
                f["name"]
            );
        }
    }

    #[test]
    fn every_classified_method_has_a_descriptor() {
        let names: Vec<&str> = DESCRIPTORS.iter().map(|d| d.name).collect();
        for entry in CLASSIFICATION {
            assert!(
                names.contains(&entry.method),
                "{} missing from descriptors",
                entry.method
            );
        }
    }

    #[test]
    fn constants_cover_error_codes() {
        let constants = get_constants();
        assert_eq!(constants["error_codes"]["not_initialised"], -32010);
        assert_eq!(constants["input_types"]["multimodal"], 3);
    }
}
