//! Generation-parameter resolution
//!
//! Three tiers, merged by explicit presence: the accelerator library's
//! own defaults form the baseline, configuration overlays only the keys
//! the operator wrote, and the caller overlays only the keys present in
//! the request JSON. A caller explicitly sending a value equal to the
//! library default therefore keeps that value; nothing is inferred from
//! equality.

use crate::accel::GenParams;
use crate::config::AccelDefaults;
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Batch size must stay inside the accelerator's documented window.
pub const N_BATCH_MIN: u8 = 1;
pub const N_BATCH_MAX: u8 = 100;

// Typed field extractors shared by the marshalling arms. Each returns
// Ok(None) when the key is absent and a structured InvalidParams error
// naming the field when the key is present with the wrong type.

pub(crate) fn opt_str(obj: &Map<String, Value>, field: &str) -> Result<Option<String>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Error::invalid_param(field, "string")),
    }
}

pub(crate) fn opt_i32(obj: &Map<String, Value>, field: &str) -> Result<Option<i32>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if (i32::MIN as i64..=i32::MAX as i64).contains(&n) => Ok(Some(n as i32)),
            _ => Err(Error::invalid_param(field, "integer")),
        },
    }
}

pub(crate) fn opt_u64(obj: &Map<String, Value>, field: &str) -> Result<Option<u64>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::invalid_param(field, "unsigned integer")),
    }
}

pub(crate) fn opt_f32(obj: &Map<String, Value>, field: &str) -> Result<Option<f32>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(|n| Some(n as f32))
            .ok_or_else(|| Error::invalid_param(field, "number")),
    }
}

pub(crate) fn opt_bool(obj: &Map<String, Value>, field: &str) -> Result<Option<bool>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::invalid_param(field, "boolean")),
    }
}

pub(crate) fn req_str(obj: &Map<String, Value>, field: &str) -> Result<String> {
    opt_str(obj, field)?.ok_or_else(|| Error::invalid_param(field, "string"))
}

pub(crate) fn as_object<'a>(params: &'a Value, field: &str) -> Result<&'a Map<String, Value>> {
    params
        .as_object()
        .ok_or_else(|| Error::invalid_param(field, "object"))
}

/// Tier 2: overlay configuration defaults onto the library baseline.
/// Only keys the operator actually set participate.
pub fn apply_config_defaults(params: &mut GenParams, defaults: &AccelDefaults) {
    macro_rules! overlay {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = defaults.$field.clone() {
                params.$field = Some(v);
            })*
        };
    }
    // model_path is the only Option-typed target field
    overlay!(model_path);

    macro_rules! overlay_scalar {
        ($($field:ident),* $(,)?) => {
            $(if let Some(v) = defaults.$field {
                params.$field = v;
            })*
        };
    }
    overlay_scalar!(
        max_context_len,
        max_new_tokens,
        top_k,
        n_keep,
        top_p,
        temperature,
        repeat_penalty,
        frequency_penalty,
        presence_penalty,
        mirostat,
        mirostat_tau,
        mirostat_eta,
        skip_special_token,
    );

    let ext = &defaults.extend;
    if let Some(v) = ext.base_domain_id {
        params.extend.base_domain_id = v;
    }
    if let Some(v) = ext.embed_flash {
        params.extend.embed_flash = v;
    }
    if let Some(v) = ext.enabled_cpus_num {
        params.extend.enabled_cpus_num = v;
    }
    if let Some(v) = ext.enabled_cpus_mask {
        params.extend.enabled_cpus_mask = v;
    }
    if let Some(v) = ext.n_batch {
        params.extend.n_batch = v;
    }
    if let Some(v) = ext.use_cross_attn {
        params.extend.use_cross_attn = v;
    }
}

/// Tier 3: overlay the keys the caller actually provided, with type
/// checking per field. Unknown keys are ignored (forward compatibility);
/// known keys with the wrong type are structured errors.
pub fn apply_caller_params(params: &mut GenParams, json: &Value) -> Result<()> {
    let obj = match json {
        Value::Null => return Ok(()),
        other => as_object(other, "params")?,
    };

    if let Some(v) = opt_str(obj, "model_path")? {
        params.model_path = Some(v);
    }
    if let Some(v) = opt_i32(obj, "max_context_len")? {
        params.max_context_len = v;
    }
    if let Some(v) = opt_i32(obj, "max_new_tokens")? {
        params.max_new_tokens = v;
    }
    if let Some(v) = opt_i32(obj, "top_k")? {
        params.top_k = v;
    }
    if let Some(v) = opt_i32(obj, "n_keep")? {
        params.n_keep = v;
    }
    if let Some(v) = opt_f32(obj, "top_p")? {
        params.top_p = v;
    }
    if let Some(v) = opt_f32(obj, "temperature")? {
        params.temperature = v;
    }
    if let Some(v) = opt_f32(obj, "repeat_penalty")? {
        params.repeat_penalty = v;
    }
    if let Some(v) = opt_f32(obj, "frequency_penalty")? {
        params.frequency_penalty = v;
    }
    if let Some(v) = opt_f32(obj, "presence_penalty")? {
        params.presence_penalty = v;
    }
    if let Some(v) = opt_i32(obj, "mirostat")? {
        params.mirostat = v;
    }
    if let Some(v) = opt_f32(obj, "mirostat_tau")? {
        params.mirostat_tau = v;
    }
    if let Some(v) = opt_f32(obj, "mirostat_eta")? {
        params.mirostat_eta = v;
    }
    if let Some(v) = opt_bool(obj, "skip_special_token")? {
        params.skip_special_token = v;
    }
    if let Some(v) = opt_str(obj, "img_start")? {
        params.img_start = Some(v);
    }
    if let Some(v) = opt_str(obj, "img_end")? {
        params.img_end = Some(v);
    }
    if let Some(v) = opt_str(obj, "img_content")? {
        params.img_content = Some(v);
    }

    if let Some(extend) = obj.get("extend_param") {
        let ext = as_object(extend, "extend_param")?;
        if let Some(v) = opt_i32(ext, "base_domain_id")? {
            params.extend.base_domain_id = v;
        }
        if let Some(v) = opt_i32(ext, "embed_flash")? {
            params.extend.embed_flash = v as i8;
        }
        if let Some(v) = opt_i32(ext, "enabled_cpus_num")? {
            params.extend.enabled_cpus_num = v as i8;
        }
        if let Some(v) = opt_u64(ext, "enabled_cpus_mask")? {
            params.extend.enabled_cpus_mask = v as u32;
        }
        if let Some(v) = opt_i32(ext, "n_batch")? {
            params.extend.n_batch = v.clamp(0, u8::MAX as i32) as u8;
        }
        if let Some(v) = opt_i32(ext, "use_cross_attn")? {
            params.extend.use_cross_attn = v as i8;
        }
    }

    Ok(())
}

/// Post-validation: clamp fields the accelerator would reject outright.
pub fn validate(params: &mut GenParams) {
    if params.extend.n_batch < N_BATCH_MIN || params.extend.n_batch > N_BATCH_MAX {
        tracing::warn!(
            n_batch = params.extend.n_batch,
            "batch size out of [{N_BATCH_MIN}, {N_BATCH_MAX}], clamping to {N_BATCH_MIN}"
        );
        params.extend.n_batch = N_BATCH_MIN;
    }
}

/// Full three-tier resolution: library baseline → config overlay →
/// caller overlay → validation.
pub fn resolve(
    library_defaults: GenParams,
    config_defaults: &AccelDefaults,
    caller: &Value,
) -> Result<GenParams> {
    let mut params = library_defaults;
    apply_config_defaults(&mut params, config_defaults);
    apply_caller_params(&mut params, caller)?;
    validate(&mut params);
    Ok(params)
}

/// Serialise resolved parameters back to JSON (the response shape of
/// `create_default_params`).
pub fn to_json(params: &GenParams) -> Value {
    serde_json::json!({
        "model_path": params.model_path,
        "max_context_len": params.max_context_len,
        "max_new_tokens": params.max_new_tokens,
        "top_k": params.top_k,
        "n_keep": params.n_keep,
        "top_p": params.top_p,
        "temperature": params.temperature,
        "repeat_penalty": params.repeat_penalty,
        "frequency_penalty": params.frequency_penalty,
        "presence_penalty": params.presence_penalty,
        "mirostat": params.mirostat,
        "mirostat_tau": params.mirostat_tau,
        "mirostat_eta": params.mirostat_eta,
        "skip_special_token": params.skip_special_token,
        "img_start": params.img_start,
        "img_end": params.img_end,
        "img_content": params.img_content,
        "extend_param": {
            "base_domain_id": params.extend.base_domain_id,
            "embed_flash": params.extend.embed_flash,
            "enabled_cpus_num": params.extend.enabled_cpus_num,
            "enabled_cpus_mask": params.extend.enabled_cpus_mask,
            "n_batch": params.extend.n_batch,
            "use_cross_attn": params.extend.use_cross_attn,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{Accelerator, SimAccelerator};
    use crate::config::{AccelDefaults, ExtendDefaults};
    use serde_json::json;

    fn library_defaults() -> GenParams {
        SimAccelerator::new().create_default_params()
    }

    #[test]
    fn caller_beats_config_beats_library() {
        let config = AccelDefaults {
            temperature: Some(0.3),
            top_k: Some(10),
            ..AccelDefaults::default()
        };
        let caller = json!({ "temperature": 0.95 });
        let resolved = resolve(library_defaults(), &config, &caller).unwrap();
        // caller wins
        assert_eq!(resolved.temperature, 0.95);
        // config wins over library where the caller is silent
        assert_eq!(resolved.top_k, 10);
        // library value survives where nobody spoke
        assert_eq!(resolved.max_context_len, 512);
    }

    #[test]
    fn caller_value_equal_to_library_default_is_kept() {
        // The resolution is presence-based: sending the library default
        // explicitly must not let configuration override it.
        let config = AccelDefaults {
            temperature: Some(0.3),
            ..AccelDefaults::default()
        };
        let caller = json!({ "temperature": 0.8 });
        let resolved = resolve(library_defaults(), &config, &caller).unwrap();
        assert_eq!(resolved.temperature, 0.8);
    }

    #[test]
    fn wrong_type_is_structured_error() {
        let caller = json!({ "max_context_len": "not_a_number" });
        let err = resolve(library_defaults(), &AccelDefaults::default(), &caller).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32602);
        let data = err.json_rpc_data().unwrap();
        assert_eq!(data["field"], "max_context_len");
        assert_eq!(data["expected"], "integer");
    }

    #[test]
    fn n_batch_clamped_with_warning() {
        let caller = json!({ "extend_param": { "n_batch": 200 } });
        let resolved = resolve(library_defaults(), &AccelDefaults::default(), &caller).unwrap();
        assert_eq!(resolved.extend.n_batch, 1);

        let config = AccelDefaults {
            extend: ExtendDefaults {
                n_batch: Some(8),
                ..ExtendDefaults::default()
            },
            ..AccelDefaults::default()
        };
        let resolved = resolve(library_defaults(), &config, &json!({})).unwrap();
        assert_eq!(resolved.extend.n_batch, 8);
    }

    #[test]
    fn unknown_caller_keys_are_ignored() {
        let caller = json!({ "model_path": "/m.bin", "future_knob": true });
        let resolved = resolve(library_defaults(), &AccelDefaults::default(), &caller).unwrap();
        assert_eq!(resolved.model_path.as_deref(), Some("/m.bin"));
    }

    #[test]
    fn null_params_resolve_to_overlayed_defaults() {
        let config = AccelDefaults {
            model_path: Some("/opt/models/default.bin".to_string()),
            ..AccelDefaults::default()
        };
        let resolved = resolve(library_defaults(), &config, &Value::Null).unwrap();
        assert_eq!(
            resolved.model_path.as_deref(),
            Some("/opt/models/default.bin")
        );
    }
}
