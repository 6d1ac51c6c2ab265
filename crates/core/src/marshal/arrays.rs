//! JSON array conversion
//!
//! Packed float/int arrays and the 4-D cross-attention tensor arrive as
//! JSON nested arrays. Conversion verifies element types and dimension
//! consistency across rows; any mismatch is a structured parameter
//! error naming the field and the expected shape rather than a silent
//! truncation.

use crate::accel::CrossAttnParams;
use crate::error::{Error, Result};
use serde_json::Value;

/// Convert a JSON array of numbers to `Vec<f32>`. Integers are widened.
pub fn to_f32_array(value: &Value, field: &str) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::invalid_param(field, "array of numbers"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let n = item
            .as_f64()
            .ok_or_else(|| Error::invalid_param(field, "number"))?;
        out.push(n as f32);
    }
    Ok(out)
}

/// Convert a JSON array of integers to `Vec<i32>`.
pub fn to_i32_array(value: &Value, field: &str) -> Result<Vec<i32>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::invalid_param(field, "array of integers"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let n = item
            .as_i64()
            .ok_or_else(|| Error::invalid_param(field, "integer"))?;
        if n < i32::MIN as i64 || n > i32::MAX as i64 {
            return Err(Error::invalid_param(field, "32-bit integer"));
        }
        out.push(n as i32);
    }
    Ok(out)
}

/// Flatten a 4-D JSON tensor into a row-major `Vec<f32>`, verifying
/// that every row at every depth has the dimensions declared by the
/// first row. Returns the flat data plus `[d1, d2, d3, d4]`.
pub fn to_f32_tensor4(value: &Value, field: &str) -> Result<(Vec<f32>, [usize; 4])> {
    let d1_rows = value
        .as_array()
        .ok_or_else(|| Error::invalid_param(field, "4-D array"))?;
    if d1_rows.is_empty() {
        return Err(Error::invalid_param(field, "non-empty 4-D array"));
    }

    let mut dims: Option<[usize; 4]> = None;
    let mut flat = Vec::new();

    for (i1, row1) in d1_rows.iter().enumerate() {
        let d2_rows = row1.as_array().ok_or_else(|| {
            dimension_error(field, &format!("[{i1}]"), "array")
        })?;
        for (i2, row2) in d2_rows.iter().enumerate() {
            let d3_rows = row2.as_array().ok_or_else(|| {
                dimension_error(field, &format!("[{i1}][{i2}]"), "array")
            })?;
            for (i3, row3) in d3_rows.iter().enumerate() {
                let d4_items = row3.as_array().ok_or_else(|| {
                    dimension_error(field, &format!("[{i1}][{i2}][{i3}]"), "array")
                })?;
                match dims {
                    None => {
                        dims = Some([
                            d1_rows.len(),
                            d2_rows.len(),
                            d3_rows.len(),
                            d4_items.len(),
                        ]);
                    }
                    Some(expected) => {
                        if d2_rows.len() != expected[1]
                            || d3_rows.len() != expected[2]
                            || d4_items.len() != expected[3]
                        {
                            return Err(Error::InvalidParams {
                                message: "Invalid parameters".to_string(),
                                data: Some(serde_json::json!({
                                    "field": field,
                                    "expected": format!(
                                        "consistent dimensions [{}][{}][{}][{}]",
                                        expected[0], expected[1], expected[2], expected[3]
                                    ),
                                    "found": format!(
                                        "row [{i1}][{i2}][{i3}] with {} elements",
                                        d4_items.len()
                                    ),
                                })),
                            });
                        }
                    }
                }
                for item in d4_items {
                    let n = item.as_f64().ok_or_else(|| {
                        dimension_error(field, &format!("[{i1}][{i2}][{i3}]"), "number")
                    })?;
                    flat.push(n as f32);
                }
            }
        }
    }

    let dims = dims.ok_or_else(|| Error::invalid_param(field, "non-empty 4-D array"))?;
    Ok((flat, dims))
}

fn dimension_error(field: &str, path: &str, expected: &str) -> Error {
    Error::InvalidParams {
        message: "Invalid parameters".to_string(),
        data: Some(serde_json::json!({
            "field": format!("{field}{path}"),
            "expected": expected,
        })),
    }
}

/// Parse the cross-attention parameter object: 4-D float tensor, 1-D
/// float mask, 1-D int positions.
pub fn parse_cross_attn(params: &Value) -> Result<CrossAttnParams> {
    let obj = params
        .as_object()
        .ok_or_else(|| Error::invalid_param("cross_attn_params", "object"))?;

    let k_cache_value = obj
        .get("encoder_k_cache")
        .ok_or_else(|| Error::invalid_param("encoder_k_cache", "4-D array"))?;
    let (encoder_k_cache, dims) = to_f32_tensor4(k_cache_value, "encoder_k_cache")?;

    let encoder_mask = match obj.get("encoder_mask") {
        Some(v) => to_f32_array(v, "encoder_mask")?,
        None => Vec::new(),
    };
    let encoder_pos = match obj.get("encoder_pos") {
        Some(v) => to_i32_array(v, "encoder_pos")?,
        None => Vec::new(),
    };
    let num_tokens = match obj.get("num_tokens") {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| Error::invalid_param("num_tokens", "unsigned integer"))?
            as usize,
        None => dims[1],
    };

    Ok(CrossAttnParams {
        encoder_k_cache,
        dims,
        encoder_mask,
        encoder_pos,
        num_tokens,
    })
}
