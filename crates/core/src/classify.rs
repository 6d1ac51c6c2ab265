//! Operation classification
//!
//! Every exposed method is classified once, statically: it either
//! completes instantly on the calling handler, must be serialised on the
//! single accelerator worker, or opens a streaming session. Unknown
//! methods classify as Instant so the error path stays responsive even
//! when the accelerator is saturated.

/// How a request is routed after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// No accelerator-exclusive state touched; runs on the handler.
    Instant,
    /// Serialised on the single accelerator worker; answered through the
    /// response registry.
    AcceleratorQueued,
    /// Long-running accelerator call that emits chunks until the
    /// callback reports Finish or Error.
    Streaming,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::Instant => "instant",
            OpClass::AcceleratorQueued => "accelerator_queued",
            OpClass::Streaming => "streaming",
        }
    }
}

/// Static classification for one method.
#[derive(Debug, Clone, Copy)]
pub struct ClassEntry {
    pub method: &'static str,
    pub class: OpClass,
    /// Whether the operation touches accelerator memory.
    pub needs_accel_memory: bool,
    /// Estimated duration in milliseconds; `None` for unbounded
    /// streaming work.
    pub estimated_ms: Option<u64>,
}

/// The closed method set. There is no runtime registration; the table is
/// exhaustive at build time.
pub const CLASSIFICATION: &[ClassEntry] = &[
    // Instant: meta and handle-local operations
    ClassEntry { method: "list_functions", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(10) },
    ClassEntry { method: "get_constants", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(5) },
    ClassEntry { method: "create_default_params", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(1) },
    ClassEntry { method: "destroy", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(100) },
    ClassEntry { method: "abort", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(50) },
    ClassEntry { method: "is_running", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(1) },
    ClassEntry { method: "clear_kv_cache", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(20) },
    ClassEntry { method: "get_kv_cache_size", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(5) },
    ClassEntry { method: "set_chat_template", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(10) },
    ClassEntry { method: "set_function_tools", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(15) },
    ClassEntry { method: "set_cross_attn_params", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(10) },
    ClassEntry { method: "release_prompt_cache", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(50) },
    ClassEntry { method: "queue_status", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(1) },
    ClassEntry { method: "stream_pause", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(1) },
    ClassEntry { method: "stream_resume", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(1) },
    ClassEntry { method: "stream_stats", class: OpClass::Instant, needs_accel_memory: false, estimated_ms: Some(1) },
    // Accelerator queue: exclusive-memory operations
    ClassEntry { method: "init", class: OpClass::AcceleratorQueued, needs_accel_memory: true, estimated_ms: Some(45_000) },
    ClassEntry { method: "run", class: OpClass::AcceleratorQueued, needs_accel_memory: true, estimated_ms: Some(5_000) },
    ClassEntry { method: "load_lora", class: OpClass::AcceleratorQueued, needs_accel_memory: true, estimated_ms: Some(2_000) },
    ClassEntry { method: "load_prompt_cache", class: OpClass::AcceleratorQueued, needs_accel_memory: true, estimated_ms: Some(1_000) },
    // Streaming
    ClassEntry { method: "run_async", class: OpClass::Streaming, needs_accel_memory: true, estimated_ms: None },
];

fn lookup(method: &str) -> Option<&'static ClassEntry> {
    CLASSIFICATION.iter().find(|e| e.method == method)
}

/// Classify a method. Unknown methods default to Instant processing so
/// MethodNotFound and meta paths never queue behind the accelerator.
pub fn classify(method: &str) -> OpClass {
    match lookup(method) {
        Some(entry) => {
            tracing::debug!(
                method,
                class = entry.class.as_str(),
                accel_memory = entry.needs_accel_memory,
                estimated_ms = ?entry.estimated_ms,
                "classified operation"
            );
            entry.class
        }
        None => {
            tracing::debug!(method, "unknown method, defaulting to instant");
            OpClass::Instant
        }
    }
}

/// Estimated duration for a method, in milliseconds. Unknown or
/// unbounded methods report 0.
pub fn estimated_wait_ms(method: &str) -> u64 {
    lookup(method).and_then(|e| e.estimated_ms).unwrap_or(0)
}

/// Whether the method requires accelerator memory.
pub fn needs_accel_memory(method: &str) -> bool {
    lookup(method).map(|e| e.needs_accel_memory).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_deterministic() {
        for entry in CLASSIFICATION {
            assert_eq!(classify(entry.method), classify(entry.method));
        }
    }

    #[test]
    fn every_method_maps_to_exactly_one_class() {
        for entry in CLASSIFICATION {
            let count = CLASSIFICATION
                .iter()
                .filter(|e| e.method == entry.method)
                .count();
            assert_eq!(count, 1, "duplicate table entry for {}", entry.method);
        }
    }

    #[test]
    fn unknown_methods_are_instant() {
        assert_eq!(classify("no_such_thing"), OpClass::Instant);
        assert_eq!(estimated_wait_ms("no_such_thing"), 0);
        assert!(!needs_accel_memory("no_such_thing"));
    }

    #[test]
    fn representative_entries() {
        assert_eq!(classify("init"), OpClass::AcceleratorQueued);
        assert_eq!(estimated_wait_ms("init"), 45_000);
        assert!(needs_accel_memory("init"));

        assert_eq!(classify("run_async"), OpClass::Streaming);
        assert_eq!(estimated_wait_ms("run_async"), 0);

        assert_eq!(classify("is_running"), OpClass::Instant);
        assert!(!needs_accel_memory("is_running"));
    }
}
