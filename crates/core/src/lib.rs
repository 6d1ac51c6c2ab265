//! inferd core: the request-lifecycle engine between transport ingress
//! and the accelerator FFI.
//!
//! # Architecture
//!
//! - **protocol**: JSON-RPC 2.0 envelope parsing and serialisation
//! - **classify**: static operation classification (instant / queued / streaming)
//! - **scheduler**: bounded queue + the single accelerator worker thread
//! - **stream**: streaming session slots, ring buffers, chunk delivery
//! - **registry**: async response correlation with TTL expiry
//! - **marshal**: JSON ↔ accelerator parameter conversion
//! - **accel**: the accelerator trait seam (simulated and vendor backends)
//! - **dispatch**: the engine façade transports call into

pub mod accel;
pub mod classify;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod marshal;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod stream;

pub use config::Config;
pub use conn::{ConnectionCtx, ConnectionToken, TransportKind};
pub use dispatch::Engine;
pub use error::{Error, Result};
pub use protocol::RequestId;
