// SPDX-License-Identifier: PMPL-1.0-or-later
//! Encoded plan format.
//!
//! Plans travel between nodes and into the durable store as a JSON envelope:
//!
//! ```text
//! {"version":1,"name":..,"query_context":..,"namespace":..,"text":..,
//!  "context":{..},"plan":"<base64(lz4(json(Plan)))>"}
//! ```
//!
//! The identity fields and the statement text sit outside the compressed
//! body so a receiver can still recompile the statement when the body is
//! corrupt or written by a newer engine.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::context::CompilationContext;
use crate::error::PreparedError;
use crate::plan::Plan;

/// Newest envelope layout this engine reads and the one it writes.
pub const ENCODING_VERSION: u32 = 1;

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    name: &'a str,
    query_context: &'a str,
    namespace: &'a str,
    text: &'a str,
    context: &'a CompilationContext,
    plan: String,
}

/// Envelope fields readable without touching the compressed body.
///
/// Decoding is lenient: unknown fields are ignored and everything except
/// `name` and `text` defaults when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(default)]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub query_context: String,
    #[serde(default)]
    pub namespace: String,
    pub text: String,
    #[serde(default)]
    pub context: Option<CompilationContext>,
    #[serde(default)]
    plan: String,
}

/// Encode `plan` into its transferable form.
pub fn encode(plan: &Plan) -> Result<String, PreparedError> {
    let body = serde_json::to_vec(plan).map_err(|e| PreparedError::Decode(format!("plan body: {e}")))?;
    let compressed = lz4_flex::compress_prepend_size(&body);

    let envelope = Envelope {
        version: ENCODING_VERSION,
        name: &plan.name,
        query_context: &plan.query_context,
        namespace: &plan.namespace,
        text: &plan.text,
        context: &plan.context,
        plan: STANDARD.encode(compressed),
    };
    serde_json::to_string(&envelope).map_err(|e| PreparedError::Decode(format!("envelope: {e}")))
}

/// Read the envelope header only.
pub fn decode_header(encoded: &str) -> Result<EnvelopeHeader, PreparedError> {
    serde_json::from_str(encoded).map_err(|e| PreparedError::Decode(format!("envelope: {e}")))
}

/// Fully decode an encoded plan.
pub fn decode(encoded: &str) -> Result<Plan, PreparedError> {
    let header = decode_header(encoded)?;
    if header.version > ENCODING_VERSION {
        return Err(PreparedError::VersionMismatch {
            found: header.version,
            supported: ENCODING_VERSION,
        });
    }

    let compressed = STANDARD
        .decode(header.plan.as_bytes())
        .map_err(|e| PreparedError::Decode(format!("plan base64: {e}")))?;
    let body = lz4_flex::decompress_size_prepended(&compressed)
        .map_err(|e| PreparedError::Decode(format!("plan lz4: {e}")))?;
    let plan: Plan =
        serde_json::from_slice(&body).map_err(|e| PreparedError::Decode(format!("plan body: {e}")))?;

    if plan.name != header.name || plan.query_context != header.query_context {
        return Err(PreparedError::Decode(format!(
            "envelope names {} but body holds {}",
            header.name, plan.name
        )));
    }
    Ok(plan)
}

/// Decode and check that the plan belongs under `key`.
pub fn decode_for(key: &str, encoded: &str) -> Result<Plan, PreparedError> {
    let plan = decode(encoded)?;
    check_identity(key, &plan.name, &plan.query_context)?;
    Ok(plan)
}

/// The embedded name must equal the key, and a non-default query context
/// must be the key's `(<query context>)` suffix. User-chosen names may
/// contain parentheses of their own.
pub fn check_identity(key: &str, name: &str, query_context: &str) -> Result<(), PreparedError> {
    let scoped = query_context.is_empty() || key.ends_with(&format!("({query_context})"));
    if name != key || !scoped {
        return Err(PreparedError::EncodingMismatch {
            expected: key.to_string(),
            found: name.to_string(),
        });
    }
    Ok(())
}
