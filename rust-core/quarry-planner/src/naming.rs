// SPDX-License-Identifier: PMPL-1.0-or-later
//! Prepared statement naming.
//!
//! Derived names have the form
//!
//! ```text
//! <context fingerprint>:<UUIDv5 of statement text>[(<query context>)]
//! ```
//!
//! so that the same text compiled under the same options always lands on the
//! same key, and different compilation options never collide. Names handed to
//! clients may carry a `[node]` prefix naming the node that prepared them;
//! the prefix is stripped before lookup and used as the default peer for a
//! remote fetch.

use uuid::Uuid;

use crate::context::CompilationContext;

/// Namespace assumed when a request names none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Derive the cache key for `text` compiled under `context` in `namespace`.
pub fn plan_key(
    text: &str,
    context: &CompilationContext,
    namespace: &str,
    query_context: &str,
) -> String {
    let statement = Uuid::new_v5(&Uuid::NAMESPACE_OID, text.as_bytes());
    let base = format!("{}:{}", context.fingerprint(namespace), statement);
    with_query_context(&base, query_context)
}

/// Append the query context suffix when it is not the default (empty) one.
pub fn with_query_context(name: &str, query_context: &str) -> String {
    if query_context.is_empty() {
        name.to_string()
    } else {
        format!("{name}({query_context})")
    }
}

/// The query context a derived key was built with; empty for the default
/// context. Only meaningful for keys from [`plan_key`]: a user-chosen name
/// ending in `)` reads as scoped.
pub fn key_query_context(key: &str) -> &str {
    match (key.strip_suffix(')'), key.rfind('(')) {
        (Some(trimmed), Some(open)) => &trimmed[open + 1..],
        _ => "",
    }
}

/// Split an optional `[node]` origin hint off a client-supplied name.
pub fn strip_node_hint(name: &str) -> (Option<&str>, &str) {
    if let Some(rest) = name.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let node = &rest[..end];
            let base = &rest[end + 1..];
            if !node.is_empty() && !base.is_empty() {
                return (Some(node), base);
            }
        }
    }
    (None, name)
}

/// Prefix `name` with the node that prepared it.
pub fn with_node_hint(node: &str, name: &str) -> String {
    format!("[{node}]{name}")
}

// ---------------------------------------------------------------------------
// Predefined statements
// ---------------------------------------------------------------------------

/// A builtin statement compiled on first use under a fixed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predefined {
    pub name: &'static str,
    pub text: &'static str,
}

/// Key-value access paths every node can serve without a client prepare.
pub const PREDEFINED: &[Predefined] = &[
    Predefined {
        name: "__get",
        text: "SELECT META(d).id, META(d).cas, d AS doc FROM $keyspace AS d USE KEYS $keys",
    },
    Predefined {
        name: "__insert",
        text: "INSERT INTO $keyspace AS d VALUES ($key, $doc) RETURNING META(d).cas",
    },
    Predefined {
        name: "__upsert",
        text: "UPSERT INTO $keyspace AS d VALUES ($key, $doc) RETURNING META(d).cas",
    },
    Predefined {
        name: "__update",
        text: "UPDATE $keyspace AS d USE KEYS $key SET d = $doc RETURNING META(d).cas",
    },
    Predefined {
        name: "__delete",
        text: "DELETE FROM $keyspace AS d USE KEYS $key RETURNING META(d).id",
    },
];

/// Look up a predefined statement by its literal name.
pub fn predefined(name: &str) -> Option<&'static Predefined> {
    PREDEFINED.iter().find(|p| p.name == name)
}
