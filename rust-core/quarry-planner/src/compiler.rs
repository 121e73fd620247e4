// SPDX-License-Identifier: PMPL-1.0-or-later
//! Statement compiler seam.
//!
//! Parsing and planning live outside this crate. The cache hands the
//! compiler a statement and its compilation context and gets back an
//! operator tree plus the keyspace versions the compiler observed; identity
//! fields and derived data are filled in by the cache.

use crate::context::CompilationContext;
use crate::error::CompileError;
use crate::metadata::MetadataStore;
use crate::plan::{KeyspaceRef, Operator};

/// Everything the compiler needs to plan one statement.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub text: &'a str,
    pub namespace: &'a str,
    pub query_context: &'a str,
    pub context: &'a CompilationContext,
}

/// Compiler output.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    pub root: Operator,
    /// Keyspaces the plan touches, at the versions read during planning.
    pub keyspaces: Vec<KeyspaceRef>,
}

/// Parser and planner.
///
/// Compilation is synchronous and may run on any request thread.
pub trait StatementCompiler: Send + Sync {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        metadata: &dyn MetadataStore,
    ) -> Result<CompiledPlan, CompileError>;
}

impl<F> StatementCompiler for F
where
    F: Fn(&CompileRequest<'_>, &dyn MetadataStore) -> Result<CompiledPlan, CompileError> + Send + Sync,
{
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        metadata: &dyn MetadataStore,
    ) -> Result<CompiledPlan, CompileError> {
        self(request, metadata)
    }
}
