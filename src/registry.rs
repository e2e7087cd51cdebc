use ahash::AHashMap as HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::EntityState;
use crate::context::Payload;
use crate::errors::{Result, TxnError};
use crate::runtime::TxnExecution;

/// Boxed future returned by an entity function.
pub type CallFuture<'a> = Pin<Box<dyn Future<Output = Result<Payload>> + Send + 'a>>;

/// A registered entity function: async business logic receiving the
/// transaction's execution handle and an opaque input payload.
pub type EntityFunction<S> =
    Arc<dyn for<'a> Fn(&'a mut TxnExecution<S>, Payload) -> CallFuture<'a> + Send + Sync>;

/// Compile-time replacement for name-based reflection: one map from function
/// name to a typed closure, resolved once per entity type at startup.
pub struct FunctionRegistry<S: EntityState> {
    functions: HashMap<String, EntityFunction<S>>,
}

impl<S: EntityState> Default for FunctionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: EntityState> FunctionRegistry<S> {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registers `function` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: for<'a> Fn(&'a mut TxnExecution<S>, Payload) -> CallFuture<'a> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Looks a function up by name. An unknown name is an application error:
    /// the transaction fails, the engine does not.
    pub fn resolve(&self, name: &str) -> Result<EntityFunction<S>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| TxnError::Application(format!("unknown function '{name}'")))
    }
}
