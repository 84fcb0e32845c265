//! Handler registry: maps a command type to the handler that executes it.
//!
//! The registry is built once at startup and is read-only afterwards, so the
//! runtime shares it behind an `Arc` without locking.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::errors::RegistryError;
use crate::handler::{CommandHandler, EnvelopeHandler, TypedHandler};
use crate::types::CommandType;

/// No handler is registered for a command type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no handler registered for {0}")]
pub struct RegistryMiss(pub CommandType);

/// Static map from command type to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandType, Arc<dyn EnvelopeHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed handler under its command's type.
    pub fn register<H: CommandHandler>(self, handler: H) -> Result<Self, RegistryError> {
        let typed = TypedHandler::new(handler).map_err(|_| {
            RegistryError::InvalidCommandType(
                <H::Command as crate::envelope::Command>::COMMAND_TYPE.to_string(),
            )
        })?;
        self.register_erased(Arc::new(typed))
    }

    /// Registers an already type-erased handler.
    pub fn register_erased(
        mut self,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Self, RegistryError> {
        let command_type = handler.command_type().clone();
        if self.handlers.contains_key(&command_type) {
            return Err(RegistryError::DuplicateHandler(command_type));
        }
        self.handlers.insert(command_type, handler);
        Ok(self)
    }

    /// Looks up the handler for `command_type`.
    pub fn resolve(&self, command_type: &CommandType) -> Result<Arc<dyn EnvelopeHandler>, RegistryMiss> {
        self.handlers
            .get(command_type)
            .cloned()
            .ok_or_else(|| RegistryMiss(command_type.clone()))
    }

    /// Registered command types, sorted.
    pub fn command_types(&self) -> Vec<CommandType> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("command_types", &self.command_types())
            .finish()
    }
}
