//! Handler lookup for application message types.

use std::collections::HashMap;

use super::types::{Frame, MessageType};
use crate::error::{Error, Result};

/// Callback invoked for every frame of a registered type.
pub type Handler = Box<dyn FnMut(&Frame) + Send>;

/// Maps application type ids to handlers.
///
/// Reserved ids are dispatched by the mesh itself and cannot be claimed.
/// Frames of unregistered application types fall through to
/// [`MeshDelegate::on_receive`](crate::MeshDelegate::on_receive).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Handler>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `msg_type`.
    pub fn register<F>(&mut self, msg_type: u16, handler: F) -> Result<()>
    where
        F: FnMut(&Frame) + Send + 'static,
    {
        if MessageType::is_reserved(msg_type) {
            return Err(Error::ReservedType(msg_type));
        }
        if self.handlers.contains_key(&msg_type) {
            return Err(Error::HandlerExists(msg_type));
        }
        self.handlers.insert(msg_type, Box::new(handler));
        Ok(())
    }

    /// Remove the handler for `msg_type`, returning whether one existed.
    pub fn unregister(&mut self, msg_type: u16) -> bool {
        self.handlers.remove(&msg_type).is_some()
    }

    /// Whether `msg_type` has a handler.
    pub fn contains(&self, msg_type: u16) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Run the handler for `frame`. Returns `false` when none is registered.
    pub fn dispatch(&mut self, frame: &Frame) -> bool {
        match self.handlers.get_mut(&frame.msg_type) {
            Some(handler) => {
                handler(frame);
                true
            }
            None => false,
        }
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
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("types", &types)
            .finish()
    }
}
