//! Command handlers, one module per namespace.
//!
//! Every handler is a plain function of an [Invocation].
//! [built_in_commands] maps qualified command names, as produced by the tokenizer,
//!     to their handlers.

use crate::context::Invocation;
use std::collections::HashMap;

pub mod route;
pub mod structure;
pub mod track;
pub mod train;

pub type Handler = fn(&mut Invocation<'_, '_>);

/// A command handler plus whether it runs when only a preview is compiled.
#[derive(Clone, Copy)]
pub struct BuiltIn {
    handler: Handler,
    preview: bool,
}

impl BuiltIn {
    pub fn new(handler: Handler) -> BuiltIn {
        BuiltIn {
            handler,
            preview: false,
        }
    }

    /// Marks the command as one that also runs in preview mode.
    pub fn in_preview(mut self) -> BuiltIn {
        self.preview = true;
        self
    }

    pub fn runs_in_preview(&self) -> bool {
        self.preview
    }

    pub fn call(&self, invocation: &mut Invocation<'_, '_>) {
        (self.handler)(invocation)
    }
}

pub fn built_in_commands() -> HashMap<&'static str, BuiltIn> {
    let mut commands = HashMap::new();
    commands.extend(route::commands());
    commands.extend(train::commands());
    commands.extend(structure::commands());
    commands.extend(track::commands());
    commands
}
