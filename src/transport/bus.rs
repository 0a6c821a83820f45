//! Typed message bus
//!
//! Handlers are registered per `MessageKind` and run in registration order.
//! Every call is isolated: an `Err` or a panic inside one handler is logged
//! with the message type and the remaining handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

use crate::types::{Inbound, MessageKind};

type Handler<C, E> = Box<dyn Fn(&mut C, &Inbound) -> Result<(), E> + Send>;

/// Outcome of delivering one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Handler registry over a shared context `C`.
pub struct MessageBus<C, E> {
    handlers: HashMap<MessageKind, Vec<(&'static str, Handler<C, E>)>>,
}

impl<C, E: std::fmt::Display> MessageBus<C, E> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Append `handler` to the list for `kind`.
    pub fn register<F>(&mut self, kind: MessageKind, name: &'static str, handler: F)
    where
        F: Fn(&mut C, &Inbound) -> Result<(), E> + Send + 'static,
    {
        self.handlers.entry(kind).or_default().push((name, Box::new(handler)));
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Run every handler registered for the message's kind.
    pub fn dispatch(&self, ctx: &mut C, inbound: &Inbound) -> DispatchReport {
        let kind = inbound.message.kind();
        let mut report = DispatchReport::default();

        let Some(handlers) = self.handlers.get(&kind) else {
            debug!(kind = %kind, sender = inbound.sender, "No handler registered");
            return report;
        };

        for (name, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(ctx, inbound))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(kind = %kind, handler = name, sender = inbound.sender, error = %e, "Message handler failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(kind = %kind, handler = name, sender = inbound.sender, panic = %detail, "Message handler panicked");
                }
            }
        }
        report
    }
}

impl<C, E: std::fmt::Display> Default for MessageBus<C, E> {
    fn default() -> Self {
        Self::new()
    }
}
