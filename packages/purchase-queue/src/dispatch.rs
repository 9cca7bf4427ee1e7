//! Command dispatcher.
//!
//! The `Dispatcher` is responsible for:
//! 1. Running each command off the serialized context
//! 2. Catching panics so a broken collaborator never strands a waiter
//! 3. Enqueuing the command's continuation back onto the mailbox
//!
//! The dispatcher holds only a weak reference to the mailbox. The coordinator
//! loop ends once every handle is gone, even with commands still running.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::effect::{EffectContext, StoreCommand};
use crate::reconciler::CoordinatorEvent;

pub struct Dispatcher {
    ctx: EffectContext,
    mailbox: WeakUnboundedSender<CoordinatorEvent>,
    inflight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(ctx: EffectContext, mailbox: &UnboundedSender<CoordinatorEvent>) -> Self {
        Self {
            ctx,
            mailbox: mailbox.downgrade(),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn a command. Its continuation, if any, is enqueued when it finishes.
    pub fn dispatch(&self, command: StoreCommand) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let mailbox = self.mailbox.clone();
        let inflight = self.inflight.clone();
        inflight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let name = command.name();
            let product_id = command.product_id().to_string();
            debug!(command = name, product_id = %product_id, "dispatching command");

            // Computed up front: the command is consumed by execution.
            let fallback = command.clone();

            // AssertUnwindSafe is required because the context is not UnwindSafe
            let result = AssertUnwindSafe(command.execute(&ctx)).catch_unwind().await;

            let continuation = match result {
                Ok(continuation) => continuation,
                Err(panic_info) => {
                    let panic_msg = extract_panic_message(&panic_info);
                    error!(command = name, product_id = %product_id, panic = %panic_msg, "command panicked");
                    fallback.panic_continuation(&panic_msg)
                }
            };

            if let Some(event) = continuation {
                enqueue(&mailbox, event);
            }
            inflight.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Commands spawned but not yet finished.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }
}

fn enqueue(mailbox: &WeakUnboundedSender<CoordinatorEvent>, event: CoordinatorEvent) {
    let name = event.name();
    let sent = match mailbox.upgrade() {
        Some(sender) => sender.send(event).is_ok(),
        None => false,
    };
    if !sent {
        debug!(continuation = name, "coordinator gone, dropping continuation");
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("inflight", &self.inflight())
            .finish_non_exhaustive()
    }
}
