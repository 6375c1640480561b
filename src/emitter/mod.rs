//! Result emitters.
//!
//! An emitter consumes results and forwards them to an external system.
//! Delivery is best-effort and synchronous: the manager fans each result out
//! to every registered emitter in registration order.

pub mod stdout;

use crate::transaction::TransactionResult;

pub use stdout::StdoutEmitter;

/// A consumer of transaction results.
pub trait Emitter: Send + Sync {
    fn emit(&self, result: &TransactionResult);
}

/// Adapter turning a closure into an [`Emitter`].
pub struct EmitterFn<F>(pub F);

impl<F> Emitter for EmitterFn<F>
where
    F: Fn(&TransactionResult) + Send + Sync,
{
    fn emit(&self, result: &TransactionResult) {
        (self.0)(result)
    }
}
