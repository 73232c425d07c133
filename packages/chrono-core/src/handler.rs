//! Task handler seam.
//!
//! A handler is a user-supplied async function receiving a fully hydrated
//! [`Task`] and returning a result. Returning `Ok` is success; an error (or
//! running past the processor's handler timeout) is a failure mapped by the
//! retry state machine. Handlers must be idempotent: delivery is
//! at-least-once.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::task::Task;

/// Future returned by a boxed task handler.
pub type TaskHandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Type-erased task handler stored by a processor.
///
/// Registration boxes a typed closure into this shape; typed payload access
/// happens inside the closure via [`Task::data_as`].
pub type BoxedTaskHandler = Box<dyn Fn(Task) -> TaskHandlerFuture + Send + Sync>;

/// Box a typed handler closure for storage in a processor.
pub(crate) fn box_task_handler<F, Fut>(handler: F) -> BoxedTaskHandler
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |task| Box::pin(handler(task)))
}
