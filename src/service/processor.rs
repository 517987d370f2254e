//! Pluggable request processors.

use std::sync::Arc;

use super::connection::Connection;
use super::context::RequestContext;

/// A request handler plugged into a [`Service`](super::Service).
///
/// Processors are consulted in registration order. The first one returning
/// `true` claims the request and routing stops there; a processor returning
/// `false` must leave the response untouched for the next one.
///
/// Processors may run on a blocking worker thread (see
/// [`ServiceConfig::process_by_threads`](super::ServiceConfig::process_by_threads)),
/// so they are free to do synchronous work.
///
/// A processor can also take a request over as soon as its header is parsed,
/// before any body byte is read, by overriding
/// [`preprocess`](Self::preprocess). This is how tunnels are built: answer
/// with [`Connection::send_connect_established`], then drive the stream
/// through [`Connection::take_input`] and [`Connection::start`].
///
/// Any `Fn(&mut RequestContext) -> bool` closure is a processor:
///
/// ```
/// use slib_http::service::{Processor, RequestContext};
///
/// let hello = |ctx: &mut RequestContext| {
///     if ctx.path() != "/hello" {
///         return false;
///     }
///     ctx.write("Hello!");
///     true
/// };
/// fn assert_processor(_: &impl Processor) {}
/// assert_processor(&hello);
/// ```
pub trait Processor: Send + Sync {
    /// Handles the request. Returns `true` when the request is claimed.
    fn handle(&self, context: &mut RequestContext) -> bool;

    /// Inspects a request whose header was just parsed, on the connection's
    /// read task. Returning `true` takes the request and the connection over:
    /// the body is not read and no response is written for it.
    fn preprocess(&self, _context: &mut RequestContext, _connection: &Arc<Connection>) -> bool {
        false
    }
}

impl<F> Processor for F
where
    F: Fn(&mut RequestContext) -> bool + Send + Sync,
{
    fn handle(&self, context: &mut RequestContext) -> bool {
        self(context)
    }
}
