//! One accepted byte stream and its read → parse → dispatch → write cycle.
//!
//! Each connection runs two tasks on the service's scheduler:
//!
//! - a **read task** owning the read half of the stream. It issues exactly one
//!   read at a time into a fixed buffer, feeds the bytes to the current
//!   [`RequestContext`], and dispatches complete requests. Reading resumes
//!   right after dispatch, without waiting for the response.
//! - a **write task** owning the write half, draining the ordered outbound
//!   queue (see [`outbound`](super::outbound)).
//!
//! When the peer finishes sending, the read task stops and the queue is
//! closed; the write task drains every response already queued, then closes
//! the connection.
//!
//! Closing is idempotent: it deregisters the connection from its service,
//! drops the outbound queue and aborts both tasks, which releases the stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

use super::ServiceShared;
use super::context::{
    AfterWrite, BAD_REQUEST, CONNECTION_ESTABLISHED, Feed, INTERNAL_SERVER_ERROR, RequestContext,
    ResponsePacket, TUNNELING_NOT_SUPPORTED,
};
use super::outbound::{self, Outbound, OutboundSender};
use super::registry::ConnectionId;
use super::scheduler::SchedulerHandle;
use crate::http::Method;

/// Size of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 0x10000;

pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    service: Weak<ServiceShared>,
    state: Mutex<ConnectionState>,
    resume: Notify,
}

#[derive(Default)]
struct ConnectionState {
    closed: bool,
    reading: bool,
    /// Set by [`Connection::send_response`]; no new read is issued while set.
    holding: bool,
    outbound: Option<OutboundSender>,
    /// Set by [`Connection::take_input`]; reads bypass request parsing.
    raw_input: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<AbortHandle>,
}

impl Connection {
    fn new(
        id: ConnectionId,
        service: Weak<ServiceShared>,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            id,
            remote_addr,
            local_addr,
            service,
            state: Mutex::new(ConnectionState {
                outbound: Some(outbound),
                ..ConnectionState::default()
            }),
            resume: Notify::new(),
        }
    }

    /// Wraps `stream`, registers the connection with `service` and starts its
    /// read and write tasks.
    pub(crate) fn spawn<S>(
        service: &Arc<ServiceShared>,
        scheduler: &SchedulerHandle,
        stream: S,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = service.registry().next_id();
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, queue) = outbound::channel();
        let connection = Arc::new(Self::new(
            id,
            Arc::downgrade(service),
            remote_addr,
            local_addr,
            outbound,
        ));
        service.registry().insert(Arc::clone(&connection));

        let read_task = scheduler.spawn(Arc::clone(&connection).run_reader(reader));
        let write_task = scheduler.spawn(outbound::run_writer(
            Arc::downgrade(&connection),
            writer,
            queue,
        ));
        connection.attach_tasks([read_task.abort_handle(), write_task.abort_handle()]);
        connection
    }

    /// Registry id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address, when the provider knows it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Local address the peer connected to, when the provider knows it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// `true` while a read is outstanding on the stream.
    pub fn is_reading(&self) -> bool {
        self.lock().reading
    }

    /// Closes the connection. Calling it again is a no-op.
    pub fn close(&self) {
        let tasks = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.holding = false;
            state.outbound = None;
            state.raw_input = None;
            std::mem::take(&mut state.tasks)
        };
        self.resume.notify_one();
        if let Some(service) = self.service.upgrade() {
            service.close_connection(self.id);
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Resumes the read cycle after [`send_response`](Self::send_response).
    ///
    /// Once the input was taken with [`take_input`](Self::take_input), each
    /// call allows exactly one more read.
    pub fn start(&self) {
        self.lock().holding = false;
        self.resume.notify_one();
    }

    /// Queues `data` and pauses the read cycle until [`start`](Self::start)
    /// is called, for callers that take over the next read themselves.
    pub fn send_response(&self, data: impl Into<Bytes>) {
        self.lock().holding = true;
        self.queue(data.into(), AfterWrite::KeepOpen);
    }

    /// Queues `data` and keeps reading requests.
    pub fn send_response_and_restart(&self, data: impl Into<Bytes>) {
        self.queue(data.into(), AfterWrite::KeepOpen);
        self.start();
    }

    /// Queues `data` and closes the connection once it is written.
    pub fn send_response_and_close(&self, data: impl Into<Bytes>) {
        self.queue(data.into(), AfterWrite::Close);
    }

    /// Takes over the connection's input, typically from
    /// [`Processor::preprocess`](super::Processor::preprocess) for a tunnel.
    ///
    /// From now on nothing is parsed: the bytes left over from the request
    /// header and every later read are sent to the returned channel, and the
    /// read cycle pauses after each read until [`start`](Self::start) is
    /// called. The channel ends when the peer stops sending or the connection
    /// closes.
    pub fn take_input(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (input, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            state.raw_input = Some(input);
        }
        receiver
    }

    /// Queues the canned `400 Bad Request` and keeps reading.
    pub fn send_bad_request(&self) {
        self.send_response_and_restart(Bytes::from_static(BAD_REQUEST));
    }

    /// Queues the canned `500 Internal Server Error` and keeps reading.
    pub fn send_server_error(&self) {
        self.send_response_and_restart(Bytes::from_static(INTERNAL_SERVER_ERROR));
    }

    /// Confirms a tunnel; the read cycle stays paused for the tunnel owner.
    pub fn send_connect_established(&self) {
        self.send_response(Bytes::from_static(CONNECTION_ESTABLISHED));
    }

    /// Refuses a tunnel and closes once the answer is written.
    pub fn send_connect_failed(&self) {
        self.send_response_and_close(Bytes::from_static(TUNNELING_NOT_SUPPORTED));
    }

    fn queue(&self, data: Bytes, after: AfterWrite) {
        if data.is_empty() {
            self.close();
            return;
        }
        let packet = ResponsePacket {
            header: data,
            body: Vec::new(),
            after,
        };
        if !self.submit(Outbound::Ready(packet)) {
            self.close();
        }
    }

    fn submit(&self, item: Outbound) -> bool {
        let state = self.lock();
        match &state.outbound {
            Some(outbound) if !state.closed => outbound.send(item).is_ok(),
            _ => false,
        }
    }

    fn attach_tasks(&self, tasks: impl IntoIterator<Item = AbortHandle>) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            tasks.into_iter().for_each(|task| task.abort());
            return;
        }
        state.tasks.extend(tasks);
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Read cycle ────────────────────────────────────────────────────────────

    async fn run_reader<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut current: Option<RequestContext> = None;
        let idle_timeout = self
            .service
            .upgrade()
            .and_then(|service| service.config().idle_timeout());

        loop {
            self.wait_until_resumed().await;
            if !self.begin_read() {
                return;
            }
            let read = match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                    .await
                    .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))),
                None => reader.read(&mut buf).await,
            };
            self.lock().reading = false;

            match read {
                Ok(0) => {
                    debug!(connection = %self.id, "peer finished sending");
                    self.finish_input();
                    return;
                }
                Ok(n) => {
                    if !self.forward_raw(&buf[..n]) {
                        self.process_input(&mut current, &buf[..n]);
                    }
                }
                Err(e) => {
                    debug!(connection = %self.id, error = %e, "read failed");
                    self.close();
                    return;
                }
            }
        }
    }

    async fn wait_until_resumed(&self) {
        loop {
            let resumed = self.resume.notified();
            if !self.lock().holding {
                return;
            }
            resumed.await;
        }
    }

    /// Stops accepting responses. The write task drains what is queued and
    /// then closes the connection.
    fn finish_input(&self) {
        let mut state = self.lock();
        state.outbound = None;
        state.raw_input = None;
    }

    /// Hands `data` to the owner of the input, if it was taken. Returns
    /// `false` when the connection still parses requests.
    fn forward_raw(&self, data: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(input) = &state.raw_input else {
            return false;
        };
        if !data.is_empty() && input.send(Bytes::copy_from_slice(data)).is_err() {
            drop(state);
            debug!(connection = %self.id, "input owner went away");
            self.close();
            return true;
        }
        state.holding = true;
        true
    }

    fn begin_read(&self) -> bool {
        let mut state = self.lock();
        if state.closed || state.reading {
            return false;
        }
        state.reading = true;
        true
    }

    fn process_input(self: &Arc<Self>, current: &mut Option<RequestContext>, mut data: &[u8]) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let config = service.config();

        loop {
            let context = current.get_or_insert_with(|| {
                let mut context = RequestContext::new(self.id, self.remote_addr, self.local_addr);
                context.set_processing_by_thread(config.process_by_threads);
                context
            });
            match context.feed(data, &config) {
                Ok(Feed::NeedMore) => return,
                Ok(Feed::HeaderParsed { consumed }) => {
                    data = &data[consumed..];
                    if service.preprocess_request(context, self) {
                        *current = None;
                        self.forward_raw(data);
                        return;
                    }
                }
                Ok(Feed::Ready { consumed }) => {
                    data = &data[consumed..];
                    if let Some(context) = current.take() {
                        self.dispatch(&service, context);
                    }
                    if data.is_empty() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(connection = %self.id, error = %e, "rejecting request");
                    *current = None;
                    self.send_response_and_restart(Bytes::from_static(e.canned_response()));
                    return;
                }
            }
        }
    }

    /// Hands a complete request to processing, inline or on a worker.
    ///
    /// The response slot is queued before processing starts so responses are
    /// written in request order.
    fn dispatch(self: &Arc<Self>, service: &ServiceShared, mut context: RequestContext) {
        context.mark_dispatched();
        let (slot, pending) = oneshot::channel();
        if !self.submit(Outbound::Pending(pending)) {
            self.close();
            return;
        }

        if !context.is_processing_by_thread() {
            let _ = slot.send(self.process_context(context));
            return;
        }
        let Some(scheduler) = service.scheduler() else {
            let _ = slot.send(ResponsePacket::canned(
                INTERNAL_SERVER_ERROR,
                AfterWrite::KeepOpen,
            ));
            return;
        };
        let connection = Arc::downgrade(self);
        scheduler.spawn_processing(move || {
            if let Some(connection) = connection.upgrade() {
                let _ = slot.send(connection.process_context(context));
            }
        });
    }

    fn process_context(&self, mut context: RequestContext) -> ResponsePacket {
        if *context.method() == Method::Connect {
            return ResponsePacket::canned(TUNNELING_NOT_SUPPORTED, AfterWrite::Close);
        }
        let Some(service) = self.service.upgrade() else {
            return ResponsePacket::canned(INTERNAL_SERVER_ERROR, AfterWrite::Close);
        };
        service.process_request(&mut context);
        context.into_response_packet()
    }

    /// A connection with no service and no tasks, for exercising the send paths.
    #[cfg(test)]
    pub(crate) fn detached(id: ConnectionId) -> (Arc<Self>, outbound::OutboundReceiver) {
        let (outbound, queue) = outbound::channel();
        let connection = Self::new(id, Weak::new(), None, None, outbound);
        (Arc::new(connection), queue)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_ready(queue: &mut outbound::OutboundReceiver) -> ResponsePacket {
        match queue.try_recv() {
            Ok(Outbound::Ready(packet)) => packet,
            other => panic!("expected a ready packet, got {other:?}"),
        }
    }

    #[test]
    fn error_responses_restart_reading() {
        let (connection, mut queue) = Connection::detached(ConnectionId::new(1));
        connection.send_bad_request();
        let packet = expect_ready(&mut queue);
        assert_eq!(&packet.header[..], BAD_REQUEST);
        assert_eq!(packet.after, AfterWrite::KeepOpen);
        assert!(!connection.lock().holding);

        connection.send_server_error();
        assert_eq!(&expect_ready(&mut queue).header[..], INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn send_response_holds_the_read_cycle() {
        let (connection, mut queue) = Connection::detached(ConnectionId::new(1));
        connection.send_connect_established();
        assert_eq!(&expect_ready(&mut queue).header[..], CONNECTION_ESTABLISHED);
        assert!(connection.lock().holding);
        connection.start();
        assert!(!connection.lock().holding);
    }

    #[test]
    fn connect_failure_closes_after_write() {
        let (connection, mut queue) = Connection::detached(ConnectionId::new(1));
        connection.send_connect_failed();
        let packet = expect_ready(&mut queue);
        assert_eq!(&packet.header[..], TUNNELING_NOT_SUPPORTED);
        assert_eq!(packet.after, AfterWrite::Close);
        assert!(!connection.is_closed());
    }

    #[test]
    fn close_is_idempotent_and_stops_io() {
        let (connection, mut queue) = Connection::detached(ConnectionId::new(1));
        connection.close();
        connection.close();
        assert!(connection.is_closed());
        assert!(!connection.begin_read());

        connection.send_bad_request();
        assert!(queue.try_recv().is_err());
    }

    #[test]
    fn empty_response_closes() {
        let (connection, _queue) = Connection::detached(ConnectionId::new(1));
        connection.send_response_and_restart(Bytes::new());
        assert!(connection.is_closed());
    }

    #[test]
    fn taken_input_gets_raw_reads_one_at_a_time() {
        let (connection, _queue) = Connection::detached(ConnectionId::new(1));
        assert!(!connection.forward_raw(b"GET"));

        let mut input = connection.take_input();
        assert!(connection.forward_raw(b"abc"));
        assert!(connection.lock().holding);
        assert_eq!(input.try_recv().unwrap(), Bytes::from_static(b"abc"));

        connection.start();
        assert!(connection.forward_raw(&[]));
        assert!(connection.lock().holding);
        assert!(input.try_recv().is_err());
    }

    #[test]
    fn end_of_input_closes_the_queue_but_not_the_connection() {
        let (connection, mut queue) = Connection::detached(ConnectionId::new(1));
        let mut input = connection.take_input();
        connection.send_response_and_restart(Bytes::from_static(b"queued"));
        connection.finish_input();

        assert!(!connection.is_closed());
        assert_eq!(&expect_ready(&mut queue).header[..], b"queued");
        assert!(matches!(
            queue.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            input.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn only_one_read_at_a_time() {
        let (connection, _queue) = Connection::detached(ConnectionId::new(1));
        assert!(connection.begin_read());
        assert!(connection.is_reading());
        assert!(!connection.begin_read());
        connection.lock().reading = false;
        assert!(connection.begin_read());
    }
}
