//! The connection engine: owns the transport, schedules exchanges and
//! drives orderly or forced shutdown.
//!
//! One engine task per connection owns the stream, the codec and the
//! mutable context. Callers hold a [`Client`] handle from any task and
//! talk to the engine only through the request queue, so the wire
//! stays strictly sequential no matter how many callers submit.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::codec::MessageDuplexCodec;
use crate::context::{ConnectionContext, Lifecycle, ServerVersion, SslState};
use crate::error::{Error, Result};
use crate::messages::{ClientMessage, ServerMessage};
use crate::queue::{RequestQueue, RequestTask};

/// Capacity of the per-exchange follow-up buffer. A handler that
/// outruns the wire by more than this fails fast instead of queueing
/// without bound.
const REPLY_CAPACITY: usize = 8;

/// How long a graceful close waits for its turn on the wire before
/// falling back to the forced close.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Translates server messages into caller items over the lifetime of
/// one exchange, and may push follow-up client messages of its own
/// (statement fetch loops, local-infile uploads).
pub trait Exchangeable: Send + 'static {
    type Item: Send + 'static;

    /// The message that opens the exchange. Called exactly once, when
    /// the queue activates the exchange.
    fn take_request(&mut self) -> ClientMessage;

    /// Handles one server message: emit zero or more items, reply with
    /// follow-up requests, or signal completion.
    fn handle(&mut self, message: ServerMessage, sink: &mut ExchangeSink<'_, Self::Item>);
}

/// The handler's view of its exchange.
pub struct ExchangeSink<'a, T> {
    items: &'a mut VecDeque<T>,
    completed: &'a mut bool,
    error: &'a mut Option<Error>,
    replies: &'a mut Vec<ClientMessage>,
}

impl<T> ExchangeSink<'_, T> {
    /// Emits one item to the caller.
    pub fn next(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Signals that the exchange produced everything it will produce.
    /// Messages still on the wire are drained and discarded.
    pub fn complete(&mut self) {
        *self.completed = true;
    }

    /// Terminates the exchange with `error`.
    pub fn error(&mut self, error: Error) {
        *self.error = Some(error);
        *self.completed = true;
    }

    /// Queues a follow-up client message on the same exchange. Fails
    /// the exchange with [`Error::BackpressureOverflow`] if more than
    /// the buffered amount are outstanding.
    pub fn reply(&mut self, message: ClientMessage) {
        self.replies.push(message);
    }
}

/// Adapts a plain request plus handler closure to [`Exchangeable`].
pub struct RequestHandler<T, H> {
    request: Option<ClientMessage>,
    handler: H,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, H> Exchangeable for RequestHandler<T, H>
where
    T: Send + 'static,
    H: FnMut(ServerMessage, &mut ExchangeSink<'_, T>) + Send + 'static,
{
    type Item = T;

    fn take_request(&mut self) -> ClientMessage {
        self.request.take().expect("request already taken")
    }

    fn handle(&mut self, message: ServerMessage, sink: &mut ExchangeSink<'_, T>) {
        (self.handler)(message, sink)
    }
}

enum ExchangeState<E: Exchangeable> {
    /// Nothing submitted yet; submission happens on first poll.
    Init {
        shared: Arc<ClientShared>,
        exchangeable: E,
    },
    Running {
        exchangeable: E,
        responses: mpsc::UnboundedReceiver<Result<ServerMessage>>,
        replies: mpsc::Sender<ClientMessage>,
        items: VecDeque<E::Item>,
        completed: bool,
    },
    Done,
}

/// A lazy exchange: a stream of handler items.
///
/// Nothing reaches the queue until the first poll. Dropping the stream
/// cancels the exchange; the engine keeps draining the wire up to the
/// response terminator so the connection stays usable.
pub struct Exchange<E: Exchangeable> {
    state: ExchangeState<E>,
}

impl<E: Exchangeable + Unpin> Stream for Exchange<E>
where
    E::Item: Unpin,
{
    type Item = Result<E::Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ExchangeState::Init { .. } => {
                    let ExchangeState::Init {
                        shared,
                        mut exchangeable,
                    } = std::mem::replace(&mut this.state, ExchangeState::Done)
                    else {
                        unreachable!()
                    };

                    if !shared.is_connected() {
                        // The un-sent request drops here, releasing any
                        // buffers it owns.
                        return Poll::Ready(Some(Err(Error::ExchangeClosed)));
                    }

                    let (responses_tx, responses) = mpsc::unbounded_channel();
                    let (replies, replies_rx) = mpsc::channel(REPLY_CAPACITY);
                    let request = exchangeable.take_request();
                    shared.queue.submit(RequestTask::Exchange {
                        request,
                        responses: responses_tx,
                        replies: replies_rx,
                    });

                    this.state = ExchangeState::Running {
                        exchangeable,
                        responses,
                        replies,
                        items: VecDeque::new(),
                        completed: false,
                    };
                }

                ExchangeState::Running {
                    exchangeable,
                    responses,
                    replies,
                    items,
                    completed,
                } => {
                    if let Some(item) = items.pop_front() {
                        return Poll::Ready(Some(Ok(item)));
                    }
                    if *completed {
                        this.state = ExchangeState::Done;
                        return Poll::Ready(None);
                    }

                    match responses.poll_recv(cx) {
                        Poll::Ready(Some(Ok(message))) => {
                            let mut error = None;
                            let mut outgoing = Vec::new();
                            {
                                let mut sink = ExchangeSink {
                                    items,
                                    completed,
                                    error: &mut error,
                                    replies: &mut outgoing,
                                };
                                exchangeable.handle(message, &mut sink);
                            }

                            for message in outgoing {
                                if error.is_some() {
                                    break;
                                }
                                match replies.try_send(message) {
                                    Ok(()) => {}
                                    Err(TrySendError::Full(_)) => {
                                        error = Some(Error::BackpressureOverflow);
                                    }
                                    Err(TrySendError::Closed(_)) => {
                                        error = Some(Error::ExchangeClosed);
                                    }
                                }
                            }

                            if let Some(e) = error {
                                responses.close();
                                this.state = ExchangeState::Done;
                                return Poll::Ready(Some(Err(e)));
                            }
                            if *completed {
                                // Undelivered messages get discarded by
                                // the engine's drain.
                                responses.close();
                            }
                        }
                        Poll::Ready(Some(Err(e))) => {
                            this.state = ExchangeState::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                        // Wire terminator without an explicit
                        // completion signal: the stream just ends.
                        Poll::Ready(None) => {
                            this.state = ExchangeState::Done;
                            return Poll::Ready(None);
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }

                ExchangeState::Done => return Poll::Ready(None),
            }
        }
    }
}

/// State shared between client handles and the engine task.
#[derive(Debug)]
pub(crate) struct ClientShared {
    pub queue: RequestQueue,
    /// Single-writer close intent: the first of close()/engine failure
    /// to set it wins, deciding expected vs unexpected close.
    pub closing: AtomicBool,
    pub connected: AtomicBool,
    pub close_signal: Notify,
}

impl ClientShared {
    pub fn is_connected(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }
}

/// Handle to one MySQL connection in command phase.
///
/// Cheap to clone; all clones feed the same wire in submission order.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
    context: ConnectionContext,
    done: watch::Receiver<bool>,
}

impl Client {
    /// Wires the engine task around an authenticated stream. The codec
    /// and context carry their handshake state forward.
    pub(crate) fn spawn<S>(
        stream: S,
        codec: MessageDuplexCodec,
        context: ConnectionContext,
    ) -> Client
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, tasks) = RequestQueue::new();
        let shared = Arc::new(ClientShared {
            queue,
            closing: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            close_signal: Notify::new(),
        });
        let (done_tx, done) = watch::channel(false);

        let engine = Engine {
            stream,
            codec,
            context: context.clone(),
            shared: Arc::clone(&shared),
            tasks,
        };
        tokio::spawn(engine.run(done_tx));

        Client {
            shared,
            context,
            done,
        }
    }

    /// Starts an exchange: sends `request` once admitted and feeds
    /// every response message to `handler` until it signals
    /// completion (or the response terminator arrives).
    pub fn exchange<T, H>(&self, request: ClientMessage, handler: H) -> Exchange<RequestHandler<T, H>>
    where
        T: Send + 'static,
        H: FnMut(ServerMessage, &mut ExchangeSink<'_, T>) + Send + Unpin + 'static,
    {
        self.exchange_with(RequestHandler {
            request: Some(request),
            handler,
            _marker: std::marker::PhantomData,
        })
    }

    /// Starts a bidirectional exchange whose handler may keep sending
    /// follow-up requests (execute/fetch streaming, local-infile).
    pub fn exchange_with<E: Exchangeable + Unpin>(&self, exchangeable: E) -> Exchange<E> {
        Exchange {
            state: ExchangeState::Init {
                shared: Arc::clone(&self.shared),
                exchangeable,
            },
        }
    }

    /// Graceful close: queues an Exit behind in-flight work, then
    /// closes the transport. Falls back to [`force_close`](Self::force_close)
    /// if the Exit cannot be delivered in time.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return self.force_close().await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.shared.queue.submit(RequestTask::Exit { done: done_tx });

        if tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, done_rx)
            .await
            .is_err()
        {
            warn!("exit message not delivered in time, force closing");
        }
        self.force_close().await;
    }

    /// Closes the underlying transport without sending anything.
    pub async fn force_close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.close_signal.notify_one();

        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    /// False once closing started or the transport dropped.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// The negotiated context as of login. Server status flags keep
    /// moving on the engine side and are not reflected here.
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn connection_id(&self) -> u32 {
        self.context.connection_id
    }

    pub fn server_version(&self) -> ServerVersion {
        self.context.server_version
    }

    /// Outcome of the TLS bridge for this connection.
    pub fn ssl_state(&self) -> SslState {
        self.context.ssl_state
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.context.connection_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Why the engine loop stopped.
enum EngineStop {
    /// Exit written; the close path is in control.
    ExitSent,
    /// force_close() fired.
    ForcedClose,
    /// The peer half-closed the transport.
    PeerClosed,
    /// Protocol or transport failure.
    Fatal(Error),
}

struct Engine<S> {
    stream: S,
    codec: MessageDuplexCodec,
    context: ConnectionContext,
    shared: Arc<ClientShared>,
    tasks: mpsc::UnboundedReceiver<RequestTask>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Engine<S> {
    async fn run(mut self, done: watch::Sender<bool>) {
        let stop = self.run_loop().await;

        self.context.lifecycle = Lifecycle::Disconnecting;
        let closing_was = self.shared.closing.swap(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);

        let queue_error = match &stop {
            EngineStop::ExitSent | EngineStop::ForcedClose => Error::ExchangeClosed,
            EngineStop::PeerClosed => {
                if closing_was {
                    debug!("connection closed");
                } else {
                    warn!("connection has been closed by peer");
                }
                Error::ExchangeClosed
            }
            EngineStop::Fatal(e) => {
                error!(error = %e, "connection failure, draining");
                e.clone()
            }
        };
        self.shared.queue.dispose(queue_error);

        let _ = self.stream.shutdown().await;
        self.context.lifecycle = Lifecycle::Closed;
        debug!(connection_id = self.context.connection_id, "engine stopped");
        let _ = done.send(true);
    }

    async fn run_loop(&mut self) -> EngineStop {
        loop {
            tokio::select! {
                _ = self.shared.close_signal.notified() => return EngineStop::ForcedClose,

                task = self.tasks.recv() => match task {
                    Some(RequestTask::Exchange { request, responses, replies }) => {
                        if let Some(stop) = self.run_exchange(request, responses, replies).await {
                            return stop;
                        }
                    }
                    Some(RequestTask::Exit { done }) => {
                        debug!("request: Exit");
                        let mut out = BytesMut::new();
                        self.codec.encode(&ClientMessage::Exit, &self.context, &mut out);
                        let _ = self.stream.write_all(&out).await;
                        let _ = self.stream.flush().await;
                        let _ = done.send(());
                        return EngineStop::ExitSent;
                    }
                    // All client handles (and the queue) are gone.
                    None => return EngineStop::ForcedClose,
                },

                read = self.stream.read_buf(self.codec.read_buf()) => match read {
                    Ok(0) => return EngineStop::PeerClosed,
                    Ok(_) => match self.codec.next_message(&mut self.context) {
                        Ok(None) => {}
                        Ok(Some(decoded)) => {
                            return EngineStop::Fatal(Error::ProtocolViolation(format!(
                                "unsolicited message {} outside any exchange",
                                decoded.message
                            )));
                        }
                        Err(e) => return EngineStop::Fatal(e),
                    },
                    Err(e) => return EngineStop::Fatal(Error::io(e)),
                },
            }
        }
    }

    /// Runs one exchange to its terminator. Returns `Some` when the
    /// engine must stop instead of admitting the next task.
    async fn run_exchange(
        &mut self,
        request: ClientMessage,
        responses: mpsc::UnboundedSender<Result<ServerMessage>>,
        mut replies: mpsc::Receiver<ClientMessage>,
    ) -> Option<EngineStop> {
        // Cancelled while still queued: nothing has touched the wire,
        // so the request can be dropped whole.
        if responses.is_closed() {
            drop(request);
            self.shared.queue.run();
            return None;
        }

        debug!("request: {request}");
        let mut out = BytesMut::new();
        self.codec.encode(&request, &self.context, &mut out);
        if let Err(e) = self.write_all(&out).await {
            let _ = responses.send(Err(e.clone()));
            return Some(EngineStop::Fatal(e));
        }

        if !request.expects_response() {
            drop(responses);
            self.shared.queue.run();
            return None;
        }

        let mut cancelled = false;
        let mut replies_open = true;

        loop {
            // Deliver everything already buffered before suspending.
            loop {
                match self.codec.next_message(&mut self.context) {
                    Ok(Some(decoded)) => {
                        log_response(&decoded.message);
                        if !cancelled && responses.send(Ok(decoded.message)).is_err() {
                            // Caller cancelled: discard from here on,
                            // but keep draining to the terminator.
                            cancelled = true;
                        }
                        if decoded.ends_exchange {
                            self.shared.queue.run();
                            return None;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !cancelled {
                            let _ = responses.send(Err(e.clone()));
                        }
                        return Some(EngineStop::Fatal(e));
                    }
                }
            }

            tokio::select! {
                _ = self.shared.close_signal.notified() => {
                    if !cancelled {
                        let _ = responses.send(Err(Error::ExchangeClosed));
                    }
                    return Some(EngineStop::ForcedClose);
                }

                _ = responses.closed(), if !cancelled => {
                    cancelled = true;
                }

                reply = replies.recv(), if replies_open && !cancelled => match reply {
                    Some(message) => {
                        debug!("request: {message}");
                        let mut out = BytesMut::new();
                        self.codec.encode(&message, &self.context, &mut out);
                        if let Err(e) = self.write_all(&out).await {
                            let _ = responses.send(Err(e.clone()));
                            return Some(EngineStop::Fatal(e));
                        }
                    }
                    None => replies_open = false,
                },

                read = self.stream.read_buf(self.codec.read_buf()) => match read {
                    Ok(0) => {
                        let err = if self.shared.closing.load(Ordering::SeqCst) {
                            Error::ExpectedClosed
                        } else {
                            Error::UnexpectedClosed
                        };
                        if !cancelled {
                            let _ = responses.send(Err(err));
                        }
                        return Some(EngineStop::PeerClosed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let err = Error::io(e);
                        if !cancelled {
                            let _ = responses.send(Err(err.clone()));
                        }
                        return Some(EngineStop::Fatal(err));
                    }
                },
            }
        }
    }

    async fn write_all(&mut self, out: &[u8]) -> Result<()> {
        self.stream.write_all(out).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn log_response(message: &ServerMessage) {
    match message.warnings() {
        Some(warnings) if warnings > 0 => {
            info!("response: {message}, reports {warnings} warning(s)");
        }
        _ => debug!("response: {message}"),
    }
}
