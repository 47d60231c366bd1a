//!
//! The connection engine.
//!
//! One [`Connection`] owns one transport stream and multiplexes every
//! submitter onto it: requests queue in FIFO order, a writer loop batches
//! them into single socket writes, a reader loop parses responses and
//! completes requests from the front of the queue, and a health ping plus an
//! idle watchdog guard liveness. `run` supervises those loops and completes
//! with the first error any of them hits.
//!

mod health;
mod queue;
mod reader;
mod writer;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::adapter::{Adapter, DynAdapter, Ignore};
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::request::Request;
use health::{health_loop, idle_loop};
use queue::{Completion, Queue};
use reader::{reader_loop, SocketReader};
use writer::writer_loop;

/// A pending `receive_push` call: the adapter the reader will parse into and
/// the wakeup to fire when the push is delivered.
pub(crate) struct PushWaiter {
    pub adapter: Box<dyn DynAdapter>,
    done: oneshot::Sender<Completion>,
}

impl PushWaiter {
    pub(crate) fn complete(self, result: crate::Result<u64>) {
        let _ = self.done.send(Completion {
            result,
            adapter: Some(self.adapter),
        });
    }

    /// The `receive_push` caller dropped its future; delivering here would
    /// lose the push.
    pub(crate) fn abandoned(&self) -> bool {
        self.done.is_closed()
    }
}

/// State shared between the public surface and the connection loops.
pub(crate) struct Shared {
    pub queue: Mutex<Queue>,
    pub writer_wake: Notify,
    pub push_waiters: Mutex<VecDeque<PushWaiter>>,
    pub push_arrived: Notify,
    /// When bytes last arrived from the server.
    pub last_data: Mutex<Instant>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
    connected: AtomicBool,
    run_active: AtomicBool,
}

impl Shared {
    pub(crate) fn touch_last_data(&self) {
        *self.last_data.lock().unwrap() = Instant::now();
    }
}

/// Enqueues a request and waits for its completion.
pub(crate) async fn exec_shared(
    shared: &Shared,
    req: &Request,
    adapter: Box<dyn DynAdapter>,
) -> crate::Result<(Option<Box<dyn DynAdapter>>, u64)> {
    let (rx, wake_writer) = {
        let mut queue = shared.queue.lock().unwrap();
        queue.push_back(req, adapter)
    };
    if wake_writer {
        shared.writer_wake.notify_one();
    }
    // A close racing the enqueue may have drained the queue before our entry
    // landed; sweeping again guarantees the wakeup fires.
    if shared.closed.load(Ordering::SeqCst) {
        shared.queue.lock().unwrap().fail_all(&Error::aborted());
    }

    let completion = rx.await.map_err(|_| Error::aborted())?;
    match completion.result {
        Ok(bytes) => Ok((completion.adapter, bytes)),
        Err(err) => Err(err),
    }
}

/// A multiplexed RESP3 client connection.
///
/// The connection does not dial by itself: callers drive [`run`] (usually
/// from a spawned task) and resubmit it to reconnect. Requests submitted
/// while disconnected stay queued and go out once a handshake succeeds,
/// unless they opt out via
/// [`Request::set_close_on_connection_lost`].
///
/// All methods take `&self`; share the connection between submitters behind
/// an [`Arc`].
///
/// [`run`]: Connection::run
pub struct Connection {
    shared: Arc<Shared>,
    config: Config,
}

impl Connection {
    /// Creates a connection with default configuration.
    pub fn new() -> Connection {
        Connection::with_config(Config::default())
    }

    /// Creates a connection with the given configuration.
    pub fn with_config(config: Config) -> Connection {
        let (shutdown_tx, _) = broadcast::channel(1);
        Connection {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::new()),
                writer_wake: Notify::new(),
                push_waiters: Mutex::new(VecDeque::new()),
                push_arrived: Notify::new(),
                last_data: Mutex::new(Instant::now()),
                shutdown_tx,
                closed: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                run_active: AtomicBool::new(false),
            }),
            config,
        }
    }

    /// The configuration this connection runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `true` while a transport stream is up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Submits a request and waits for all of its responses.
    ///
    /// Every response node is fed to `adapter`; on success the adapter comes
    /// back together with the number of response bytes read. A server error
    /// reply fails only this call with
    /// [`ExecError`](ErrorKind::ExecError) — the connection stays up, and
    /// the error detail carries the server's message.
    pub async fn exec<A>(&self, req: &Request, adapter: A) -> crate::Result<(A, u64)>
    where
        A: Adapter + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::aborted());
        }
        if req.is_empty() {
            return Ok((adapter, 0));
        }
        if req.close_on_connection_lost() && !self.is_connected() {
            return Err(Error::new(ErrorKind::NotConnected));
        }

        let (boxed, bytes) = exec_shared(&self.shared, req, Box::new(adapter)).await?;
        match recover_adapter::<A>(boxed) {
            Some(adapter) => Ok((adapter, bytes)),
            None => Err(Error::aborted()),
        }
    }

    /// Waits for one server push and feeds its nodes to `adapter`.
    ///
    /// While no `receive_push` is pending the reader does not consume pushes
    /// from the socket, so a subscriber should keep one call outstanding.
    pub async fn receive_push<A>(&self, adapter: A) -> crate::Result<(A, u64)>
    where
        A: Adapter + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::aborted());
        }

        let (done, rx) = oneshot::channel();
        self.shared
            .push_waiters
            .lock()
            .unwrap()
            .push_back(PushWaiter {
                adapter: Box::new(adapter),
                done,
            });
        self.shared.push_arrived.notify_one();
        if self.shared.closed.load(Ordering::SeqCst) {
            fail_push_waiters(&self.shared, &Error::aborted());
        }

        let completion = rx.await.map_err(|_| Error::aborted())?;
        match completion.result {
            Ok(bytes) => match recover_adapter::<A>(completion.adapter) {
                Some(adapter) => Ok((adapter, bytes)),
                None => Err(Error::aborted()),
            },
            Err(err) => Err(err),
        }
    }

    /// Resolves `host`, connects, performs the `HELLO` handshake, and runs
    /// the connection loops until the first error.
    ///
    /// This function only completes with an error; reconnection is the
    /// caller's loop, ideally after `reconnect_wait_interval`.
    pub async fn run(&self, host: &str, port: u16) -> crate::Result<()> {
        let _guard = self.run_guard()?;
        let result = match self.establish(host, port).await {
            Ok(stream) => self.drive(stream).await,
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    /// Like [`run`](Connection::run), but over a caller-supplied transport:
    /// any `AsyncRead + AsyncWrite` stream works, which is how TLS wrapped
    /// sockets and in-memory test transports plug in.
    pub async fn run_with<C>(&self, stream: C) -> crate::Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let _guard = self.run_guard()?;
        let result = self.drive(stream).await;
        self.finish(result)
    }

    /// Tears the connection down for good: every queued request and pending
    /// push consumer completes with
    /// [`OperationAborted`](ErrorKind::OperationAborted), the loops stop,
    /// and later calls are refused.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing connection");
        let _ = self.shared.shutdown_tx.send(());
        self.shared.queue.lock().unwrap().fail_all(&Error::aborted());
        fail_push_waiters(&self.shared, &Error::aborted());
        self.shared.writer_wake.notify_one();
        self.shared.push_arrived.notify_one();
    }

    fn run_guard(&self) -> crate::Result<RunGuard<'_>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::aborted());
        }
        if self.shared.run_active.swap(true, Ordering::SeqCst) {
            return Err(Error::with_detail(
                ErrorKind::ConnectError,
                "run already active on this connection",
            ));
        }
        Ok(RunGuard {
            shared: &*self.shared,
        })
    }

    async fn establish(&self, host: &str, port: u16) -> crate::Result<TcpStream> {
        let addr = format!("{host}:{port}");
        let endpoints: Vec<SocketAddr> =
            match timeout(self.config.resolve_timeout, lookup_host(addr.clone())).await {
                Err(_) => return Err(Error::with_detail(ErrorKind::ResolveTimeout, addr)),
                Ok(Err(err)) => {
                    return Err(Error::with_detail(
                        ErrorKind::ResolveError,
                        format!("{addr}: {err}"),
                    ))
                }
                Ok(Ok(endpoints)) => endpoints.collect(),
            };
        if endpoints.is_empty() {
            return Err(Error::with_detail(
                ErrorKind::ResolveError,
                format!("{addr}: no endpoints"),
            ));
        }

        let mut last_err = Error::new(ErrorKind::ConnectError);
        for endpoint in endpoints {
            match timeout(self.config.connect_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    info!(%endpoint, "connected");
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    last_err = Error::with_detail(
                        ErrorKind::ConnectError,
                        format!("{endpoint}: {err}"),
                    );
                }
                Err(_) => {
                    last_err =
                        Error::with_detail(ErrorKind::ConnectTimeout, endpoint.to_string());
                }
            }
        }
        Err(last_err)
    }

    /// Runs the parallel phase over an established stream. The handshake
    /// request jumps the queue and is watched as a sibling of the loops, so
    /// a server that never answers `HELLO` is caught by the idle watchdog.
    async fn drive<C>(&self, stream: C) -> crate::Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let shared = &*self.shared;
        let config = &self.config;

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut socket_reader =
            SocketReader::new(read_half, config.max_read_size, config.max_nesting);

        shared.touch_last_data();
        shared.connected.store(true, Ordering::SeqCst);

        let hello = Request::hello(config);
        let mut hello_rx = {
            let mut queue = shared.queue.lock().unwrap();
            queue.push_front(&hello, Box::new(Ignore))
        };

        // `close` is signalled at most once; each run subscribes fresh, and a
        // close that happened before this subscription is caught by the
        // `closed` check below.
        let mut shutdown_rx = shared.shutdown_tx.subscribe();

        let reader_fut = reader_loop(shared, &mut socket_reader);
        let writer_fut = writer_loop(shared, &mut write_half, config.coalesce_requests);
        let health_fut = health_loop(shared, config);
        let idle_fut = idle_loop(shared, config.ping_interval);
        tokio::pin!(reader_fut, writer_fut, health_fut, idle_fut);

        let err: Error = 'run: {
            // `close` may have raced the setup above.
            if shared.closed.load(Ordering::SeqCst) {
                break 'run Error::aborted();
            }

            let handshake = tokio::select! {
                _ = shutdown_rx.recv() => Err(Error::aborted()),
                completion = &mut hello_rx => hello_result(completion),
                res = &mut reader_fut => Err(loop_error(res)),
                res = &mut writer_fut => Err(loop_error(res)),
                res = &mut health_fut => Err(loop_error(res)),
                res = &mut idle_fut => Err(loop_error(res)),
            };
            if let Err(err) = handshake {
                break 'run err;
            }
            debug!("handshake complete");

            tokio::select! {
                _ = shutdown_rx.recv() => Error::aborted(),
                res = &mut reader_fut => loop_error(res),
                res = &mut writer_fut => loop_error(res),
                res = &mut health_fut => loop_error(res),
                res = &mut idle_fut => loop_error(res),
            }
        };

        Err(err)
    }

    /// Teardown after `drive` returns: requests the dead connection owed
    /// responses to fail with its error, the rest stay queued for the next
    /// `run`.
    fn finish(&self, result: crate::Result<()>) -> crate::Result<()> {
        let err = match result {
            Err(err) => err,
            Ok(()) => Error::aborted(),
        };
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.queue.lock().unwrap().fail_on_disconnect(&err);
        fail_push_waiters(&self.shared, &err);
        info!(%err, "connection terminated");
        Err(err)
    }
}

impl Default for Connection {
    fn default() -> Connection {
        Connection::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .field(
                "closed",
                &self.shared.closed.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

/// Clears `run_active` however the run ends.
struct RunGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.shared.run_active.store(false, Ordering::SeqCst);
    }
}

fn fail_push_waiters(shared: &Shared, err: &Error) {
    let waiters: Vec<PushWaiter> = {
        let mut waiters = shared.push_waiters.lock().unwrap();
        waiters.drain(..).collect()
    };
    for waiter in waiters {
        waiter.complete(Err(err.clone()));
    }
}

fn recover_adapter<A: Adapter + 'static>(boxed: Option<Box<dyn DynAdapter>>) -> Option<A> {
    boxed
        .and_then(|adapter| adapter.into_any().downcast::<A>().ok())
        .map(|adapter| *adapter)
}

/// Maps the handshake completion onto the run result.
fn hello_result(
    completion: Result<Completion, oneshot::error::RecvError>,
) -> crate::Result<()> {
    let completion = completion.map_err(|_| Error::aborted())?;
    match completion.result {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::ExecError => Err(Error::with_detail(
            ErrorKind::HandshakeFailed,
            err.detail().unwrap_or("server rejected HELLO").to_string(),
        )),
        Err(err) => Err(err),
    }
}

/// The loops never return cleanly; a clean return still ends the run.
fn loop_error(result: crate::Result<()>) -> Error {
    match result {
        Err(err) => err,
        Ok(()) => Error::with_detail(ErrorKind::ReadError, "connection task stopped unexpectedly"),
    }
}
