//! The event loop. Owns the listener, the poller, both cache tiers, the
//! embedder handle, the worker pool, and every live connection. Nothing
//! here is touched from a worker thread; see the module docs on
//! `worker_pool` for what workers own instead.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vecs_net::{Poller, Token};

use crate::cache::{ExactCache, VectorIndex};
use crate::config::Config;
use crate::connection::{Connection, ConnId, LifecycleState};
use crate::embed::Embedder;
use crate::error::{Result, VecsError};
use crate::normalize::{composite_key, normalize};
use crate::snapshot;
use crate::worker_pool::{self, Job, JobKind, WorkerPool};

/// Conventional ceiling on fd values the connection table is sized for.
/// An accepted connection whose fd is at or past this is refused and
/// closed.
const MAX_FD: usize = 65536;

/// Bounded job-queue depth.
const JOB_QUEUE_CAPACITY: usize = 256;

const LISTENER_TOKEN: Token = Token(0);
const COMPLETION_TOKEN: Token = Token(1);

fn conn_token(fd: i32) -> Token {
    Token(fd as usize + 2)
}

fn fd_from_token(token: Token) -> i32 {
    (token.0 - 2) as i32
}

pub struct Reactor {
    listener: mio::net::TcpListener,
    poller: Poller,
    connections: Vec<Option<Connection>>,
    l1: ExactCache,
    l2: VectorIndex,
    embedder: Arc<dyn Embedder>,
    worker_pool: WorkerPool,
    completion_rx: mio::unix::pipe::Receiver,
    next_conn_id: ConnId,
    last_snapshot: Instant,
    config: Config,
}

impl Reactor {
    pub fn new(config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::with_queue_capacity(config, embedder, JOB_QUEUE_CAPACITY)
    }

    /// Exposed for tests that need to exercise a saturated job queue (e.g.
    /// `NUM_WORKERS=1` with a queue of depth 1) without waiting for the
    /// production-sized queue to fill.
    pub fn with_queue_capacity(config: Config, embedder: Arc<dyn Embedder>, queue_capacity: usize) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|_| VecsError::Config { detail: format!("invalid PORT: {}", config.port) })?;

        let mut listener = vecs_net::bind_listener(addr)?;
        let mut poller = Poller::new(1024)?;
        poller.add_readable(&mut listener, LISTENER_TOKEN)?;

        let (worker_pool, mut completion_rx) =
            WorkerPool::new(config.num_workers, queue_capacity, Arc::clone(&embedder))?;
        poller.add_readable(&mut completion_rx, COMPLETION_TOKEN)?;

        let mut l1 = ExactCache::new();
        let mut l2 = VectorIndex::new(embedder.dim(), config.l2_capacity);
        if let Err(e) = snapshot::load(&config.snapshot_path, &mut l1, &mut l2) {
            warn!(error = %e, "snapshot load failed, starting empty");
        }

        info!(port = config.port, workers = config.num_workers, "reactor initialized");

        Ok(Self {
            listener,
            poller,
            connections: (0..MAX_FD).map(|_| None).collect(),
            l1,
            l2,
            embedder,
            worker_pool,
            completion_rx,
            next_conn_id: 1,
            last_snapshot: Instant::now(),
            config,
        })
    }

    /// Runs until `shutdown` is set, polling with a fixed 1-second timeout
    /// so the snapshot timer is checked even on an idle server.
    pub fn run_until_shutdown(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.poller.poll(Some(Duration::from_secs(1)))?;
            let events: Vec<(Token, bool, bool)> =
                self.poller.events().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

            for (token, readable, writable) in events {
                if token == LISTENER_TOKEN {
                    self.accept_loop()?;
                } else if token == COMPLETION_TOKEN {
                    self.drain_completions();
                } else {
                    self.handle_client_event(fd_from_token(token), readable, writable);
                }
            }

            self.maybe_snapshot();
        }
        Ok(())
    }

    pub fn shutdown(self) {
        info!("reactor shutting down");
        self.worker_pool.shutdown();
    }

    /// Bound address of the listening socket. Mainly useful in tests that
    /// bind to port 0 and need to know what port the OS actually picked.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept_loop(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.accept_connection(stream, addr),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn accept_connection(&mut self, mut stream: mio::net::TcpStream, addr: SocketAddr) {
        let fd = stream.as_raw_fd();
        if fd as usize >= MAX_FD {
            warn!(fd, "refusing connection: fd exceeds connection table size");
            return;
        }
        if let Err(e) = vecs_net::prepare_stream(&stream) {
            warn!(fd, error = %e, "set_nodelay failed");
        }
        if let Err(e) = self.poller.add_readable(&mut stream, conn_token(fd)) {
            warn!(fd, error = %e, "failed to register new connection");
            return;
        }
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        debug!(fd, id, %addr, "accepted connection");
        self.connections[fd as usize] = Some(Connection::new(stream, fd, id));
    }

    fn handle_client_event(&mut self, fd: i32, readable: bool, writable: bool) {
        let Some(mut conn) = self.connections.get_mut(fd as usize).and_then(Option::take) else {
            return;
        };

        if writable {
            self.service_writable(&mut conn);
        }

        if conn.is_alive() && readable {
            self.service_readable(&mut conn);
        }

        if conn.is_alive() {
            self.connections[fd as usize] = Some(conn);
        } else {
            debug!(fd, "connection destroyed");
        }
    }

    /// Drains the write backlog until `WouldBlock` or empty. A fatal write
    /// error destroys the connection; otherwise write-readiness is armed
    /// or disarmed to match whether a backlog remains.
    fn service_writable(&mut self, conn: &mut Connection) {
        loop {
            if conn.write_buf.is_empty() {
                break;
            }
            match conn.write_once() {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let fd = conn.fd();
                    let _ = self.poller.enable_write(conn.stream_mut().unwrap(), conn_token(fd));
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.close_connection(conn);
                    return;
                }
            }
        }
        let fd = conn.fd();
        if let Some(stream) = conn.stream_mut() {
            let _ = self.poller.disable_write(stream, conn_token(fd));
        }
        if conn.state == LifecycleState::Closing {
            self.close_connection(conn);
        }
    }

    /// Deregisters the socket from the poller before dropping it. The
    /// `destroy`d connection itself no longer holds a stream to deregister,
    /// so this has to happen first.
    fn close_connection(&mut self, conn: &mut Connection) {
        if let Some(stream) = conn.stream_mut() {
            let _ = self.poller.delete(stream);
        }
        conn.destroy();
    }

    /// Drains the readable side until `WouldBlock`, running every
    /// complete command produced by the parser through the command
    /// interpreter.
    fn service_readable(&mut self, conn: &mut Connection) {
        loop {
            match conn.read_once() {
                Ok(0) => {
                    self.close_connection(conn);
                    return;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.close_connection(conn);
                    return;
                }
            }

            loop {
                match conn.parser.parse_next(&mut conn.read_buf) {
                    Ok(Some(argv)) => self.execute_command(conn, argv),
                    Ok(None) => break,
                    Err(_) => {
                        self.queue_response(conn, b"-ERR Protocol Error\r\n");
                        conn.state = LifecycleState::Closing;
                        break;
                    }
                }
            }

            if conn.state == LifecycleState::Closing {
                break;
            }
        }
    }

    fn queue_response(&mut self, conn: &mut Connection, bytes: &[u8]) {
        conn.write_buf.extend_from_slice(bytes);
        let fd = conn.fd();
        if let Some(stream) = conn.stream_mut() {
            if let Err(e) = self.poller.enable_write(stream, conn_token(fd)) {
                warn!(fd, error = %e, "failed to arm write readiness");
            }
        }
    }

    /// Dispatches one fully-parsed command. `SET`/`QUERY`-miss/`DELETE`
    /// answer later, from the completion drain, once the worker pool has
    /// computed an embedding.
    fn execute_command(&mut self, conn: &mut Connection, argv: Vec<Vec<u8>>) {
        let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
        match name.as_str() {
            "SET" => self.cmd_set(conn, &argv),
            "QUERY" => self.cmd_query(conn, &argv),
            "DELETE" => self.cmd_delete(conn, &argv),
            "FLUSH" => self.cmd_flush(conn, &argv),
            "SAVE" => self.cmd_save(conn, &argv),
            other => {
                self.queue_response(
                    conn,
                    format!("-ERR unknown command '{other}'\r\n").as_bytes(),
                );
            }
        }
    }

    fn cmd_set(&mut self, conn: &mut Connection, argv: &[Vec<u8>]) {
        if argv.len() != 4 && argv.len() != 5 {
            return self.wrong_arity(conn, "SET");
        }
        let prompt = arg_str(&argv[1]);
        let params = arg_str(&argv[2]);
        let response = arg_str(&argv[3]);
        let ttl = if argv.len() == 5 {
            match arg_str(&argv[4]).parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => return self.wrong_arity(conn, "SET"),
            }
        } else {
            self.config.ttl_default
        };

        let normalized_prompt = normalize(&prompt);
        let normalized_params = normalize(&params);
        let key = composite_key(&normalized_prompt, &normalized_params);
        self.l1.set(key, response.clone(), ttl);

        let mut job = Job::new(JobKind::Set, conn.fd(), conn.id, normalized_prompt, prompt);
        job.response = Some(response);
        job.ttl = Some(ttl);
        match self.worker_pool.submit(job) {
            Ok(()) => {}
            Err(_) => self.queue_response(conn, b"-ERR Job Queue Full\r\n"),
        }
    }

    fn cmd_query(&mut self, conn: &mut Connection, argv: &[Vec<u8>]) {
        if argv.len() != 3 {
            return self.wrong_arity(conn, "QUERY");
        }
        let prompt = arg_str(&argv[1]);
        let params = arg_str(&argv[2]);
        let normalized_prompt = normalize(&prompt);
        let normalized_params = normalize(&params);
        let key = composite_key(&normalized_prompt, &normalized_params);

        if let Some(value) = self.l1.get(&key) {
            let msg = format_bulk(value);
            return self.queue_response(conn, &msg);
        }

        let job = Job::new(JobKind::Query, conn.fd(), conn.id, normalized_prompt, prompt);
        match self.worker_pool.submit(job) {
            Ok(()) => {}
            Err(_) => self.queue_response(conn, b"-ERR Job Queue Full\r\n"),
        }
    }

    fn cmd_delete(&mut self, conn: &mut Connection, argv: &[Vec<u8>]) {
        if argv.len() != 3 {
            return self.wrong_arity(conn, "DELETE");
        }
        let prompt = arg_str(&argv[1]);
        let params = arg_str(&argv[2]);
        let normalized_prompt = normalize(&prompt);
        let normalized_params = normalize(&params);
        let key = composite_key(&normalized_prompt, &normalized_params);
        self.l1.delete(&key);

        let job = Job::new(JobKind::Delete, conn.fd(), conn.id, normalized_prompt, prompt);
        match self.worker_pool.submit(job) {
            Ok(()) => {}
            Err(_) => self.queue_response(conn, b"-ERR Job Queue Full\r\n"),
        }
    }

    fn cmd_flush(&mut self, conn: &mut Connection, argv: &[Vec<u8>]) {
        if argv.len() != 1 {
            return self.wrong_arity(conn, "FLUSH");
        }
        self.l1.clear();
        self.l2.clear();
        self.queue_response(conn, b"+OK\r\n");
    }

    fn cmd_save(&mut self, conn: &mut Connection, argv: &[Vec<u8>]) {
        if argv.len() != 1 {
            return self.wrong_arity(conn, "SAVE");
        }
        if let Err(e) = snapshot::save(&self.config.snapshot_path, &self.l1, &self.l2) {
            warn!(error = %e, "SAVE failed");
        }
        self.queue_response(conn, b"+OK\r\n");
    }

    fn wrong_arity(&mut self, conn: &mut Connection, name: &str) {
        self.queue_response(conn, format!("-ERR wrong number of arguments for '{name}'\r\n").as_bytes());
    }

    /// Drains every completion currently buffered in the pipe, validating
    /// `(fd, conn_id)` against the live connection before touching it.
    /// A completion for a connection that has since closed and been
    /// replaced by a new one at the same fd is silently discarded.
    fn drain_completions(&mut self) {
        loop {
            match worker_pool::read_completed(&mut self.completion_rx) {
                Ok(Some(job)) => self.handle_completed_job(*job),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "completion channel read failed");
                    break;
                }
            }
        }
    }

    fn handle_completed_job(&mut self, job: Job) {
        let fd = job.fd as usize;
        let matches_live = matches!(self.connections.get(fd), Some(Some(c)) if c.id == job.conn_id);
        if !matches_live {
            debug!(fd = job.fd, conn_id = job.conn_id, "discarding completion for stale connection");
            return;
        }
        let Some(mut conn) = self.connections[fd].take() else { return };

        if !job.success {
            self.queue_response(&mut conn, b"-ERR Vector Embedding Failed\r\n");
        } else {
            let vector = job.result_vector.as_deref().unwrap_or(&[]);
            match job.kind {
                JobKind::Set => {
                    let is_duplicate =
                        self.l2.search(vector, &job.original_prompt, self.config.l2_dedupe_threshold).is_some();
                    if !is_duplicate {
                        let ttl = job.ttl.unwrap_or(self.config.ttl_default);
                        let response = job.response.as_deref().unwrap_or("");
                        if let Err(VecsError::L2Full) = self.l2.insert(vector, &job.original_prompt, response, ttl) {
                            debug!("L2 at capacity, SET accelerator skipped");
                        }
                    }
                    self.queue_response(&mut conn, b"+OK\r\n");
                }
                JobKind::Query => {
                    match self.l2.search(vector, &job.original_prompt, self.config.l2_threshold) {
                        Some(resp) => {
                            let msg = format_bulk(&resp);
                            self.queue_response(&mut conn, &msg);
                        }
                        None => self.queue_response(&mut conn, b"$-1\r\n"),
                    }
                }
                JobKind::Delete => {
                    self.l2.delete_semantic(vector);
                    self.queue_response(&mut conn, b"+OK\r\n");
                }
            }
        }

        if conn.is_alive() {
            self.connections[fd] = Some(conn);
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.config.save_interval.is_zero() {
            return;
        }
        if self.last_snapshot.elapsed() >= self.config.save_interval {
            if let Err(e) = snapshot::save(&self.config.snapshot_path, &self.l1, &self.l2) {
                warn!(error = %e, "periodic snapshot failed");
            }
            self.last_snapshot = Instant::now();
        }
    }
}

fn arg_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn format_bulk(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 16);
    out.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}
