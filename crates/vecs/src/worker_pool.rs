//! Moves embedding computation off the reactor thread. Workers dequeue
//! jobs, call into the `Embedder`, and post completions back through a
//! non-blocking pipe. The reactor only ever suspends inside `poll`, so the
//! completion source has to be something `Poller` can register.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::pipe;
use tracing::{debug, error, warn};

use crate::embed::Embedder;
use crate::error::{Result, VecsError};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Set,
    Query,
    Delete,
}

/// A unit of embedding work handed to a worker and returned through the
/// completion channel. `fd`/`conn_id` together name a specific connection
/// generation: the reactor discards a completion whose pair no longer
/// matches the live connection at that fd.
pub struct Job {
    pub kind: JobKind,
    pub fd: i32,
    pub conn_id: ConnId,
    pub text_to_embed: String,
    pub original_prompt: String,
    pub response: Option<String>,
    pub ttl: Option<Duration>,
    pub result_vector: Option<Vec<f32>>,
    pub success: bool,
}

impl Job {
    pub fn new(
        kind: JobKind,
        fd: i32,
        conn_id: ConnId,
        text_to_embed: String,
        original_prompt: String,
    ) -> Self {
        Self {
            kind,
            fd,
            conn_id,
            text_to_embed,
            original_prompt,
            response: None,
            ttl: None,
            result_vector: None,
            success: false,
        }
    }
}

struct Inner {
    queue: VecDeque<Job>,
    shutdown: bool,
}

/// Bounded job queue plus `N` worker threads. `submit` never blocks the
/// caller: a full queue is rejected outright so the reactor can answer
/// `-ERR Job Queue Full\r\n` instead of stalling.
pub struct WorkerPool {
    state: Arc<(Mutex<Inner>, Condvar)>,
    capacity: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_workers` threads sharing `embedder`, and returns the
    /// pool alongside the read end of the completion pipe. Register that
    /// receiver with the `Poller` under whatever tag the reactor uses for
    /// worker completions.
    pub fn new(
        num_workers: usize,
        capacity: usize,
        embedder: Arc<dyn Embedder>,
    ) -> io::Result<(Self, pipe::Receiver)> {
        let (sender, receiver) = pipe::new()?;
        let sender = Arc::new(Mutex::new(sender));
        let state = Arc::new((Mutex::new(Inner { queue: VecDeque::new(), shutdown: false }), Condvar::new()));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let state = Arc::clone(&state);
            let sender = Arc::clone(&sender);
            let embedder = Arc::clone(&embedder);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("vecs-worker-{worker_id}"))
                    .spawn(move || worker_routine(worker_id, state, sender, embedder))
                    .expect("failed to spawn worker thread"),
            );
        }

        Ok((Self { state, capacity, handles }, receiver))
    }

    /// Enqueues `job`, or returns `QueueFull` if the queue is already at
    /// capacity. The reactor never blocks waiting for a worker.
    pub fn submit(&self, job: Job) -> Result<()> {
        let (mutex, condvar) = &*self.state;
        let mut inner = mutex.lock().unwrap();
        if inner.queue.len() >= self.capacity {
            warn!(queue_len = inner.queue.len(), "job rejected: queue full");
            return Err(VecsError::QueueFull);
        }
        inner.queue.push_back(job);
        condvar.notify_one();
        Ok(())
    }

    /// Sets the shutdown flag, wakes every worker, and joins them. Any job
    /// still queued at this point is simply dropped.
    pub fn shutdown(mut self) {
        {
            let (mutex, condvar) = &*self.state;
            let mut inner = mutex.lock().unwrap();
            inner.shutdown = true;
            condvar.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_routine(
    worker_id: usize,
    state: Arc<(Mutex<Inner>, Condvar)>,
    sender: Arc<Mutex<pipe::Sender>>,
    embedder: Arc<dyn Embedder>,
) {
    let (mutex, condvar) = &*state;
    loop {
        let mut job = {
            let mut inner = mutex.lock().unwrap();
            while inner.queue.is_empty() && !inner.shutdown {
                inner = condvar.wait(inner).unwrap();
            }
            match inner.queue.pop_front() {
                Some(job) => job,
                None => return, // shutdown and queue drained
            }
        };

        let mut vector = vec![0.0f32; embedder.dim()];
        match embedder.embed(worker_id, &job.text_to_embed, &mut vector) {
            Ok(()) => {
                job.result_vector = Some(vector);
                job.success = true;
            }
            Err(e) => {
                debug!(worker_id, error = %e, "embedding failed");
                job.success = false;
            }
        }

        post_completion(&sender, job);
    }
}

/// Hands the job back to the reactor as a raw pointer written to the
/// completion pipe. The pointer-sized write is atomic at the byte-stream
/// level (POSIX guarantees this up to `PIPE_BUF`), so no locking is needed
/// on the read side beyond draining one pointer at a time.
fn post_completion(sender: &Mutex<pipe::Sender>, job: Job) {
    let boxed = Box::new(job);
    let ptr = Box::into_raw(boxed) as usize;
    let bytes = ptr.to_ne_bytes();

    let mut guard = sender.lock().unwrap();
    let mut written = 0;
    while written < bytes.len() {
        match guard.write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::yield_now();
            }
            Err(e) => {
                error!(error = %e, "worker completion pipe write failed, job leaked");
                // SAFETY: reclaim the box so we don't leak; the reactor
                // will never see this completion.
                unsafe { drop(Box::from_raw(ptr as *mut Job)) };
                return;
            }
        }
    }
}

/// Non-blocking read of exactly one completed job pointer from the pipe's
/// read end. Returns `None` on `WouldBlock`. Callers loop this to drain an
/// edge-triggered readable event.
pub fn read_completed(receiver: &mut pipe::Receiver) -> io::Result<Option<Box<Job>>> {
    let mut bytes = [0u8; std::mem::size_of::<usize>()];
    let mut read = 0;
    while read < bytes.len() {
        match receiver.read(&mut bytes[read..]) {
            Ok(0) => return Ok(None),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && read == 0 => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let ptr = usize::from_ne_bytes(bytes) as *mut Job;
    // SAFETY: `ptr` was produced by `Box::into_raw` in `post_completion` and
    // is read back exactly once.
    Ok(Some(unsafe { Box::from_raw(ptr) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashingEmbedder;

    #[test]
    fn submit_and_read_completed_round_trips_a_job() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(16));
        let (pool, mut receiver) = WorkerPool::new(1, 4, embedder).unwrap();

        let job = Job::new(JobKind::Query, 7, 1, "hello world".into(), "hello world".into());
        pool.submit(job).unwrap();

        let completed = loop {
            match read_completed(&mut receiver).unwrap() {
                Some(job) => break job,
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        assert!(completed.success);
        assert_eq!(completed.fd, 7);
        assert_eq!(completed.result_vector.unwrap().len(), 16);

        pool.shutdown();
    }

    #[test]
    fn submit_rejects_once_queue_is_saturated() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(8));
        // Zero workers: nothing ever drains the queue, so the second
        // submission past capacity must be rejected.
        let (pool, _receiver) = WorkerPool::new(0, 1, embedder).unwrap();

        pool.submit(Job::new(JobKind::Set, 1, 1, "a".into(), "a".into())).unwrap();
        let second = pool.submit(Job::new(JobKind::Set, 1, 1, "b".into(), "b".into()));
        assert!(matches!(second, Err(VecsError::QueueFull)));

        pool.shutdown();
    }
}
