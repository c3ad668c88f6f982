use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::channel::mpsc;
use futures::channel::oneshot as ones;
use futures::executor::block_on;
use futures::lock::Mutex;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use smart_default::SmartDefault;
use tracing::{debug, trace, warn};

use super::trie::Trie;
use super::{Aggregate, Backend, Error, Result};

#[derive(Clone, Copy, Debug, SmartDefault)]
pub struct SchedParams {
    #[default(usize::MAX)]
    pub max_batch: usize,

    #[default(Duration::ZERO)]
    pub linger: Duration,

    #[default = 256]
    pub queue_depth: usize,
}

impl SchedParams {
    /// Upper bound on requests per dispatched batch (min 1).
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// How long the dispatcher waits for company after the first request.
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Requests buffered beyond the one in hand before callers wait to
    /// enqueue.
    pub fn queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }
}

struct Request {
    dist: Vec<f64>,
    tx: ones::Sender<Result<Vec<f64>>>,
}

/// Coalesces concurrent single-distribution requests into batched
/// aggregator calls.
///
/// A single dispatcher thread owns the receiving end of the request queue,
/// so at most one batch is in flight at any time.
pub struct Scheduler {
    queue: Mutex<mpsc::Sender<Request>>, // one sender, so the bound holds for all callers
    agg: Arc<dyn Aggregate>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn from_vocabulary<I, B>(vocab: I, backend: Backend, params: SchedParams) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let trie = Arc::new(Trie::build(vocab)?);
        Ok(Self::new(backend.aggregator(trie)?, params))
    }

    pub fn new(agg: Arc<dyn Aggregate>, params: SchedParams) -> Self {
        let (queue, rx) = mpsc::channel(params.queue_depth);
        let inner = Dispatcher { agg: agg.clone(), queue: rx, params };

        let worker = thread::Builder::new()
            .name("mass-dispatch".to_owned())
            .spawn(move || inner.run())
            .ok();

        if worker.is_none() {
            warn!("failed to spawn dispatcher; requests will fail");
        }

        Self {
            queue: Mutex::new(queue),
            agg,
            worker,
        }
    }

    pub fn trie(&self) -> &Trie {
        self.agg.trie()
    }

    /// Mass vector for one distribution, computed as part of whatever batch
    /// the dispatcher assembles next.
    ///
    /// A distribution of the wrong length fails only this call and never
    /// reaches a batch. Dropping the returned future before dispatch
    /// withdraws the request.
    pub async fn mass_sum(&self, dist: Vec<f64>) -> Result<Vec<f64>> {
        let want = self.trie().vocab_size();

        if dist.len() != want {
            return Err(Error::Dimension { want, got: dist.len() });
        }

        let (tx, rx) = ones::channel();

        {
            let mut queue = self.queue.lock().await;

            queue
                .send(Request { dist, tx })
                .await
                .map_err(|_| Error::Shutdown)?;
        }

        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stop accepting requests, serve the ones already queued and wait for
    /// the dispatcher to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.queue.get_mut().close_channel();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("dispatcher exited by panic");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

struct Dispatcher {
    agg: Arc<dyn Aggregate>,
    queue: mpsc::Receiver<Request>,
    params: SchedParams,
}

impl Dispatcher {
    fn run(mut self) {
        while let Some(first) = block_on(self.queue.next()) {
            if !self.params.linger.is_zero() {
                thread::sleep(self.params.linger);
            }

            let mut pending = vec![first];

            // take whatever else is queued right now
            while pending.len() < self.params.max_batch {
                match self.queue.try_next() {
                    Ok(Some(req)) => pending.push(req),
                    _ => break,
                }
            }

            dispatch(&*self.agg, pending);
        }

        debug!("request queue closed; dispatcher exiting");
    }
}

/// Run one batch and resolve every waiter in it exactly once.
fn dispatch(agg: &dyn Aggregate, pending: Vec<Request>) {
    let n_pending = pending.len();

    let (batch, waiters): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .filter(|r| !r.tx.is_canceled())
        .map(|r| (r.dist, r.tx))
        .unzip();

    if batch.len() < n_pending {
        debug!(abandoned = n_pending - batch.len(), "skipping abandoned requests");
    }

    if batch.is_empty() {
        return;
    }

    trace!(size = batch.len(), "dispatching batch");

    let out = panic::catch_unwind(AssertUnwindSafe(|| agg.batch_mass_sum(&batch)))
        .unwrap_or_else(|p| Err(Error::Panic(panic_message(p))))
        .and_then(|out| {
            if out.len() == batch.len() {
                Ok(out)
            } else {
                Err(Error::RowCount { want: batch.len(), got: out.len() })
            }
        });

    match out {
        Ok(masses) => {
            for (tx, mass) in iter::zip(waiters, masses) {
                let _ = tx.send(Ok(mass));
            }
        }

        Err(e) => {
            warn!(size = batch.len(), error = %e, "batch failed");

            let e = Error::Dispatch { size: batch.len(), source: Arc::new(e) };

            for tx in waiters {
                let _ = tx.send(Err(e.clone()));
            }
        }
    }
}

fn panic_message(p: Box<dyn std::any::Any + Send>) -> String {
    match p.downcast::<String>() {
        Ok(s) => *s,
        Err(p) => p
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown".to_owned(), |s| (*s).to_owned()),
    }
}
