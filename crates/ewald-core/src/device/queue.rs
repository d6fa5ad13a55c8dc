//! In-order execution queues backed by a worker thread.
//!
//! Commands submitted to one queue run strictly in submission order. Ordering between two
//! queues is established only through [`Marker`]s: `record_marker` on the producing queue and
//! `wait_for` on the consuming queue.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::domain::{EwaldError, EwaldResult};

type Kernel = Box<dyn FnOnce() -> EwaldResult<()> + Send + 'static>;

enum Command {
    Kernel { name: &'static str, body: Kernel },
    Record(Marker),
    Wait(Marker),
    Flush(Sender<()>),
}

#[derive(Debug, Default)]
struct MarkerState {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

/// Completion event recorded on a queue.
#[derive(Debug, Clone, Default)]
pub struct Marker {
    state: Arc<MarkerState>,
}

impl Marker {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self) {
        let mut signalled = self.state.signalled.lock();
        *signalled = true;
        self.state.condvar.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.state.signalled.lock()
    }

    pub fn wait(&self) {
        let mut signalled = self.state.signalled.lock();
        while !*signalled {
            self.state.condvar.wait(&mut signalled);
        }
    }
}

pub struct ExecutionQueue {
    name: String,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<EwaldError>>>,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ExecutionQueue {
    pub fn spawn(name: impl Into<String>) -> EwaldResult<Self> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Command>();
        let failure = Arc::new(Mutex::new(None::<EwaldError>));
        let worker_failure = Arc::clone(&failure);
        let worker_name = name.clone();

        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for command in receiver {
                    match command {
                        Command::Kernel { name, body } => {
                            if worker_failure.lock().is_some() {
                                debug!(
                                    queue = %worker_name,
                                    kernel = name,
                                    "skipping kernel after failure"
                                );
                                continue;
                            }
                            if let Err(error) = body() {
                                warn!(queue = %worker_name, kernel = name, %error, "kernel failed");
                                *worker_failure.lock() = Some(error);
                            }
                        }
                        Command::Record(marker) => marker.signal(),
                        Command::Wait(marker) => marker.wait(),
                        Command::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|error| {
                EwaldError::device(
                    "QUEUE.SPAWN",
                    format!("failed to start execution queue '{name}': {error}"),
                )
            })?;

        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            failure,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, command: Command) {
        if let Some(sender) = &self.sender {
            if sender.send(command).is_err() {
                *self.failure.lock() = Some(EwaldError::device(
                    "QUEUE.DISCONNECTED",
                    format!("execution queue '{}' stopped accepting work", self.name),
                ));
            }
        }
    }

    pub fn enqueue<F>(&self, name: &'static str, kernel: F)
    where
        F: FnOnce() -> EwaldResult<()> + Send + 'static,
    {
        self.submit(Command::Kernel {
            name,
            body: Box::new(kernel),
        });
    }

    /// Records a marker that signals once every previously enqueued command has run.
    pub fn record_marker(&self) -> Marker {
        let marker = Marker::new();
        self.submit(Command::Record(marker.clone()));
        marker
    }

    /// Makes every later command on this queue wait for `marker`. The host is not blocked.
    pub fn wait_for(&self, marker: &Marker) {
        self.submit(Command::Wait(marker.clone()));
    }

    /// Blocks the host until the queue drains and reports the first kernel failure, if any.
    pub fn finish(&self) -> EwaldResult<()> {
        let (done_sender, done_receiver) = bounded(1);
        self.submit(Command::Flush(done_sender));
        if done_receiver.recv().is_err() {
            return Err(EwaldError::device(
                "QUEUE.DISCONNECTED",
                format!("execution queue '{}' terminated", self.name),
            ));
        }

        match self.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{ExecutionQueue, Marker};
    use crate::domain::EwaldError;

    #[test]
    fn kernels_run_in_submission_order() {
        let queue = ExecutionQueue::spawn("primary").expect("queue should start");
        let log = Arc::new(Mutex::new(Vec::new()));
        for step in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue("append", move || {
                log.lock().push(step);
                Ok(())
            });
        }

        queue.finish().expect("queue should drain");
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn barrier_orders_work_across_queues() {
        let producer = ExecutionQueue::spawn("producer").expect("queue should start");
        let consumer = ExecutionQueue::spawn("consumer").expect("queue should start");
        let value = Arc::new(AtomicUsize::new(0));

        let gate = Marker::new();
        let gate_for_kernel = gate.clone();
        producer.enqueue("gate", move || {
            gate_for_kernel.wait();
            Ok(())
        });
        let written = Arc::clone(&value);
        producer.enqueue("write", move || {
            std::thread::sleep(Duration::from_millis(10));
            written.store(7, Ordering::SeqCst);
            Ok(())
        });
        let ready = producer.record_marker();
        consumer.wait_for(&ready);

        let observed = Arc::new(AtomicUsize::new(0));
        let read = Arc::clone(&value);
        let sink = Arc::clone(&observed);
        consumer.enqueue("read", move || {
            sink.store(read.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        });

        assert!(!ready.is_signalled());
        gate.signal();
        consumer.finish().expect("consumer should drain");
        producer.finish().expect("producer should drain");
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn finish_reports_first_failure_and_skips_the_rest() {
        let queue = ExecutionQueue::spawn("failing").expect("queue should start");
        let ran = Arc::new(AtomicUsize::new(0));
        queue.enqueue("fail", || Err(EwaldError::device("TEST.FAIL", "first")));
        queue.enqueue("fail-again", || Err(EwaldError::device("TEST.FAIL", "second")));
        let counter = Arc::clone(&ran);
        queue.enqueue("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let error = queue.finish().expect_err("failure should surface");
        assert_eq!(error.message(), "first");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        queue.finish().expect("failure is reported once");
    }
}
