use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Single-consumer task chain. Each task starts only after its predecessor
/// has settled, so side effects come out in enqueue order no matter how the
/// work inside each task overlaps beforehand.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl SerialQueue {
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
            }
        });
        (Self { tx }, worker)
    }

    /// Append a task. Tasks are responsible for reporting their own faults;
    /// a failed task never stalls the chain.
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(Box::pin(task));
    }
}
