// ABOUTME: Dedicated I/O thread owning one backend's state and running its tasks in submission order.
// ABOUTME: Callers submit closures and await their results over a oneshot channel.

use std::sync::{Mutex, mpsc};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::contract::StorageError;

type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum WorkerCommand<S> {
    Run(Task<S>),
    Shutdown,
}

/// A single-consumer queue in front of state `S`. The state is created on
/// the worker thread and never leaves it.
pub(crate) struct Worker<S> {
    name: String,
    sender: mpsc::Sender<WorkerCommand<S>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> Worker<S> {
    /// Spawn the thread and build the state with `init`. Returns once `init`
    /// has finished so initialization errors reach the caller.
    pub(crate) fn spawn<F>(name: &str, init: F) -> Result<Self, StorageError>
    where
        F: FnOnce() -> Result<S, StorageError> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<WorkerCommand<S>>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StorageError>>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut state = match init() {
                    Ok(state) => state,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    tracing::error!("{} initialization receiver dropped", thread_name);
                    return;
                }

                while let Ok(command) = receiver.recv() {
                    match command {
                        WorkerCommand::Run(task) => task(&mut state),
                        WorkerCommand::Shutdown => break,
                    }
                }
                tracing::debug!("{} worker stopped", thread_name);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                name: name.to_string(),
                sender,
                handle: Mutex::new(Some(handle)),
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(StorageError::Initialization(format!(
                    "{} worker exited during initialization",
                    name
                )))
            }
        }
    }

    /// Run `f` on the worker thread after every previously submitted task.
    pub(crate) async fn run<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task<S> = Box::new(move |state| {
            // The caller may have stopped waiting; the work is done either way.
            let _ = tx.send(f(state));
        });
        self.sender
            .send(WorkerCommand::Run(task))
            .map_err(|_| StorageError::WorkerClosed)?;
        rx.await.map_err(|_| StorageError::WorkerClosed)
    }
}

impl<S> Drop for Worker<S> {
    fn drop(&mut self) {
        let mut guard = match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if self.sender.send(WorkerCommand::Shutdown).is_err() {
                tracing::debug!("{} worker already stopped", self.name);
            }
            if handle.join().is_err() {
                tracing::error!("{} worker panicked", self.name);
            }
        }
    }
}
