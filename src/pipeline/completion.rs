//! Where request callbacks run
//!
//! Workers never call a requester's callback directly unless asked to. The
//! requester picks a `CompletionContext`, and the finished result is posted
//! there:
//! - `Inline` runs the callback on the worker thread that finished the job
//! - `Runtime` spawns it onto a tokio runtime
//! - `Mailbox` queues it for a UI loop to drain on its own thread

use tokio::sync::mpsc;

/// A posted callback
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Default)]
pub enum CompletionContext {
    /// Run on the completing worker thread
    #[default]
    Inline,
    /// Run as a task on this runtime
    Runtime(tokio::runtime::Handle),
    /// Run when the owning loop drains its `MailboxReceiver`
    Mailbox(Mailbox),
}

impl CompletionContext {
    pub fn post(&self, task: Task) {
        match self {
            CompletionContext::Inline => task(),
            CompletionContext::Runtime(handle) => {
                handle.spawn(async move { task() });
            }
            CompletionContext::Mailbox(mailbox) => mailbox.post(task),
        }
    }
}

impl std::fmt::Debug for CompletionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionContext::Inline => f.write_str("Inline"),
            CompletionContext::Runtime(_) => f.write_str("Runtime"),
            CompletionContext::Mailbox(_) => f.write_str("Mailbox"),
        }
    }
}

/// Sending half, cloned into every request that should complete on the
/// owning thread
#[derive(Clone)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Task>,
}

impl Mailbox {
    fn post(&self, task: Task) {
        // Owner is gone; still honor the exactly-once contract
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            task();
        }
    }
}

/// Receiving half, owned by the UI loop
pub struct MailboxReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
}

/// Create a connected mailbox pair
pub fn mailbox() -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Mailbox { tx }, MailboxReceiver { rx })
}

impl MailboxReceiver {
    /// Run every callback posted so far without waiting. Returns how many ran.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait for the next callback and run it.
    /// Returns `false` once every `Mailbox` has been dropped.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Blocking form of `run_next`. Must not be called from async code.
    pub fn blocking_run_next(&mut self) -> bool {
        match self.rx.blocking_recv() {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MailboxReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxReceiver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_mailbox_runs_on_drain() {
        let (mailbox, mut receiver) = mailbox();
        let context = CompletionContext::Mailbox(mailbox);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            context.post(Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(receiver.drain(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dropped_receiver_runs_inline() {
        let (mailbox, receiver) = mailbox();
        drop(receiver);
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        CompletionContext::Mailbox(mailbox).post(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_context() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let context = CompletionContext::Runtime(tokio::runtime::Handle::current());
        context.post(Box::new(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        }));
        assert!(rx.await.is_ok());
    }
}
