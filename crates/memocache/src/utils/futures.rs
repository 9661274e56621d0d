use tokio::task::JoinHandle;

/// Aborts a spawned background task when dropped.
///
/// Background tasks owned by a handle like this never keep a runtime from shutting down, and
/// stop as soon as their owner goes away.
#[derive(Debug)]
pub struct CancelOnDrop {
    handle: JoinHandle<()>,
}

impl CancelOnDrop {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
