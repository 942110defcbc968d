use tokio::task::JoinHandle;

// Wrapper for a task that gets aborted once its owner goes out of scope.
#[derive(Debug)]
pub(crate) struct DroppableHandle<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
