use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessengerError {
    /// The controller task has exited; the handle is no longer usable.
    #[error("Messenger controller stopped")]
    ControllerStopped,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MessengerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MessengerError::ControllerStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MessengerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MessengerError::ControllerStopped
    }
}
