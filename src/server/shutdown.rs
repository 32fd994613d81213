use std::future::Future;
use tokio::sync::oneshot;

/// Stops the RPC server when dropped. The replica owns it, so the server lives exactly as long as
/// the driver does.
pub(crate) struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

/// The future completes once the handle is dropped.
pub(crate) fn shutdown_signal() -> (RpcServerShutdownHandle, impl Future<Output = ()>) {
    let (tx, rx) = oneshot::channel::<()>();

    (RpcServerShutdownHandle { _tx: tx }, async move {
        // Err just means the handle was dropped, which is the signal.
        let _ = rx.await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_fires_when_handle_drops() {
        let (handle, signal) = shutdown_signal();
        let waiter = tokio::spawn(signal);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
