use tokio::sync::watch;

/// Resolve once the shutdown flag is set
///
/// A dropped sender is not a shutdown signal; the future then never resolves so
/// `select!` loops do not spin.
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
