use std::time::Duration;

/// Sleep for `delay`, or forever when there is none.
///
/// Meant to be used as a `tokio::select!` branch for optional limits.
pub async fn deadline(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await
    } else {
        futures::future::pending().await
    };
}
