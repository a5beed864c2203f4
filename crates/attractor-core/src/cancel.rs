use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Sleep that a tripped cancellation token cuts short. Returns `true` when
/// the full duration elapsed, `false` when the token woke it.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test(flavor = "current_thread")]
    async fn sleep_cancellable_token_trips_expected_early_wake() {
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trip.cancel();
        });

        let started = Instant::now();
        let completed = sleep_cancellable(Duration::from_secs(30), &cancel).await;
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sleep_cancellable_untripped_expected_full_duration() {
        let cancel = CancellationToken::new();
        let completed = sleep_cancellable(Duration::from_millis(5), &cancel).await;
        assert!(completed);
    }
}
