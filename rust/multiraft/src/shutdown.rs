//! Stop-signal helper shared by the long-running tasks.

use tokio::sync::watch;

/// Resolves once the flag is set or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pending_until_flag_is_set() {
        let (tx, mut rx) = watch::channel(false);
        let waited = tokio::time::timeout(Duration::from_millis(50), stopped(&mut rx)).await;
        assert!(waited.is_err());

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_select_loop_does_not_hold_the_flag() {
        let (tx, mut rx) = watch::channel(false);
        let (work_tx, mut work_rx) = tokio::sync::mpsc::channel::<u32>(1);
        let task = tokio::spawn(async move {
            let mut seen = 0;
            loop {
                tokio::select! {
                    _ = stopped(&mut rx) => break,
                    Some(n) = work_rx.recv() => seen += n,
                }
            }
            seen
        });

        work_tx.send(1).await.unwrap();
        work_tx.send(2).await.unwrap();
        // Writers must not block on a reader parked inside the loop.
        tokio::time::timeout(Duration::from_secs(1), async {
            tx.send_replace(true);
        })
        .await
        .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(seen <= 3);
    }
}
