use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Run `f` over `items` on `concurrency` workers and return the results in
/// input order.
///
/// Items are fed through a bounded channel that the workers share; closing
/// the sender tells them there is no more work. With `concurrency == 1`
/// items are processed strictly one after another. A panicking worker
/// propagates its panic to the caller.
pub async fn parallel_process<T, R, F, Fut>(items: Vec<T>, concurrency: usize, f: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = concurrency.clamp(1, total);
    let (tx, rx) = mpsc::channel::<(usize, T)>(workers);
    let rx = Arc::new(Mutex::new(rx));
    let f = Arc::new(f);

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let rx = Arc::clone(&rx);
        let f = Arc::clone(&f);
        set.spawn(async move {
            let mut done = Vec::new();
            loop {
                let next = rx.lock().await.recv().await;
                let Some((index, item)) = next else { break };
                done.push((index, f(item).await));
            }
            done
        });
    }

    for entry in items.into_iter().enumerate() {
        if tx.send(entry).await.is_err() {
            // Every worker is gone; the join below reports why.
            break;
        }
    }
    drop(tx);

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(done) => {
                for (index, result) in done {
                    slots[index] = Some(result);
                }
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => tracing::error!(error = %e, "Worker task cancelled"),
        }
    }
    slots.into_iter().flatten().collect()
}
