//! Bounded worker pool for independent file-level jobs
//!
//! Jobs are fed through a crossbeam channel to at most
//! [`OpContext::worker_count`] scoped threads. Cancellation is checked
//! between jobs, never inside one. The first fatal error cancels the
//! remaining jobs.

use crossbeam_channel::unbounded;

use crate::context::OpContext;
use crate::error::{Error, Result};

/// Run `job` over every item and return the results in input order.
pub fn run_bounded<T, R, F>(ctx: &OpContext, items: Vec<T>, job: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = ctx.worker_count(total);

    let (job_tx, job_rx) = unbounded::<(usize, T)>();
    let (out_tx, out_rx) = unbounded::<(usize, Result<R>)>();
    for pair in items.into_iter().enumerate() {
        // The receiver is alive until the scope below ends
        let _ = job_tx.send(pair);
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let job = &job;
            scope.spawn(move || {
                for (idx, item) in job_rx.iter() {
                    if ctx.cancel.is_cancelled() {
                        let _ = out_tx.send((idx, Err(Error::Cancelled)));
                        continue;
                    }
                    let result = job(item);
                    if result.is_err() {
                        ctx.cancel.cancel();
                    }
                    let _ = out_tx.send((idx, result));
                }
            });
        }
    });
    drop(out_tx);

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    let mut first_error: Option<Error> = None;
    for (idx, result) in out_rx.iter() {
        match result {
            Ok(value) => slots[idx] = Some(value),
            // Prefer the root cause over the cancellations it triggered
            Err(Error::Cancelled) => {
                if first_error.is_none() {
                    first_error = Some(Error::Cancelled);
                }
            }
            Err(e) => {
                if matches!(first_error, None | Some(Error::Cancelled)) {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    slots
        .into_iter()
        .map(|slot| slot.ok_or(Error::Cancelled))
        .collect()
}
