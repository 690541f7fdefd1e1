use crate::error::Result;
use rayon::prelude::*;
use tracing::trace;

/// Runs `work` over `items` on a dedicated pool of at most `workers` threads.
///
/// The pool lives only for this call, so returning is a full barrier: every item
/// has finished before the caller sees any result. Results come back in the order
/// of `items`, whatever order the workers finish in.
///
/// # Errors
///
/// Returns an error if the thread pool cannot be created.
pub(crate) fn run_ordered<T, R, F>(label: &str, workers: usize, items: Vec<T>, work: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Send + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let threads = workers.clamp(1, items.len());
    let name = label.to_string();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{name}-{i}"))
        .build()?;

    trace!("{}: {} items on {} threads", label, items.len(), threads);

    Ok(pool.install(|| {
        items
            .into_par_iter()
            .enumerate()
            .map(|(index, item)| work(index, item))
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_results_keep_submission_order() {
        let items: Vec<u64> = (0..20).collect();
        let results = run_ordered("test", 4, items, |index, item| {
            // later items finish first
            thread::sleep(Duration::from_millis(20 - item));
            (index, item * 10)
        })
        .unwrap();

        for (slot, (index, value)) in results.into_iter().enumerate() {
            assert_eq!(slot, index);
            assert_eq!(value, slot as u64 * 10);
        }
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        run_ordered("bounded", 3, (0..12).collect::<Vec<_>>(), |_, _| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_nested_pools_bound_each_inner_fan_out() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = run_ordered("outer", 2, vec![0_usize, 1], |_, outer| {
            run_ordered("inner", 2, (0..6).collect::<Vec<usize>>(), |_, inner| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                outer * 10 + inner
            })
            .unwrap()
        })
        .unwrap();

        // two outer workers, each with its own inner pool of two
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(results[1], vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_empty_input() {
        let results: Vec<()> = run_ordered("empty", 4, Vec::<u8>::new(), |_, _| ()).unwrap();
        assert!(results.is_empty());
    }
}
