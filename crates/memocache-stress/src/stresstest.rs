use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use memocache::Memoizer;
use memocache::config::Config;

use crate::workloads::{WorkloadsConfig, prepare_payload, process_payload};

struct Outcome {
    concurrency: usize,
    durations: DDSketch,
    errors: usize,
    computations: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let backing = config
        .memo
        .backing
        .as_ref()
        .map(|backing| backing.factory())
        .transpose()
        .context("failed to create backing store")?;
    let memoizers: Vec<_> = (0..workloads.processes.max(1))
        .map(|_| Memoizer::with_backing(config.memo.clone(), backing.clone()))
        .collect();

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let payload = prepare_payload(&format!("workload-{i}"), &memoizers, workload.payload);
            (workload.concurrency.max(1), Arc::new(payload))
        })
        .collect();

    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if let Err(e) = process_payload(&workload).await {
                                tracing::warn!(error = %e, "Memoized call failed");
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations = std::mem::take(
                &mut *task_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            Outcome {
                concurrency,
                durations,
                errors: errors.load(Ordering::Relaxed),
                computations: workload.computations.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let Outcome {
            concurrency,
            durations,
            errors,
            computations,
        } = task.context("workload panicked")?;

        let ops = durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, \
             {computations} computations, {errors} errors"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
