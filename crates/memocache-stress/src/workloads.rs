use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use memocache::{MemoError, MemoOptions, Memoized, Memoizer, PolicyValue};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    /// Memoizers sharing one backing store, each standing in for a process.
    #[serde(default = "default_processes")]
    pub processes: usize,
    pub workloads: Vec<Workload>,
}

fn default_processes() -> usize {
    1
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

/// How a workload picks the arguments of its calls.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Every key is equally likely.
    Uniform(Producer),
    /// Low keys are requested much more often than high ones.
    Skewed(Producer),
}

impl Payload {
    fn producer(&self) -> &Producer {
        match self {
            Payload::Uniform(producer) | Payload::Skewed(producer) => producer,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Producer {
    /// The number of distinct arguments.
    pub keys: u64,
    /// How long a single computation takes.
    #[serde(with = "humantime_serde", default)]
    pub delay: Duration,
    pub ttl: Option<PolicyValue>,
    pub mru: Option<PolicyValue>,
}

/// A workload bound to one memoized producer per process.
pub struct ParsedPayload {
    skewed: bool,
    keys: u64,
    memos: Vec<Memoized<u64, u64, String>>,
    pub computations: Arc<AtomicUsize>,
}

pub fn prepare_payload(name: &str, memoizers: &[Memoizer], payload: Payload) -> ParsedPayload {
    let producer = payload.producer();
    let computations = Arc::new(AtomicUsize::new(0));

    let memos = memoizers
        .iter()
        .map(|memoizer| {
            let mut options = MemoOptions::new();
            if let Some(ttl) = &producer.ttl {
                options = options.ttl(ttl.clone());
            }
            if let Some(mru) = &producer.mru {
                options = options.mru(mru.clone());
            }

            let delay = producer.delay;
            let computations = Arc::clone(&computations);
            memoizer.memoize(
                name,
                move |key: u64| {
                    let computations = Arc::clone(&computations);
                    async move {
                        tokio::time::sleep(delay).await;
                        computations.fetch_add(1, Ordering::Relaxed);
                        Ok::<_, String>(key)
                    }
                },
                options,
            )
        })
        .collect();

    ParsedPayload {
        skewed: matches!(payload, Payload::Skewed(_)),
        keys: producer.keys.max(1),
        memos,
        computations,
    }
}

impl ParsedPayload {
    fn pick(&self) -> (usize, u64) {
        let process = rand::random_range(0..self.memos.len());
        let key = if self.skewed {
            let x: f64 = rand::random();
            (x.powi(3) * self.keys as f64) as u64
        } else {
            rand::random_range(0..self.keys)
        };
        (process, key.min(self.keys - 1))
    }
}

pub async fn process_payload(workload: &ParsedPayload) -> Result<(), MemoError<String>> {
    let (process, key) = workload.pick();
    let value = workload.memos[process].call(key).await?;
    debug_assert_eq!(value, key);
    Ok(())
}
