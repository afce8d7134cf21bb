//! Speculative-decoding sampler interface and a host-side simulator.
//!
//! The collector never owns the accumulators it reports: they belong to the
//! sampler, which updates accepted/emitted counts on the device as part of
//! its verification kernels and keeps the drafted-token count on the host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::backend::host::HostBackend;
use crate::backend::{DeviceBackend, DeviceCounter, DeviceStream};
use crate::error::{MetricsError, Result};

/// Read-only view of a sampler's acceptance accumulators.
pub trait SpecDecodeSampler: Send + Sync {
    /// Total draft tokens accepted by verification (device-resident).
    fn num_accepted_tokens(&self) -> &DeviceCounter;

    /// Total tokens emitted, accepted plus bonus/recovered (device-resident).
    fn num_emitted_tokens(&self) -> &DeviceCounter;

    /// Total tokens proposed by the draft model (host-resident).
    fn num_draft_tokens(&self) -> u64;

    /// Stream the accumulators are updated on, when it is not the backend's
    /// current stream. Metric copies are ordered after it.
    fn compute_stream(&self) -> Option<&DeviceStream> {
        None
    }
}

/// Simple XorShift64 RNG to avoid adding the `rand` crate dependency.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Create a new RNG from a seed. Seed of 0 is adjusted to 1.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate the next u64 value.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generate a random f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Outcome of one simulated verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepOutcome {
    pub accepted: u64,
    pub emitted: u64,
    pub drafted: u64,
}

/// Sampler stand-in whose device counters live on a [`HostBackend`].
///
/// Accepted/emitted updates are enqueued on the compute stream, exactly where
/// a real verification kernel would update them, so they race with metric
/// copies the same way device work does.
pub struct SimulatedSampler {
    backend: Arc<HostBackend>,
    rank: usize,
    accept_prob: f64,
    accepted: DeviceCounter,
    emitted: DeviceCounter,
    drafted: AtomicU64,
    rng: Mutex<XorShiftRng>,
    stream: Option<DeviceStream>,
}

impl SimulatedSampler {
    /// Create a sampler on `rank` that accepts each draft token
    /// independently with probability `accept_prob`.
    pub fn new(backend: Arc<HostBackend>, rank: usize, accept_prob: f64, seed: u64) -> Result<Self> {
        if !(0.0..=1.0).contains(&accept_prob) {
            return Err(MetricsError::InvalidConfig(format!(
                "accept_prob must be in [0, 1], got {}",
                accept_prob
            )));
        }
        let accepted = backend.alloc_counter(rank)?;
        let emitted = backend.alloc_counter(rank)?;
        Ok(Self {
            backend,
            rank,
            accept_prob,
            accepted,
            emitted,
            drafted: AtomicU64::new(0),
            rng: Mutex::new(XorShiftRng::new(seed)),
            stream: None,
        })
    }

    /// Issue counter updates on `stream` instead of the compute stream.
    pub fn on_stream(mut self, stream: DeviceStream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Record an explicit outcome: enqueue the device-side updates on the
    /// compute stream and bump the host-side draft count immediately.
    pub fn record(&self, outcome: StepOutcome) -> Result<()> {
        let compute;
        let stream = match &self.stream {
            Some(stream) => stream,
            None => {
                compute = self.backend.current_stream(self.rank)?;
                &compute
            }
        };
        self.backend
            .add_async(&self.accepted, outcome.accepted as i64, stream)?;
        self.backend
            .add_async(&self.emitted, outcome.emitted as i64, stream)?;
        self.drafted.fetch_add(outcome.drafted, Ordering::SeqCst);
        trace!(
            accepted = outcome.accepted,
            emitted = outcome.emitted,
            drafted = outcome.drafted,
            "Recorded sampler step"
        );
        Ok(())
    }

    /// Simulate verifying `batch_size` sequences with `k` draft tokens each.
    ///
    /// Each sequence accepts a prefix of its draft (a rejection ends the
    /// prefix) and always emits one more token than it accepted.
    pub fn step(&self, batch_size: usize, k: usize) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::default();
        {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            for _ in 0..batch_size {
                let mut accepted = 0u64;
                while (accepted as usize) < k && rng.next_f64() < self.accept_prob {
                    accepted += 1;
                }
                outcome.accepted += accepted;
                outcome.emitted += accepted + 1;
                outcome.drafted += k as u64;
            }
        }
        self.record(outcome)?;
        Ok(outcome)
    }

    /// Set the host-side draft count directly.
    pub fn set_draft_tokens(&self, drafted: u64) {
        self.drafted.store(drafted, Ordering::SeqCst);
    }
}

impl SpecDecodeSampler for SimulatedSampler {
    fn num_accepted_tokens(&self) -> &DeviceCounter {
        &self.accepted
    }

    fn num_emitted_tokens(&self) -> &DeviceCounter {
        &self.emitted
    }

    fn num_draft_tokens(&self) -> u64 {
        self.drafted.load(Ordering::SeqCst)
    }

    fn compute_stream(&self) -> Option<&DeviceStream> {
        self.stream.as_ref()
    }
}
