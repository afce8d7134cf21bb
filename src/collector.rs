//! Asynchronous speculative-decoding metrics collector.
//!
//! Copies the sampler's device-resident acceptance counters to host mirrors
//! without stalling the decode loop:
//!
//! ```text
//! poll(k) #N     gate open  -> copy_stream.wait(compute); copy x2; record event
//!                              return None
//! poll(k) #N+1   in flight  -> synchronize(event); read mirrors
//!                              return Some(metrics)
//! ```
//!
//! The event is consumed one decode step after it was recorded, so the copy
//! has had a whole step of device time to finish and the synchronization is
//! normally free.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{DeviceBackend, DeviceEvent, DeviceStream, DeviceType, HostMirror};
use crate::clock::{Clock, SystemClock};
use crate::config::CollectorConfig;
use crate::error::{MetricsError, Result};
use crate::metrics::SpecDecodeMetrics;
use crate::sampler::SpecDecodeSampler;

/// Rate-limited, non-blocking collector of speculative-decoding metrics.
///
/// Not device-bound until [`initialize`](Self::initialize) (or
/// [`init_tensors`](Self::init_tensors)) creates the copy stream; a copy
/// attempted before that is a caller bug and panics.
pub struct AsyncMetricsCollector {
    sampler: Arc<dyn SpecDecodeSampler>,
    backend: Arc<dyn DeviceBackend>,
    clock: Arc<dyn Clock>,
    collect_interval_s: f64,

    rank: Option<usize>,
    copy_stream: Option<DeviceStream>,
    in_flight_copy: Option<DeviceEvent>,

    accepted_tokens: HostMirror,
    emitted_tokens: HostMirror,
    draft_tokens: u64,

    last_collect_time: f64,
}

impl AsyncMetricsCollector {
    /// Create a collector reading wall-clock time.
    pub fn new(
        sampler: Arc<dyn SpecDecodeSampler>,
        backend: Arc<dyn DeviceBackend>,
        config: &CollectorConfig,
    ) -> Result<Self> {
        Self::with_clock(sampler, backend, Arc::new(SystemClock), config)
    }

    /// Create a collector with an injected clock.
    ///
    /// Binds the backend to its current device, allocates the host mirrors
    /// and starts the interval from the clock's current reading. Fails if
    /// the sampler's counters were not allocated through `backend`.
    pub fn with_clock(
        sampler: Arc<dyn SpecDecodeSampler>,
        backend: Arc<dyn DeviceBackend>,
        clock: Arc<dyn Clock>,
        config: &CollectorConfig,
    ) -> Result<Self> {
        config.validate()?;
        backend.check_counter(sampler.num_accepted_tokens())?;
        backend.check_counter(sampler.num_emitted_tokens())?;

        let device = backend.current_device()?;
        backend.set_device(device)?;

        let pin_available = backend.is_pin_memory_available();
        let pinned = match config.pin_memory {
            Some(true) if !pin_available => {
                tracing::warn!(
                    backend = backend.name(),
                    "Pinned memory requested but unavailable, using pageable mirrors"
                );
                false
            }
            Some(requested) => requested,
            None => pin_available,
        };
        let accepted_tokens = backend.alloc_host_mirror(pinned)?;
        let emitted_tokens = backend.alloc_host_mirror(pinned)?;

        let last_collect_time = clock.now();

        debug!(
            backend = backend.name(),
            device,
            pinned,
            interval_s = config.collect_interval_s,
            "Created AsyncMetricsCollector"
        );

        Ok(Self {
            sampler,
            backend,
            clock,
            collect_interval_s: config.collect_interval_s,
            rank: None,
            copy_stream: None,
            in_flight_copy: None,
            accepted_tokens,
            emitted_tokens,
            draft_tokens: 0,
            last_collect_time,
        })
    }

    /// Bind the collector to `rank` and create (or replace) its copy stream.
    pub fn initialize(&mut self, rank: usize) -> Result<()> {
        let count = self.backend.device_count()?;
        if rank >= count {
            return Err(MetricsError::InvalidRank { rank, count });
        }
        self.rank = Some(rank);
        self.copy_stream = Some(self.backend.create_stream(rank)?);
        info!(backend = self.backend.name(), rank, "Metrics copy stream initialized");
        Ok(())
    }

    /// Bind the collector to `rank`, creating the copy stream only if
    /// `device_type` is the family this collector's backend drives.
    ///
    /// For any other device type the rank is recorded but the collector
    /// stays without a copy stream.
    pub fn init_tensors(&mut self, rank: usize, device_type: DeviceType) -> Result<()> {
        if device_type == self.backend.device_type() {
            return self.initialize(rank);
        }
        self.rank = Some(rank);
        debug!(
            backend = self.backend.name(),
            requested = %device_type,
            rank,
            "Device type does not match backend, no copy stream created"
        );
        Ok(())
    }

    /// Poll once per decode step with the step's branch length `k`.
    ///
    /// Returns the metrics of the copy issued by an earlier poll, if one is
    /// in flight. Otherwise starts a new copy when the collection interval
    /// has elapsed and returns `None`.
    pub fn poll(&mut self, k: usize) -> Result<Option<SpecDecodeMetrics>> {
        if k == 0 {
            return Err(MetricsError::InvalidBranchLength(k));
        }

        if let Some(ready_event) = self.in_flight_copy.take() {
            return self.collect_metrics(k, &ready_event).map(Some);
        }

        let now = self.clock.now();
        if self.should_collect(now) {
            assert!(
                self.in_flight_copy.is_none(),
                "metrics copy issued while another is in flight"
            );
            self.in_flight_copy = Some(self.copy_metrics_async()?);
            self.last_collect_time = now;
        }

        Ok(None)
    }

    fn should_collect(&self, now: f64) -> bool {
        now - self.last_collect_time >= self.collect_interval_s
    }

    /// Snapshot the sampler's counters into the host mirrors.
    ///
    /// Returns the event recorded on the copy stream behind both copies.
    fn copy_metrics_async(&mut self) -> Result<DeviceEvent> {
        let Some(copy_stream) = self.copy_stream.as_ref() else {
            panic!("AsyncMetricsCollector: copy stream not initialized; call initialize(rank) first");
        };

        let current;
        let compute_stream = match self.sampler.compute_stream() {
            Some(stream) => stream,
            None => {
                current = self.backend.current_stream(copy_stream.rank())?;
                &current
            }
        };
        self.backend.wait_stream(copy_stream, compute_stream)?;

        self.backend.copy_to_host_async(
            &self.accepted_tokens,
            self.sampler.num_accepted_tokens(),
            copy_stream,
        )?;
        self.backend.copy_to_host_async(
            &self.emitted_tokens,
            self.sampler.num_emitted_tokens(),
            copy_stream,
        )?;
        // Drafted tokens are counted on the host; no copy needed.
        self.draft_tokens = self.sampler.num_draft_tokens();

        let ready = self.backend.record_event(copy_stream)?;
        debug!(rank = copy_stream.rank(), "Issued async metrics copy");
        Ok(ready)
    }

    fn collect_metrics(&self, k: usize, ready_event: &DeviceEvent) -> Result<SpecDecodeMetrics> {
        self.backend.synchronize_event(ready_event)?;

        let accepted = self.read_mirror(&self.accepted_tokens)?;
        let emitted = self.read_mirror(&self.emitted_tokens)?;
        let metrics = SpecDecodeMetrics::new(k, accepted, emitted, self.draft_tokens);

        debug!(%metrics, "Collected speculative decoding metrics");
        Ok(metrics)
    }

    fn read_mirror(&self, mirror: &HostMirror) -> Result<u64> {
        let value = self.backend.read_host_mirror(mirror)?;
        u64::try_from(value).map_err(|_| {
            MetricsError::device(
                self.backend.name(),
                "read_host_mirror",
                format!("negative token count {}", value),
            )
        })
    }

    /// Device rank this collector is bound to, once initialized.
    pub fn rank(&self) -> Option<usize> {
        self.rank
    }

    /// Whether a copy stream exists.
    pub fn is_initialized(&self) -> bool {
        self.copy_stream.is_some()
    }

    /// Whether a copy has been issued but not yet consumed.
    pub fn has_in_flight_copy(&self) -> bool {
        self.in_flight_copy.is_some()
    }

    /// Minimum seconds between copies.
    pub fn interval(&self) -> f64 {
        self.collect_interval_s
    }

    /// Clock reading at the last issued copy (or at construction).
    pub fn last_collect_time(&self) -> f64 {
        self.last_collect_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::backend::DeviceCounter;
    use crate::clock::ManualClock;
    use crate::sampler::{SimulatedSampler, StepOutcome};

    struct Harness {
        backend: Arc<HostBackend>,
        sampler: Arc<SimulatedSampler>,
        clock: Arc<ManualClock>,
        collector: AsyncMetricsCollector,
    }

    fn harness(interval: f64, start: f64) -> Harness {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(Arc::clone(&backend), 0, 0.5, 7).unwrap());
        let clock = Arc::new(ManualClock::new(start));
        let mut collector = AsyncMetricsCollector::with_clock(
            sampler.clone(),
            backend.clone(),
            clock.clone(),
            &CollectorConfig::default().interval(interval),
        )
        .unwrap();
        collector.initialize(0).unwrap();
        Harness {
            backend,
            sampler,
            clock,
            collector,
        }
    }

    fn outcome(accepted: u64, emitted: u64, drafted: u64) -> StepOutcome {
        StepOutcome {
            accepted,
            emitted,
            drafted,
        }
    }

    #[test]
    fn test_construction_state() {
        let h = harness(5.0, 100.0);
        assert_eq!(h.collector.rank(), Some(0));
        assert!(h.collector.is_initialized());
        assert!(!h.collector.has_in_flight_copy());
        assert_eq!(h.collector.interval(), 5.0);
        assert_eq!(h.collector.last_collect_time(), 100.0);
    }

    #[test]
    fn test_rejects_invalid_interval() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 0, 0.5, 1).unwrap());
        let result = AsyncMetricsCollector::new(
            sampler,
            backend,
            &CollectorConfig::default().interval(-1.0),
        );
        assert!(matches!(result, Err(MetricsError::InvalidConfig(_))));
    }

    #[test]
    fn test_initialize_invalid_rank() {
        let mut h = harness(5.0, 0.0);
        let err = h.collector.initialize(3).unwrap_err();
        assert!(matches!(err, MetricsError::InvalidRank { rank: 3, count: 1 }));
    }

    #[test]
    fn test_poll_rejects_zero_branch_length() {
        let mut h = harness(5.0, 0.0);
        assert!(matches!(
            h.collector.poll(0),
            Err(MetricsError::InvalidBranchLength(0))
        ));
    }

    #[test]
    fn test_interval_scenario() {
        // Constructed at t=0 with a 5s interval.
        let mut h = harness(5.0, 0.0);
        h.sampler.record(outcome(6, 9, 12)).unwrap();

        h.clock.set(0.0);
        assert_eq!(h.collector.poll(4).unwrap(), None);
        assert!(!h.collector.has_in_flight_copy());

        h.clock.set(1.0);
        assert_eq!(h.collector.poll(4).unwrap(), None);
        assert!(!h.collector.has_in_flight_copy());

        h.clock.set(6.0);
        assert_eq!(h.collector.poll(4).unwrap(), None);
        assert!(h.collector.has_in_flight_copy());
        assert_eq!(h.collector.last_collect_time(), 6.0);

        h.clock.set(6.1);
        let metrics = h.collector.poll(4).unwrap().unwrap();
        assert!(!h.collector.has_in_flight_copy());
        assert_eq!(metrics, SpecDecodeMetrics::new(4, 6, 9, 12));
    }

    #[test]
    fn test_ten_calls_two_copies() {
        // Constructed at t=0; ten polls one second apart from t=5 to t=14.
        let mut h = harness(5.0, 0.0);
        let mut issued_at = Vec::new();
        let mut returned_at = Vec::new();

        for t in 5..15 {
            h.clock.set(t as f64);
            let result = h.collector.poll(3).unwrap();
            if h.collector.has_in_flight_copy() {
                issued_at.push(t);
            }
            if result.is_some() {
                returned_at.push(t);
            }
        }

        assert_eq!(issued_at, vec![5, 10]);
        assert_eq!(returned_at, vec![6, 11]);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let mut h = harness(2.0, 10.0);
        h.clock.set(11.999);
        assert_eq!(h.collector.poll(1).unwrap(), None);
        assert!(!h.collector.has_in_flight_copy());

        h.clock.set(12.0);
        assert_eq!(h.collector.poll(1).unwrap(), None);
        assert!(h.collector.has_in_flight_copy());
    }

    #[test]
    fn test_zero_interval_alternates_issue_and_collect() {
        let mut h = harness(0.0, 0.0);
        for _ in 0..3 {
            assert_eq!(h.collector.poll(2).unwrap(), None);
            assert!(h.collector.has_in_flight_copy());
            assert!(h.collector.poll(2).unwrap().is_some());
            assert!(!h.collector.has_in_flight_copy());
        }
    }

    #[test]
    fn test_materialization_ignores_later_updates() {
        let mut h = harness(1.0, 0.0);
        h.sampler.record(outcome(2, 3, 4)).unwrap();

        h.clock.set(1.0);
        assert_eq!(h.collector.poll(4).unwrap(), None);

        // Let the copy land, then keep decoding before the next poll.
        h.backend.synchronize(0).unwrap();
        h.sampler.record(outcome(100, 100, 100)).unwrap();
        h.backend.synchronize(0).unwrap();

        let metrics = h.collector.poll(4).unwrap().unwrap();
        assert_eq!(metrics.accepted_tokens, 2);
        assert_eq!(metrics.emitted_tokens, 3);
        assert_eq!(metrics.draft_tokens, 4);
    }

    #[test]
    fn test_copy_observes_updates_queued_before_issue() {
        let mut h = harness(1.0, 0.0);
        for _ in 0..5 {
            h.sampler.record(outcome(1, 2, 3)).unwrap();
        }

        h.clock.set(1.0);
        h.collector.poll(3).unwrap();
        let metrics = h.collector.poll(3).unwrap().unwrap();
        assert_eq!(metrics.accepted_tokens, 5);
        assert_eq!(metrics.emitted_tokens, 10);
        assert_eq!(metrics.draft_tokens, 15);
    }

    #[test]
    fn test_draft_count_snapshot_at_issue_time() {
        let mut h = harness(1.0, 0.0);
        h.sampler.set_draft_tokens(8);

        h.clock.set(1.0);
        h.collector.poll(4).unwrap();
        h.sampler.set_draft_tokens(80);

        let metrics = h.collector.poll(4).unwrap().unwrap();
        assert_eq!(metrics.draft_tokens, 8);

        // The next cycle picks up the newer host value.
        h.clock.set(2.0);
        h.collector.poll(4).unwrap();
        let metrics = h.collector.poll(4).unwrap().unwrap();
        assert_eq!(metrics.draft_tokens, 80);
    }

    #[test]
    fn test_metrics_tagged_with_collecting_k() {
        let mut h = harness(1.0, 0.0);
        h.clock.set(1.0);
        h.collector.poll(2).unwrap();
        let metrics = h.collector.poll(5).unwrap().unwrap();
        assert_eq!(metrics.num_spec_tokens, 5);
    }

    #[test]
    fn test_empty_poll_does_not_touch_state() {
        let mut h = harness(5.0, 0.0);
        h.clock.set(4.0);
        for _ in 0..3 {
            assert_eq!(h.collector.poll(4).unwrap(), None);
        }
        assert_eq!(h.collector.last_collect_time(), 0.0);
        assert!(!h.collector.has_in_flight_copy());
    }

    #[test]
    fn test_interval_measured_from_issue() {
        let mut h = harness(5.0, 0.0);
        h.clock.set(5.0);
        h.collector.poll(1).unwrap(); // issue at 5
        h.clock.set(9.0);
        assert!(h.collector.poll(1).unwrap().is_some()); // consume at 9

        h.clock.set(9.5);
        assert_eq!(h.collector.poll(1).unwrap(), None);
        assert!(!h.collector.has_in_flight_copy());

        h.clock.set(10.0);
        h.collector.poll(1).unwrap();
        assert!(h.collector.has_in_flight_copy());
    }

    #[test]
    #[should_panic(expected = "copy stream not initialized")]
    fn test_poll_before_initialize_panics() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 0, 0.5, 1).unwrap());
        let clock = Arc::new(ManualClock::new(0.0));
        let mut collector = AsyncMetricsCollector::with_clock(
            sampler,
            backend,
            clock.clone(),
            &CollectorConfig::default().interval(1.0),
        )
        .unwrap();

        clock.set(2.0);
        let _ = collector.poll(4);
    }

    #[test]
    fn test_init_tensors_matching_device_type() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 0, 0.5, 1).unwrap());
        let mut collector =
            AsyncMetricsCollector::new(sampler, backend, &CollectorConfig::default()).unwrap();

        collector.init_tensors(0, DeviceType::Host).unwrap();
        assert_eq!(collector.rank(), Some(0));
        assert!(collector.is_initialized());
    }

    #[test]
    fn test_init_tensors_other_device_type_skips_stream() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 0, 0.5, 1).unwrap());
        let mut collector =
            AsyncMetricsCollector::new(sampler, backend, &CollectorConfig::default()).unwrap();

        collector.init_tensors(0, DeviceType::Cuda).unwrap();
        assert_eq!(collector.rank(), Some(0));
        assert!(!collector.is_initialized());
    }

    #[test]
    fn test_reinitialize_replaces_stream() {
        let backend = Arc::new(HostBackend::with_devices(2));
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 1, 1.0, 1).unwrap());
        let clock = Arc::new(ManualClock::new(0.0));
        let mut collector = AsyncMetricsCollector::with_clock(
            sampler.clone(),
            backend,
            clock.clone(),
            &CollectorConfig::default().interval(1.0),
        )
        .unwrap();

        collector.initialize(0).unwrap();
        collector.initialize(1).unwrap();
        assert_eq!(collector.rank(), Some(1));

        sampler.record(outcome(3, 4, 6)).unwrap();
        clock.set(1.0);
        collector.poll(2).unwrap();
        let metrics = collector.poll(2).unwrap().unwrap();
        assert_eq!(metrics.accepted_tokens, 3);
    }

    #[test]
    fn test_pin_memory_override() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 0, 0.5, 1).unwrap());
        let collector = AsyncMetricsCollector::new(
            sampler,
            backend,
            &CollectorConfig::default().pin_memory(false),
        )
        .unwrap();
        assert!(!collector.accepted_tokens.is_pinned());
        assert!(!collector.emitted_tokens.is_pinned());
    }

    #[test]
    fn test_closure_clock() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(SimulatedSampler::new(backend.clone(), 0, 0.5, 1).unwrap());
        let collector = AsyncMetricsCollector::with_clock(
            sampler,
            backend,
            Arc::new(|| 3.5),
            &CollectorConfig::default(),
        )
        .unwrap();
        assert_eq!(collector.last_collect_time(), 3.5);
    }

    #[test]
    fn test_drop_with_copy_in_flight() {
        let mut h = harness(0.0, 0.0);
        h.collector.poll(4).unwrap();
        assert!(h.collector.has_in_flight_copy());
        drop(h.collector);
        h.backend.synchronize(0).unwrap();
    }

    #[test]
    fn test_accumulates_across_cycles() {
        let mut h = harness(1.0, 0.0);
        let mut expected = StepOutcome::default();
        let mut results = Vec::new();

        for step in 1..=6 {
            let o = h.sampler.step(2, 4).unwrap();
            expected.accepted += o.accepted;
            expected.emitted += o.emitted;
            expected.drafted += o.drafted;
            h.clock.set(step as f64);
            if let Some(m) = h.collector.poll(4).unwrap() {
                results.push(m);
            }
        }

        // Copies issue on odd steps and are consumed on even ones.
        assert_eq!(results.len(), 3);
        let last = results.last().unwrap();
        assert!(last.accepted_tokens <= expected.accepted);
        assert!(last.emitted_tokens <= expected.emitted);
        assert!(last.draft_tokens <= expected.drafted);
        for pair in results.windows(2) {
            assert!(pair[0].accepted_tokens <= pair[1].accepted_tokens);
            assert!(pair[0].draft_tokens < pair[1].draft_tokens);
        }
    }

    struct ForeignSampler {
        accepted: DeviceCounter,
        emitted: DeviceCounter,
    }

    impl SpecDecodeSampler for ForeignSampler {
        fn num_accepted_tokens(&self) -> &DeviceCounter {
            &self.accepted
        }

        fn num_emitted_tokens(&self) -> &DeviceCounter {
            &self.emitted
        }

        fn num_draft_tokens(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_rejects_counters_from_another_backend() {
        let backend = Arc::new(HostBackend::new());
        let sampler = Arc::new(ForeignSampler {
            accepted: DeviceCounter::new(0, 1u8),
            emitted: DeviceCounter::new(0, 1u8),
        });
        let result = AsyncMetricsCollector::new(sampler, backend, &CollectorConfig::default());
        assert!(matches!(
            result,
            Err(MetricsError::ForeignHandle {
                backend: "host",
                handle: "counter"
            })
        ));
    }

    #[test]
    fn test_copy_waits_for_sampler_stream() {
        let backend = Arc::new(HostBackend::new());
        let update_stream = backend.create_stream(0).unwrap();
        let (release, gate) = std::sync::mpsc::channel::<()>();
        backend
            .launch_host_fn(&update_stream, move || {
                let _ = gate.recv();
            })
            .unwrap();

        let sampler = Arc::new(
            SimulatedSampler::new(Arc::clone(&backend), 0, 0.5, 3)
                .unwrap()
                .on_stream(update_stream),
        );
        // Queued behind the held callback on the sampler's own stream.
        sampler.record(outcome(4, 6, 8)).unwrap();

        let clock = Arc::new(ManualClock::new(0.0));
        let mut collector = AsyncMetricsCollector::with_clock(
            sampler.clone(),
            backend.clone(),
            clock.clone(),
            &CollectorConfig::default().interval(1.0),
        )
        .unwrap();
        collector.initialize(0).unwrap();

        clock.set(1.0);
        assert!(collector.poll(4).unwrap().is_none());
        assert!(collector.has_in_flight_copy());

        release.send(()).unwrap();
        let metrics = collector.poll(4).unwrap().unwrap();
        assert_eq!(metrics.accepted_tokens, 4);
        assert_eq!(metrics.emitted_tokens, 6);
        assert_eq!(metrics.draft_tokens, 8);
    }
}
