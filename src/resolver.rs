//! Multi-region object resolution.
//!
//! [`RegionResolver::resolve`] races one existence probe per configured
//! region of a bucket and returns the first region that reports the object.
//!
//! Structure of one race:
//!
//! - every probe owns a sender of a completion channel sized to the probe
//!   count, so reporting never blocks;
//! - a supervisor task joins every probe and then drops the last sender,
//!   which closes the channel and makes "all probes exhausted" observable;
//! - the caller waits for the first of: a success, the channel closing, or
//!   the overall deadline;
//! - once decided, a `watch` signal cancels every probe still running
//!   (dropping its backend call) and a detached task drains the channel.
//!
//! Per-probe timeout and overall deadline are independent, so one hung
//! region cannot consume the whole budget of the others.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{panic_message, ProbeFailure};
use crate::metrics::{PROBE_FAILURES_TOTAL, RESOLUTIONS_TOTAL, RESOLUTION_DURATION_SECONDS};
use crate::registry::{BackendDescriptor, BackendRegistry};

/// Result of racing all regions of a bucket.
#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    /// The fastest region that has the object, with the prefixed key.
    Found {
        descriptor: Arc<BackendDescriptor>,
        resolved_path: String,
    },
    /// No live region has the object, or the deadline elapsed.
    NotFound,
}

impl ResolutionOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, ResolutionOutcome::Found { .. })
    }
}

/// A successful probe report.
struct ProbeHit {
    descriptor: Arc<BackendDescriptor>,
    resolved_path: String,
}

/// Races existence checks across regions.
#[derive(Debug, Clone)]
pub struct RegionResolver {
    registry: Arc<BackendRegistry>,
    probe_timeout: Duration,
}

impl RegionResolver {
    pub fn new(registry: Arc<BackendRegistry>, probe_timeout: Duration) -> Self {
        Self {
            registry,
            probe_timeout,
        }
    }

    /// Locate `object_path` of `bucket` in whichever region answers first.
    ///
    /// Returns within `deadline` (plus scheduling slack) regardless of how
    /// slow or broken individual regions are.  Probes still running when the
    /// race is decided are cancelled.
    pub async fn resolve(
        &self,
        bucket: &str,
        object_path: &str,
        deadline: Duration,
    ) -> ResolutionOutcome {
        let started = Instant::now();
        let backends = self.registry.backends_for(bucket);
        if backends.is_empty() {
            debug!("No usable region for bucket {}", bucket);
            record(started, "no_backends");
            return ResolutionOutcome::NotFound;
        }

        let (tx, mut rx) = mpsc::channel::<ProbeHit>(backends.len());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let probes: Vec<_> = backends
            .into_iter()
            .map(|descriptor| {
                tokio::spawn(probe(
                    descriptor,
                    object_path.to_string(),
                    self.probe_timeout,
                    cancel_rx.clone(),
                    tx.clone(),
                ))
            })
            .collect();
        drop(cancel_rx);

        // Completion barrier: the channel closes once every probe is done and
        // this last sender goes away.
        tokio::spawn(async move {
            for handle in probes {
                if let Err(e) = handle.await {
                    // Probes catch their own panics; this only fires on abort.
                    warn!("Probe task ended abnormally: {}", e);
                }
            }
            drop(tx);
        });

        let (outcome, label) = tokio::select! {
            hit = rx.recv() => match hit {
                Some(hit) => (
                    ResolutionOutcome::Found {
                        descriptor: hit.descriptor,
                        resolved_path: hit.resolved_path,
                    },
                    "found",
                ),
                None => (ResolutionOutcome::NotFound, "exhausted"),
            },
            _ = tokio::time::sleep(deadline) => (ResolutionOutcome::NotFound, "deadline"),
        };

        // Stop everyone still probing; late reports are drained and dropped.
        let _ = cancel_tx.send(true);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        match &outcome {
            ResolutionOutcome::Found { descriptor, .. } => debug!(
                "Resolved {}/{} in region {} after {:?}",
                bucket,
                object_path,
                descriptor.region_alias,
                started.elapsed()
            ),
            ResolutionOutcome::NotFound => debug!(
                "Object {}/{} not found ({}) after {:?}",
                bucket,
                object_path,
                label,
                started.elapsed()
            ),
        }
        record(started, label);
        outcome
    }
}

fn record(started: Instant, outcome: &'static str) {
    counter!(RESOLUTIONS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(RESOLUTION_DURATION_SECONDS, "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());
}

/// One existence check against one region.
///
/// Never fails and never blocks on reporting: errors, timeouts and panics
/// count as "no result", and cancellation drops the backend call.
async fn probe(
    descriptor: Arc<BackendDescriptor>,
    object_path: String,
    timeout: Duration,
    mut cancel: watch::Receiver<bool>,
    results: mpsc::Sender<ProbeHit>,
) {
    let resolved_path = descriptor.resolve_path(&object_path);

    let check = AssertUnwindSafe(tokio::time::timeout(
        timeout,
        descriptor.store().exists(&resolved_path),
    ))
    .catch_unwind();

    let outcome = tokio::select! {
        outcome = check => outcome,
        _ = cancel.wait_for(|cancelled| *cancelled) => {
            debug!(
                "Probe cancelled: bucket {} region {}",
                descriptor.bucket_alias, descriptor.region_alias
            );
            return;
        }
    };

    let failure = match outcome {
        Ok(Ok(Ok(true))) => {
            // Capacity equals the probe count, so this cannot be full.
            let _ = results.try_send(ProbeHit {
                descriptor,
                resolved_path,
            });
            return;
        }
        Ok(Ok(Ok(false))) => {
            debug!(
                "Object {} absent in bucket {} region {}",
                resolved_path, descriptor.bucket_alias, descriptor.region_alias
            );
            return;
        }
        Ok(Ok(Err(e))) => ProbeFailure::Backend(e),
        Ok(Err(_)) => ProbeFailure::TimedOut(timeout),
        Err(payload) => ProbeFailure::Panicked(panic_message(payload.as_ref())),
    };

    debug!(
        "Probe of bucket {} region {} for {}: {}",
        descriptor.bucket_alias, descriptor.region_alias, resolved_path, failure
    );
    counter!(
        PROBE_FAILURES_TOTAL,
        "region" => descriptor.region_alias.clone(),
        "reason" => failure.reason()
    )
    .increment(1);
}
