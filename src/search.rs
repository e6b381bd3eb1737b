use std::thread;
use std::time;

use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::constants::{
    DEFAULT_INCONCLUSIVE_BUDGET, DEFAULT_MIN_TUNNEL_MTU, DEFAULT_PAYLOAD_CEILING,
    DEFAULT_PAYLOAD_FLOOR, DEFAULT_PROBE_TIMEOUT, DEFAULT_TUNNEL_OVERHEAD, MIN_DISPUTED_PAYLOAD,
    PROBE_HEADER_OVERHEAD,
};
use crate::error::SearchError;
use crate::probe::{ProbeOutcome, ProbeRequest, Prober};

/// What to do with Timeout / Unreachable in the middle of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconclusivePolicy {
    /// Abort with NoMeasurement after this many inconclusive outcomes in a row
    pub budget: u32,
    /// Treat an inconclusive size as too large (true), or probe the same size again (false)
    pub shrink_high: bool,
}

impl Default for InconclusivePolicy {
    fn default() -> Self {
        Self {
            budget: DEFAULT_INCONCLUSIVE_BUDGET,
            shrink_high: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Smallest payload considered. Verified by a probe when above 8 bytes.
    pub floor: usize,
    /// Largest payload size to try. None derives it from the interface MTU, or uses 1472.
    pub ceiling: Option<usize>,
    pub probe_timeout: time::Duration,
    /// Consecutive successes required before a size counts as good
    pub attempts_per_size: u32,
    pub inconclusive: InconclusivePolicy,
    /// Bytes the probe adds on top of its payload (IP + ICMP headers)
    pub header_overhead: usize,
    /// Bytes the tunnel encapsulation adds to every packet
    pub tunnel_overhead: usize,
    /// Lowest tunnel MTU ever recommended
    pub min_tunnel_mtu: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            floor: DEFAULT_PAYLOAD_FLOOR,
            ceiling: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            attempts_per_size: 1,
            inconclusive: InconclusivePolicy::default(),
            header_overhead: PROBE_HEADER_OVERHEAD,
            tunnel_overhead: DEFAULT_TUNNEL_OVERHEAD,
            min_tunnel_mtu: DEFAULT_MIN_TUNNEL_MTU,
        }
    }
}

impl SearchConfig {
    fn ceiling_for(&self, interface_mtu: Option<usize>) -> usize {
        self.ceiling.unwrap_or_else(|| {
            interface_mtu
                .map(|mtu| mtu.saturating_sub(self.header_overhead))
                .unwrap_or(DEFAULT_PAYLOAD_CEILING)
        })
    }
}

/// `low` is the largest payload known to pass, `high` the smallest known (or assumed) not to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBounds {
    low: usize,
    high: usize,
}

impl SearchBounds {
    /// `high` below `low` is raised to `low`
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high: high.max(low) }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn is_converged(&self) -> bool {
        self.high - self.low <= 1
    }

    pub fn midpoint(&self) -> usize {
        self.low + (self.high - self.low) / 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtuResult {
    pub target: String,
    /// Absent when the OS could not tell
    pub interface_mtu: Option<usize>,
    /// Largest payload confirmed to pass without fragmentation
    pub payload: usize,
    pub path_mtu: usize,
    pub recommended_tunnel_mtu: usize,
    /// The recommendation was raised to the configured minimum (or capped at the path MTU)
    pub constrained: bool,
    pub probes: u32,
}

/// Return (tunnel mtu, constrained). Never exceeds path_mtu, and never goes below
/// min_tunnel_mtu unless the path itself is smaller than that.
pub fn recommend_tunnel_mtu(path_mtu: usize, tunnel_overhead: usize, min_tunnel_mtu: usize) -> (usize, bool) {
    let raw = path_mtu.saturating_sub(tunnel_overhead);
    if raw >= min_tunnel_mtu {
        (raw, false)
    } else {
        (usize::min(min_tunnel_mtu, path_mtu), true)
    }
}

/// Book-keeping for one running search. Lives on the stack of `discover`.
struct SearchRun<'a> {
    target: &'a str,
    probes: u32,
    last_tested: Option<usize>,
    inconclusive_streak: u32,
    seen_success: bool,
}

impl<'a> SearchRun<'a> {
    fn no_measurement(&self) -> SearchError {
        SearchError::NoMeasurement {
            target: self.target.to_owned(),
            last_tested: self.last_tested,
            probes: self.probes,
        }
    }

    fn cancelled(&self) -> SearchError {
        SearchError::Cancelled {
            target: self.target.to_owned(),
            last_tested: self.last_tested,
            probes: self.probes,
        }
    }

    /// Count an outcome against the inconclusive budget. Returns true if it was inconclusive.
    fn account(&mut self, outcome: &ProbeOutcome, policy: &InconclusivePolicy) -> Result<bool, SearchError> {
        match outcome {
            ProbeOutcome::Success => {
                self.seen_success = true;
                self.inconclusive_streak = 0;
                Ok(false)
            },
            ProbeOutcome::NeedsFragmentation { .. } => {
                self.inconclusive_streak = 0;
                Ok(false)
            },
            _ => {
                self.inconclusive_streak += 1;
                if self.inconclusive_streak >= policy.budget {
                    warn!("{} inconclusive probes in a row for {}, giving up",
                          self.inconclusive_streak, self.target);
                    return Err(self.no_measurement());
                }
                Ok(true)
            },
        }
    }
}

pub struct MtuSearch<P> {
    prober: P,
    config: SearchConfig,
    cancel: CancelToken,
}

impl<P> MtuSearch<P> where P: Prober {
    pub fn new(prober: P, config: SearchConfig, cancel: CancelToken) -> Self {
        Self { prober, config, cancel }
    }

    /// Probe one size, `attempts_per_size` times. The first non-success decides.
    fn probe_size(&self, run: &mut SearchRun, size: usize) -> Result<ProbeOutcome, SearchError> {
        for _ in 0..self.config.attempts_per_size.max(1) {
            if self.cancel.is_cancelled() {
                return Err(run.cancelled());
            }
            let req = ProbeRequest::new(run.target, size, self.config.probe_timeout);
            let outcome = self.prober.probe(&req, &self.cancel);
            run.probes += 1;
            run.last_tested = Some(size);
            debug!("Probe {} size {} -> {:?}", run.target, size, outcome);

            if self.cancel.is_cancelled() {
                return Err(run.cancelled());
            }
            match outcome {
                ProbeOutcome::Success => continue,
                ProbeOutcome::ExecutionError(message) => {
                    return Err(SearchError::Execution {
                        target: run.target.to_owned(),
                        size,
                        probes: run.probes,
                        message,
                    });
                },
                other => return Ok(other),
            }
        }
        Ok(ProbeOutcome::Success)
    }

    /// Probe the floor until it passes. Inconclusive outcomes retry it within the budget.
    fn verify_floor(&self, run: &mut SearchRun, floor: usize, policy: &InconclusivePolicy) -> Result<(), SearchError> {
        loop {
            let outcome = self.probe_size(run, floor)?;
            run.account(&outcome, policy)?;
            match outcome {
                ProbeOutcome::Success => return Ok(()),
                ProbeOutcome::NeedsFragmentation { .. } => {
                    warn!("Floor {floor} towards {} needs fragmentation", run.target);
                    return Err(SearchError::FloorRejected {
                        target: run.target.to_owned(),
                        floor,
                        probes: run.probes,
                    });
                },
                _ => continue,
            }
        }
    }

    /// Find the largest unfragmented payload towards target, and derive the tunnel MTU from it.
    /// `interface_mtu` is reported as-is and, when no ceiling is configured, bounds the search.
    pub fn discover(&self, target: &str, interface_mtu: Option<usize>) -> Result<MtuResult, SearchError> {
        let ceiling = self.config.ceiling_for(interface_mtu);
        if self.config.floor > ceiling {
            return Err(SearchError::InvalidBounds {
                target: target.to_owned(),
                floor: self.config.floor,
                ceiling,
            });
        }

        let policy = self.config.inconclusive;
        let mut run = SearchRun {
            target,
            probes: 0,
            last_tested: None,
            inconclusive_streak: 0,
            seen_success: false,
        };
        let mut bounds = SearchBounds::new(self.config.floor, ceiling);
        info!("Searching path MTU to {target}, payload range {}..={}", bounds.low, bounds.high);

        // Check the ceiling first; if it passes there is nothing to search
        let outcome = self.probe_size(&mut run, bounds.high)?;
        run.account(&outcome, &policy)?;
        let payload = if outcome == ProbeOutcome::Success {
            bounds.high
        } else {
            if bounds.low > MIN_DISPUTED_PAYLOAD {
                self.verify_floor(&mut run, bounds.low, &policy)?;
            }
            while !bounds.is_converged() {
                let mid = bounds.midpoint();
                let outcome = self.probe_size(&mut run, mid)?;
                let inconclusive = run.account(&outcome, &policy)?;
                if let ProbeOutcome::NeedsFragmentation { reported_mtu: Some(mtu) } = outcome {
                    debug!("Hop towards {target} reports MTU {mtu}");
                }
                if outcome == ProbeOutcome::Success {
                    bounds.low = mid;
                } else if !inconclusive || policy.shrink_high {
                    bounds.high = mid;
                }
                debug_assert!(bounds.low <= bounds.high);
            }
            bounds.low
        };

        if !run.seen_success {
            warn!("No probe to {target} ever succeeded");
            return Err(run.no_measurement());
        }

        let path_mtu = payload + self.config.header_overhead;
        let (recommended_tunnel_mtu, constrained) =
            recommend_tunnel_mtu(path_mtu, self.config.tunnel_overhead, self.config.min_tunnel_mtu);
        info!("Path MTU to {target} is {path_mtu} ({} probes), tunnel MTU {recommended_tunnel_mtu}",
              run.probes);

        Ok(MtuResult {
            target: target.to_owned(),
            interface_mtu,
            payload,
            path_mtu,
            recommended_tunnel_mtu,
            constrained,
            probes: run.probes,
        })
    }

    /// Run one independent search per target in parallel. Results are in input order.
    pub fn discover_all<S: AsRef<str> + Sync>(&self, targets: &[S], interface_mtu: Option<usize>)
                                              -> Vec<Result<MtuResult, SearchError>> {
        thread::scope(|s| {
            let handles: Vec<_> = targets.iter()
                .map(|target| s.spawn(move || self.discover(target.as_ref(), interface_mtu)))
                .collect();
            handles.into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}
