use crate::flow::{FlowError, FlowStateMap, ProcessResult};
use crate::protocol::{Message, ProtocolError};
use crate::targets::Endpoint;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Counters for one target over one output window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeRunResult {
    pub target: String,
    pub total: u64,
    pub success: u64,
    pub lost: u64,
    pub delayed: u64,
    pub ipd: Duration,
}

impl ProbeRunResult {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, res: &ProcessResult) {
        self.total = self.total.saturating_add(1);
        if res.success {
            self.success = self.success.saturating_add(1);
            self.ipd = self.ipd.saturating_add(res.inter_pkt_delay);
        } else if res.lost_count > 0 {
            self.lost = self.lost.saturating_add(res.lost_count);
        } else if res.delayed {
            self.delayed = self.delayed.saturating_add(1);
        }
    }

    /// Adds another window's counters to this one.
    pub fn merge(&mut self, other: &ProbeRunResult) {
        self.total = self.total.saturating_add(other.total);
        self.success = self.success.saturating_add(other.success);
        self.lost = self.lost.saturating_add(other.lost);
        self.delayed = self.delayed.saturating_add(other.delayed);
        self.ipd = self.ipd.saturating_add(other.ipd);
    }

    /// Metric name/value pairs, inter-packet delay in microseconds.
    pub fn metrics(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("total".to_string(), self.total),
            ("success".to_string(), self.success),
            ("ipd_us".to_string(), self.ipd.as_micros() as u64),
            ("lost".to_string(), self.lost),
            ("delayed".to_string(), self.delayed),
        ])
    }
}

/// Errors collected between two throttled log flushes.
#[derive(Debug, Default)]
pub struct ErrorBuckets {
    pub invalid_msgs: HashMap<SocketAddr, String>,
    pub unknown_sources: HashMap<String, u64>,
}

impl ErrorBuckets {
    fn invalid(&mut self, addr: SocketAddr, err: impl ToString) {
        self.invalid_msgs.insert(addr, err.to_string());
    }

    fn unknown(&mut self, source: &str) {
        match self.unknown_sources.get_mut(source) {
            Some(ct) => *ct += 1,
            None => {
                self.unknown_sources.insert(source.to_string(), 1);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.invalid_msgs.is_empty() && self.unknown_sources.is_empty()
    }
}

/// Lock-free event counter that fires once every `threshold` errors.
pub struct ErrorThrottle {
    count: AtomicU32,
    threshold: u32,
}

impl ErrorThrottle {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Counts one error. Returns true when the caller should flush.
    pub fn note_error(&self) -> bool {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.threshold {
            self.count.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn rearm(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(ProcessResult),
    Invalid(ProtocolError),
    UnknownSource,
    Rejected(FlowError),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, Outcome::Accepted(_))
    }
}

/// Everything the receive and output loops share. Lives behind a single
/// mutex so that a window reset never splits a message.
pub struct ProbeState {
    results: HashMap<String, ProbeRunResult>,
    fsm: FlowStateMap,
    errs: ErrorBuckets,
}

impl ProbeState {
    pub fn new(max_sources: usize) -> Self {
        Self {
            results: HashMap::new(),
            fsm: FlowStateMap::new(max_sources),
            errs: ErrorBuckets::default(),
        }
    }

    #[cfg(test)]
    pub fn result(&self, target: &str) -> Option<&ProbeRunResult> {
        self.results.get(target)
    }

    #[cfg(test)]
    pub fn flows(&self) -> &FlowStateMap {
        &self.fsm
    }

    #[cfg(test)]
    pub fn errors(&self) -> &ErrorBuckets {
        &self.errs
    }

    /// Drops the current window and starts a fresh one for `targets`.
    /// Flows of sources that left the list are forgotten.
    pub fn reset_targets(&mut self, targets: &[Endpoint]) {
        self.results = targets
            .iter()
            .map(|t| (t.name.clone(), ProbeRunResult::new(t.name.clone())))
            .collect();
        let results = &self.results;
        self.fsm.retain(|source| results.contains_key(source));
    }

    /// Decodes and classifies one datagram, folding it into its target's
    /// window. Malformed and unknown packets only land in the error buckets.
    pub fn process_message(&mut self, buf: &[u8], rx_ts: Instant, src: SocketAddr) -> Outcome {
        let msg = match Message::decode(buf) {
            Ok(m) => m,
            Err(e) => {
                self.errs.invalid(src, &e);
                return Outcome::Invalid(e);
            }
        };

        let Some(probe_res) = self.results.get_mut(msg.source) else {
            self.errs.unknown(msg.source);
            return Outcome::UnknownSource;
        };

        match self.fsm.classify(msg.source, msg.seq, rx_ts) {
            Ok(res) => {
                probe_res.record(&res);
                Outcome::Accepted(res)
            }
            Err(e) => {
                self.errs.invalid(src, &e);
                Outcome::Rejected(e)
            }
        }
    }

    /// Ends the window: raises every total to at least `expected`, hands
    /// back the snapshots and starts a new window for `targets`.
    ///
    /// Only `total` is raised; `lost` keeps its observed value.
    pub fn output_results(&mut self, expected: u64, targets: &[Endpoint]) -> Vec<ProbeRunResult> {
        let mut snapshots: Vec<ProbeRunResult> = std::mem::take(&mut self.results)
            .into_values()
            .map(|mut r| {
                if r.total < expected {
                    r.total = expected;
                }
                r
            })
            .collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));

        self.reset_targets(targets);
        snapshots
    }

    /// Logs everything collected since the last flush as one warning per
    /// bucket. Returns false if there was nothing to report.
    pub fn flush_errors(&mut self, probe: &str) -> bool {
        if self.errs.is_empty() {
            return false;
        }
        if !self.errs.invalid_msgs.is_empty() {
            warn!(probe = %probe, "Invalid messages received: {:?}", self.errs.invalid_msgs);
            self.errs.invalid_msgs.clear();
        }
        if !self.errs.unknown_sources.is_empty() {
            warn!(
                probe = %probe,
                "Unknown targets sending messages: {:?}", self.errs.unknown_sources
            );
            self.errs.unknown_sources.clear();
        }
        true
    }
}
