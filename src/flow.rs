use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Backward jumps larger than this are taken as a sender counter wrap.
const WRAP_THRESHOLD: u64 = u64::MAX / 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Flow table full ({0} sources), dropping new source")]
    TooManySources(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct FlowState {
    pub prev_seq: u64,
    pub last_rx: Instant,
}

/// Classification of one message against its flow. At most one of
/// `success`, `lost_count > 0` and `delayed` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub success: bool,
    pub lost_count: u64,
    pub delayed: bool,
    pub inter_pkt_delay: Duration,
}

pub struct FlowStateMap {
    flows: HashMap<String, FlowState>,
    max_sources: usize,
}

impl FlowStateMap {
    pub fn new(max_sources: usize) -> Self {
        Self {
            flows: HashMap::new(),
            max_sources,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[cfg(test)]
    pub fn get(&self, source: &str) -> Option<&FlowState> {
        self.flows.get(source)
    }

    /// Keeps only the flows whose source passes `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.flows.retain(|source, _| keep(source));
    }

    /// Classifies `seq` from `source` received at `rx_ts` and updates the
    /// flow baseline. The baseline only moves forward on in-order and
    /// loss paths; duplicates and reorders leave it untouched.
    pub fn classify(
        &mut self,
        source: &str,
        seq: u64,
        rx_ts: Instant,
    ) -> Result<ProcessResult, FlowError> {
        let Some(fs) = self.flows.get_mut(source) else {
            if self.flows.len() >= self.max_sources {
                return Err(FlowError::TooManySources(self.max_sources));
            }
            self.flows.insert(
                source.to_string(),
                FlowState {
                    prev_seq: seq,
                    last_rx: rx_ts,
                },
            );
            return Ok(ProcessResult {
                success: true,
                ..Default::default()
            });
        };

        let mut res = ProcessResult::default();
        if seq > fs.prev_seq {
            let delta = seq - fs.prev_seq;
            if delta == 1 {
                res.success = true;
                res.inter_pkt_delay = rx_ts.saturating_duration_since(fs.last_rx);
            } else {
                res.lost_count = delta - 1;
            }
            fs.prev_seq = seq;
            fs.last_rx = rx_ts;
        } else if fs.prev_seq - seq > WRAP_THRESHOLD {
            // Counter wrapped: start over from this message.
            res.success = true;
            fs.prev_seq = seq;
            fs.last_rx = rx_ts;
        } else {
            res.delayed = true;
        }
        Ok(res)
    }
}
