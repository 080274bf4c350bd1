use crate::state::ProbeRunResult;
use crate::targets::Endpoint;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One labeled metrics record handed to the metrics sink.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct EventMetrics {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, u64>,
}

/// Merges output snapshots over an export window and publishes them.
pub struct StatsKeeper {
    ptype: String,
    probe: String,
    additional_labels: BTreeMap<String, String>,
    export_interval: Duration,
    window: HashMap<String, ProbeRunResult>,
}

impl StatsKeeper {
    pub fn new(
        ptype: &str,
        probe: &str,
        additional_labels: BTreeMap<String, String>,
        export_interval: Duration,
    ) -> Self {
        Self {
            ptype: ptype.to_string(),
            probe: probe.to_string(),
            additional_labels,
            export_interval,
            window: HashMap::new(),
        }
    }

    /// Snapshots are deltas, so they simply add up.
    pub fn merge(&mut self, result: ProbeRunResult) {
        match self.window.get_mut(&result.target) {
            Some(acc) => acc.merge(&result),
            None => {
                self.window.insert(result.target.clone(), result);
            }
        }
    }

    /// Builds one record per known target that has data and starts a new
    /// window. Data for targets no longer listed is discarded.
    pub fn export(&mut self, targets: &[Endpoint], ts: SystemTime) -> Vec<EventMetrics> {
        let mut window = std::mem::take(&mut self.window);
        let mut out = Vec::new();

        for t in targets {
            let Some(res) = window.remove(&t.name) else {
                continue;
            };
            let mut labels = self.additional_labels.clone();
            labels.extend(t.labels.clone());
            labels.insert("ptype".to_string(), self.ptype.clone());
            labels.insert("probe".to_string(), self.probe.clone());
            labels.insert("dst".to_string(), t.name.clone());

            out.push(EventMetrics {
                timestamp: ts,
                labels,
                metrics: res.metrics(),
            });
        }

        if !window.is_empty() {
            debug!(
                "Dropping stats for {} targets no longer listed",
                window.len()
            );
        }
        out
    }

    pub async fn run(
        mut self,
        mut results: mpsc::Receiver<ProbeRunResult>,
        targets: watch::Receiver<Vec<Endpoint>>,
        sink: mpsc::Sender<EventMetrics>,
        cancel: CancellationToken,
    ) {
        let start = tokio::time::Instant::now() + self.export_interval;
        let mut export_ticker = tokio::time::interval_at(start, self.export_interval);

        loop {
            tokio::select! {
                res = results.recv() => match res {
                    Some(r) => self.merge(r),
                    None => break,
                },
                _ = export_ticker.tick() => {
                    let current = targets.borrow().clone();
                    for em in self.export(&current, SystemTime::now()) {
                        match sink.try_send(em) {
                            Ok(()) => {}
                            Err(TrySendError::Full(em)) => {
                                warn!("Metrics sink full, dropping stats for {:?}", em.labels.get("dst"));
                            }
                            Err(TrySendError::Closed(_)) => {
                                warn!("Metrics sink closed");
                            }
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!(probe = %self.probe, "Stats keeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(target: &str, total: u64, success: u64, lost: u64) -> ProbeRunResult {
        ProbeRunResult {
            target: target.to_string(),
            total,
            success,
            lost,
            delayed: 0,
            ipd: Duration::from_micros(100 * success),
        }
    }

    fn keeper() -> StatsKeeper {
        StatsKeeper::new(
            "udp",
            "rx",
            BTreeMap::from([("env".to_string(), "test".to_string())]),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_merge_and_export() {
        let mut k = keeper();
        k.merge(snapshot("a", 5, 4, 1));
        k.merge(snapshot("a", 5, 5, 0));
        k.merge(snapshot("b", 3, 3, 0));
        k.merge(snapshot("gone", 1, 1, 0));

        let ts = SystemTime::now();
        let mut a = Endpoint::new("a");
        a.labels.insert("zone".to_string(), "west".to_string());
        let out = k.export(&[a, Endpoint::new("b")], ts);
        assert_eq!(out.len(), 2);

        let a = &out[0];
        assert_eq!(a.timestamp, ts);
        assert_eq!(a.labels["ptype"], "udp");
        assert_eq!(a.labels["probe"], "rx");
        assert_eq!(a.labels["dst"], "a");
        assert_eq!(a.labels["env"], "test");
        assert_eq!(a.labels["zone"], "west");
        assert_eq!(a.metrics["total"], 10);
        assert_eq!(a.metrics["success"], 9);
        assert_eq!(a.metrics["lost"], 1);
        assert_eq!(a.metrics["ipd_us"], 900);
        assert_eq!(out[1].metrics["total"], 3);

        // Window cleared: nothing counted twice.
        assert!(k.export(&[Endpoint::new("a")], ts).is_empty());
    }

    #[tokio::test]
    async fn test_run_exports_and_stops_on_close() {
        let (results_tx, results_rx) = mpsc::channel(10);
        let (_targets_tx, targets_rx) = watch::channel(vec![Endpoint::new("a")]);
        let (sink_tx, mut sink_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(keeper().run(results_rx, targets_rx, sink_tx, cancel));

        results_tx.send(snapshot("a", 2, 2, 0)).await.unwrap();
        results_tx.send(snapshot("a", 3, 1, 2)).await.unwrap();

        let em = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
            .await
            .expect("export in time")
            .expect("record");
        assert_eq!(em.metrics["total"], 5);
        assert_eq!(em.metrics["lost"], 2);
        assert!(serde_json::to_string(&em).unwrap().contains("\"dst\":\"a\""));

        drop(results_tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("keeper exits on channel close")
            .unwrap();
    }
}
