//! Periodic status reporting for a running receiver.
//!
//! Every `mon_wait` seconds the sender reads the shared packet counter,
//! computes the rate over the elapsed interval and publishes a JSON
//! [`MonitorRecord`]. Publishing goes through its own sink so a slow or dead
//! monitoring consumer can never stall ingestion.

use crate::data::MonitorRecord;
use crate::net::Sink;
use crate::receiver::ReceiverCounters;
use bytes::Bytes;
use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

pub struct MonitoringSender {
    name: String,
    interval: Duration,
    counters: Arc<ReceiverCounters>,
    sink: Arc<dyn Sink>,
}

impl MonitoringSender {
    pub fn new(
        name: impl Into<String>,
        mon_wait: f64,
        counters: Arc<ReceiverCounters>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs_f64(mon_wait),
            counters,
            sink,
        }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and only seeds the baseline.
        ticker.tick().await;
        let mut last_count = self.counters.total_packets.load(Ordering::Relaxed);
        let mut last_instant = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        debug!("Monitoring sender stopping");
                        return;
                    }
                    continue;
                }
            }

            let now = Instant::now();
            let count = self.counters.total_packets.load(Ordering::Relaxed);
            let elapsed = now.duration_since(last_instant).as_secs_f64();
            let delta = count.saturating_sub(last_count);
            let data_rate = if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            };
            last_count = count;
            last_instant = now;

            let (time_s, time_ns) = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)
            {
                Ok(d) => (d.as_secs(), d.subsec_nanos() as u64),
                Err(_) => (0, 0),
            };
            let record = MonitorRecord {
                pid: std::process::id(),
                name: self.name.clone(),
                data_rate,
                recv_data: delta > 0,
                time_s,
                time_ns,
            };
            match record.encode() {
                Ok(bytes) => {
                    if let Err(e) = self.sink.send(Bytes::from(bytes)).await {
                        warn!("Monitoring publish failed: {}", e);
                    }
                }
                Err(e) => warn!("Monitoring record serialization failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NullSink;

    #[tokio::test(start_paused = true)]
    async fn first_interval_reports_only_new_packets() {
        let counters = Arc::new(ReceiverCounters::new());
        // Traffic from before monitoring starts must not show in the rate.
        counters.total_packets.store(1_000, Ordering::Relaxed);
        let sink = Arc::new(NullSink::new());
        let sender =
            MonitoringSender::new("readout_assembler", 1.0, counters.clone(), sink.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sender.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        counters.total_packets.fetch_add(50, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;
        assert!(sink.delivered() >= 2);

        stop_tx.send(true).unwrap();
        let _ = task.await;
    }
}
