//! Kafka-backed publishing sink.
//!
//! Constructs a single `rdkafka` producer, JSON-encodes each event, keys
//! it by the joined primary key, and publishes asynchronously so the
//! worker never blocks per-record; the producer's internal batching
//! handles throughput.

use crate::config::SinkConfig;
use crate::errors::{CdcError, CdcResult};
use crate::model::ChangeEvent;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub struct KafkaSink {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl KafkaSink {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self { shutdown_tx, shutdown_rx, worker: None }
    }

    /// Builds the producer and spawns the worker that drains `input`.
    pub fn start(&mut self, config: SinkConfig, mut input: mpsc::Receiver<ChangeEvent>) -> CdcResult<()> {
        let producer = build_producer(&config)?;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = input.recv() => {
                        match maybe_event {
                            Some(event) => {
                                // Spawn a detached task per send so the
                                // worker loop never blocks on a single
                                // record's delivery acknowledgement.
                                let producer = producer.clone();
                                tokio::spawn(async move { publish(&producer, &event).await });
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("flushing producer before shutdown");
            let flush_timeout = Timeout::After(SHUTDOWN_GRACE);
            if let Err(e) = producer.flush(flush_timeout) {
                warn!(error = %e, "error flushing producer during shutdown");
            }
        });

        self.worker = Some(handle);
        Ok(())
    }

    /// Signals the worker to exit and awaits drain. Whichever of
    /// (input closed) or (sentinel signalled) fires first terminates the
    /// worker; both paths flush the producer before returning.
    pub async fn stop(&mut self) -> CdcResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for KafkaSink {
    fn default() -> Self {
        Self::new()
    }
}

fn build_producer(config: &SinkConfig) -> CdcResult<FutureProducer> {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", config.brokers.join(","));
    client_config.set("queue.buffering.max.kbytes", (config.batch_size_kib * 1024).to_string());
    client_config.set("queue.buffering.max.ms", config.flush_interval_ms.to_string());

    if let Some(codec) = compression_codec(&config.compression) {
        client_config.set("compression.codec", codec);
    }

    client_config
        .create()
        .map_err(|e| CdcError::sink(format!("failed to create Kafka producer: {}", e)))
}

fn compression_codec(name: &str) -> Option<&'static str> {
    match name {
        "gzip" => Some("gzip"),
        "snappy" => Some("snappy"),
        "lz4" => Some("lz4"),
        "zstd" => Some("zstd"),
        _ => None,
    }
}

async fn publish(producer: &FutureProducer, event: &ChangeEvent) {
    if event.route.is_empty() {
        error!(table = %event.table, "event has empty route, skipping publish");
        return;
    }

    let key = event.pk.join("|");
    let payload = match serde_json::to_vec(event) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, table = %event.table, "failed to serialize event, dropping");
            return;
        }
    };

    let record = FutureRecord::to(&event.route).key(&key).payload(&payload);

    let route = event.route.clone();
    let key_for_log = key.clone();
    match producer.send(record, Timeout::Never).await {
        Ok(_) => {}
        Err((e, _)) => {
            error!(error = %e, topic = %route, key = %key_for_log, "failed to produce record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_codec_maps_known_names() {
        assert_eq!(compression_codec("gzip"), Some("gzip"));
        assert_eq!(compression_codec("zstd"), Some("zstd"));
    }

    #[test]
    fn unknown_or_empty_compression_is_none() {
        assert_eq!(compression_codec(""), None);
        assert_eq!(compression_codec("none"), None);
        assert_eq!(compression_codec("bogus"), None);
    }
}
