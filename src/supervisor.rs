//! Wires the replication consumer, transform pipeline, and publishing
//! sink into a single running pipeline, and coordinates shutdown.

use crate::config::Config;
use crate::errors::CdcResult;
use crate::pipeline::TransformPipeline;
use crate::replication::{checkpoint, ReplicationConsumer};
use crate::sink::KafkaSink;
use std::sync::Arc;
use tracing::info;

pub struct Supervisor {
    consumer: ReplicationConsumer,
    pipeline: TransformPipeline,
    sink: KafkaSink,
    sink_config: crate::config::SinkConfig,
}

impl Supervisor {
    pub fn new(config: Config) -> CdcResult<Self> {
        let checkpoint_path = checkpoint::default_checkpoint_path()?;
        let consumer = ReplicationConsumer::new(config.source, checkpoint_path);
        let pipeline = TransformPipeline::new(Arc::new(config.pipeline));
        let sink = KafkaSink::new();

        Ok(Self { consumer, pipeline, sink, sink_config: config.sink })
    }

    /// Starts all three stages and blocks until a shutdown signal arrives,
    /// then tears them down in reverse order: sink, pipeline, consumer.
    pub async fn run(mut self) -> CdcResult<()> {
        let raw_events = self.consumer.start().await?;
        let transformed_events = self.pipeline.start(raw_events);
        self.sink.start(self.sink_config.clone(), transformed_events)?;

        info!("pipeline running, waiting for shutdown signal");
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping pipeline");

        self.sink.stop().await?;
        self.consumer.stop().await?;

        info!("pipeline stopped cleanly");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
