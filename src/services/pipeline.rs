use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use log::{error, info};
use pcap::Device;
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::CaptureInitError;
use crate::protocol::layout::ProtocolLayout;
use crate::protocol::types::{DecodedEvent, RawPayload};
use crate::services::aggregator::DamageAggregator;
use crate::services::decoder::{DecoderCounters, DecoderStats, FrameDecoder};
use crate::services::sniffer::{CaptureCounters, CaptureStats, Sniffer};

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    #[serde(flatten)]
    pub capture: CaptureCounters,
    #[serde(flatten)]
    pub decoder: DecoderCounters,
}

pub fn dispatch(aggregator: &DamageAggregator, event: DecodedEvent) {
    match event {
        DecodedEvent::Damage(hit) => aggregator.ingest(&hit),
        DecodedEvent::Nickname { entity, name } => aggregator.set_nickname(entity, name),
    }
}

/// Drains `rx` into the aggregator until every sender is gone.
///
/// This is the aggregator's only writer. Payloads still queued when the
/// producer goes away are decoded before returning.
pub fn run_consumer(rx: Receiver<RawPayload>, mut decoder: FrameDecoder, aggregator: &DamageAggregator) {
    for payload in rx.iter() {
        for event in decoder.push(&payload) {
            dispatch(aggregator, event);
        }
    }
    info!("[Pipeline] Channel closed, decoder stopped ({} bytes unframed)", decoder.buffered_bytes());
}

/// Capture thread -> bounded channel -> decoder thread -> aggregator.
pub struct Pipeline {
    sniffer: Sniffer,
    consumer: Option<JoinHandle<()>>,
    capture_stats: Arc<CaptureStats>,
    decoder_stats: Arc<DecoderStats>,
}

impl Pipeline {
    pub fn start(
        device: Device,
        config: &AppConfig,
        layout: Arc<ProtocolLayout>,
        aggregator: Arc<DamageAggregator>,
    ) -> Result<Self, CaptureInitError> {
        let (tx, rx) = bounded(config.channel_capacity.max(1));
        let capture_stats = Arc::new(CaptureStats::default());

        let decoder = FrameDecoder::new(layout, config.max_buffer_size, config.stale_after());
        let decoder_stats = decoder.stats();

        let mut sniffer = Sniffer::start(device, config, tx, capture_stats.clone())?;

        let consumer = thread::Builder::new()
            .name("decoder".into())
            .spawn(move || run_consumer(rx, decoder, &aggregator));
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(e) => {
                sniffer.stop();
                return Err(CaptureInitError::Spawn(e));
            }
        };

        info!("[Pipeline] Started (channel capacity {})", config.channel_capacity.max(1));
        Ok(Self { sniffer, consumer: Some(consumer), capture_stats, decoder_stats })
    }

    /// False once the capture loop has ended, whether stopped or after a read error.
    pub fn is_running(&self) -> bool {
        self.sniffer.is_running()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            capture: self.capture_stats.counters(),
            decoder: self.decoder_stats.counters(),
        }
    }

    /// Stops capture first; the decoder then drains what was queued and exits.
    pub fn stop(&mut self) {
        self.sniffer.stop();
        if let Some(handle) = self.consumer.take() {
            if handle.join().is_err() {
                error!("[Pipeline] Decoder thread panicked");
            }
            info!("[Pipeline] Stopped. {:?}", self.stats());
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
