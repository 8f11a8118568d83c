use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use serde::Serialize;

use crate::packet_buffer::PacketBuffer;
use crate::protocol::layout::ProtocolLayout;
use crate::protocol::parser::{parse_frame, ParsedFrame};
use crate::protocol::types::{DecodedEvent, RawPayload, StreamKey};

#[derive(Debug, Default)]
pub struct DecoderStats {
    messages: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    events: AtomicU64,
    discarded_bytes: AtomicU64,
    framing_overflows: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DecoderCounters {
    pub messages: u64,
    pub ignored_messages: u64,
    pub malformed_messages: u64,
    pub events: u64,
    /// Bytes that never became part of a frame.
    pub discarded_bytes: u64,
    pub framing_overflows: u64,
}

impl DecoderStats {
    pub fn counters(&self) -> DecoderCounters {
        DecoderCounters {
            messages: self.messages.load(Ordering::Relaxed),
            ignored_messages: self.ignored.load(Ordering::Relaxed),
            malformed_messages: self.malformed.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            framing_overflows: self.framing_overflows.load(Ordering::Relaxed),
        }
    }
}

/// Turns captured payloads into game events, one reassembly buffer per TCP stream.
pub struct FrameDecoder {
    layout: Arc<ProtocolLayout>,
    streams: HashMap<StreamKey, PacketBuffer>,
    max_buffer_size: usize,
    stale_after: Option<Duration>,
    stats: Arc<DecoderStats>,
}

impl FrameDecoder {
    /// `max_buffer_size` is raised to the layout's `maxFrameLen` if smaller,
    /// so a legitimate frame can always finish reassembling.
    pub fn new(layout: Arc<ProtocolLayout>, max_buffer_size: usize, stale_after: Option<Duration>) -> Self {
        let max_frame_len = layout.frame.max_frame_len;
        if max_buffer_size < max_frame_len {
            warn!(
                "[Decoder] maxBufferSize {} is below maxFrameLen {}, using {}",
                max_buffer_size, max_frame_len, max_frame_len
            );
        }

        Self {
            layout,
            streams: HashMap::new(),
            max_buffer_size: max_buffer_size.max(max_frame_len),
            stale_after,
            stats: Arc::new(DecoderStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }

    /// Appends `payload` to its stream and yields every message it completes, in order.
    ///
    /// The iterator is lazy: frames it didn't get to stay buffered and come out
    /// ahead of the next payload's frames. Leftovers are bounded by
    /// `max_buffer_size` here, before the new bytes go in, so a caller that
    /// keeps stopping early loses its backlog (counted as a framing overflow)
    /// instead of growing the buffer forever.
    pub fn push(&mut self, payload: &RawPayload) -> DecodedEvents<'_> {
        let stale_after = self.stale_after;
        let buffer = self
            .streams
            .entry(payload.stream)
            .or_insert_with(|| PacketBuffer::new(stale_after));

        if let Some(dropped) = buffer.discard_if_oversized(self.max_buffer_size) {
            self.stats.framing_overflows.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[Decoder] FramingOverflow on {} -> {}: dropped {} unconsumed bytes",
                payload.stream.source, payload.stream.destination, dropped
            );
        }
        buffer.add(&payload.data);

        let mut events = DecodedEvents {
            layout: &self.layout,
            buffer,
            stats: &self.stats,
            stream: payload.stream,
            max_buffer_size: self.max_buffer_size,
        };
        events.account();
        events
    }

    /// Forgets all partially received messages.
    pub fn reset(&mut self) {
        self.streams.clear();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.streams.values().map(PacketBuffer::len).sum()
    }
}

pub struct DecodedEvents<'a> {
    layout: &'a ProtocolLayout,
    buffer: &'a mut PacketBuffer,
    stats: &'a DecoderStats,
    stream: StreamKey,
    max_buffer_size: usize,
}

impl DecodedEvents<'_> {
    // Moves the buffer's discard tallies into the shared counters.
    fn account(&mut self) {
        let dropped = self.buffer.take_discarded();
        if dropped > 0 {
            self.stats.discarded_bytes.fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(
                "[Decoder] {} -> {}: skipped {} bytes while resynchronizing",
                self.stream.source, self.stream.destination, dropped
            );
        }

        // A stream that produces nothing but garbage for this long isn't the protocol we expect
        if let Some(run) = self.buffer.take_garbage_run_over(self.max_buffer_size) {
            self.stats.framing_overflows.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[Decoder] FramingOverflow on {} -> {}: {} bytes without a valid frame",
                self.stream.source, self.stream.destination, run
            );
        }
    }
}

impl Iterator for DecodedEvents<'_> {
    type Item = DecodedEvent;

    fn next(&mut self) -> Option<DecodedEvent> {
        loop {
            let frame = self.buffer.next(&self.layout.frame);
            self.account();
            let frame = frame?;

            self.stats.messages.fetch_add(1, Ordering::Relaxed);

            match parse_frame(self.layout, &frame) {
                ParsedFrame::Event(event) => {
                    self.stats.events.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                ParsedFrame::Ignored { opcode } => {
                    self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                    trace!("[Decoder] opcode {:#06x} ignored ({} bytes)", opcode, frame.len());
                }
                ParsedFrame::Malformed { opcode } => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!("[Decoder] malformed opcode {:#06x} frame: {:?}", opcode, frame);
                }
            }
        }
    }
}
