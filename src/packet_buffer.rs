// src/packet_buffer.rs

use std::mem;
use std::time::{Duration, Instant};

use log::debug;

use crate::protocol::layout::FrameLayout;
use crate::protocol::parser::read_field;

/// Unconsumed bytes of one TCP stream, cut into frames as they complete.
///
/// Every byte thrown away (garbage before a marker, fake starts, stale or
/// oversized leftovers) is counted; collect the count with [`take_discarded`].
///
/// [`take_discarded`]: PacketBuffer::take_discarded
#[derive(Debug)]
pub struct PacketBuffer {
    buffer: Vec<u8>,
    last_success: Instant, // Last time a frame came out (or the buffer started filling)
    stale_after: Option<Duration>,
    discarded: usize,
    // Bytes skipped by resync since the last good frame
    garbage_run: usize,
}

impl PacketBuffer {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            buffer: Vec::with_capacity(65536),
            last_success: Instant::now(),
            stale_after,
            discarded: 0,
            garbage_run: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn add(&mut self, data: &[u8]) {
        let now = Instant::now();

        // WATCHDOG: a partial frame that has not completed in `stale_after`
        // belongs to a segment we never saw. Start over with this chunk.
        if !self.buffer.is_empty() {
            if let Some(limit) = self.stale_after {
                if now.duration_since(self.last_success) > limit {
                    debug!("[PacketBuffer] Watchdog: stale buffer (len={}). Resetting.", self.buffer.len());
                    self.discarded += self.buffer.len();
                    self.buffer.clear();
                    self.last_success = now;
                }
            }
        } else {
            // Start of a new frame; don't count the idle time before it.
            self.last_success = now;
        }

        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete frame off the front, or `None` if more bytes are needed.
    pub fn next(&mut self, layout: &FrameLayout) -> Option<Vec<u8>> {
        loop {
            // 1. Find the next possible start
            if !layout.magic.is_empty() {
                match find_subslice(&self.buffer, &layout.magic) {
                    Some(0) => {}
                    Some(idx) => self.skip(idx), // Drop any garbage before the marker
                    None => {
                        // Keep a tail that might be the first half of a split marker
                        let keep = layout.magic.len() - 1;
                        self.skip(self.buffer.len().saturating_sub(keep));
                        return None;
                    }
                }
            }

            // 2. Read the length field
            let (declared, header_end) = read_field(layout.length, &self.buffer)?; // Need more data

            // 3. SANITY CHECK: a length that can't be real means this start was fake
            let total = match frame_len(layout, declared, header_end) {
                Some(total) => total,
                None => {
                    self.skip(1);
                    continue;
                }
            };

            // 4. Extract full frame if available
            if self.buffer.len() >= total {
                let frame: Vec<u8> = self.buffer.drain(0..total).collect();
                self.last_success = Instant::now();
                self.garbage_run = 0;
                return Some(frame);
            }
            return None; // Wait for TCP segmentation to complete
        }
    }

    fn skip(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.buffer.drain(0..n);
        self.discarded += n;
        self.garbage_run += n;
    }

    /// Bytes thrown away since the last call.
    pub fn take_discarded(&mut self) -> usize {
        mem::take(&mut self.discarded)
    }

    /// Length of the current run of skipped bytes once it passes `bound`.
    /// The run starts over afterwards, so each long stretch of garbage reports once.
    pub fn take_garbage_run_over(&mut self, bound: usize) -> Option<usize> {
        if self.garbage_run <= bound {
            return None;
        }
        Some(mem::take(&mut self.garbage_run))
    }

    /// Throws away everything if the buffer holds more than `max` unconsumed bytes.
    /// Returns how many bytes were dropped.
    pub fn discard_if_oversized(&mut self, max: usize) -> Option<usize> {
        if self.buffer.len() <= max {
            return None;
        }
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.discarded += dropped;
        self.last_success = Instant::now();
        Some(dropped)
    }
}

fn frame_len(layout: &FrameLayout, declared: u64, header_end: usize) -> Option<usize> {
    let base = if layout.length_includes_header {
        i128::from(declared)
    } else {
        header_end as i128 + i128::from(declared)
    };
    let total = usize::try_from(base + i128::from(layout.length_adjust)).ok()?;

    if total == 0 || total < header_end || total > layout.max_frame_len {
        return None;
    }
    Some(total)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A safe Varint reader that returns (0,0) if the buffer ends before the Varint is finished
pub(crate) fn read_varint_safe(data: &[u8]) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0;
    let mut pos = 0;

    while pos < data.len() {
        let byte = data[pos];
        value |= ((byte & 0x7F) as u64) << shift;
        pos += 1;

        if (byte & 0x80) == 0 {
            return (value, pos);
        }

        shift += 7;
        if shift >= 64 { break; } // Prevent panic on corrupted data
    }

    // If we exit the loop but the last byte had the continuation bit set,
    // we don't have the full Varint yet.
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::layout::{FieldKind, FieldSpec};
    use crate::protocol::test_support::{damage_frame, test_layout, MAGIC};
    use crate::protocol::types::DamageEvent;

    fn hit(attacker: u64, amount: u64) -> Vec<u8> {
        damage_frame(&DamageEvent { attacker, target: 100, skill: 11_020_001, amount, crit: false })
    }

    #[test]
    fn frame_split_across_segments_waits_for_the_rest() {
        let layout = test_layout().frame;
        let frame = hit(1, 5000);
        let mut buf = PacketBuffer::new(None);

        buf.add(&frame[..3]);
        assert_eq!(buf.next(&layout), None);
        buf.add(&frame[3..10]);
        assert_eq!(buf.next(&layout), None);
        buf.add(&frame[10..]);
        assert_eq!(buf.next(&layout), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn concatenated_frames_come_out_in_order() {
        let layout = test_layout().frame;
        let (a, b, c) = (hit(1, 1), hit(2, 2), hit(3, 3));
        let mut buf = PacketBuffer::new(None);

        let mut chunk = a.clone();
        chunk.extend_from_slice(&b);
        chunk.extend_from_slice(&c[..4]);
        buf.add(&chunk);

        assert_eq!(buf.next(&layout), Some(a));
        assert_eq!(buf.next(&layout), Some(b));
        assert_eq!(buf.next(&layout), None);

        buf.add(&c[4..]);
        assert_eq!(buf.next(&layout), Some(c));
    }

    #[test]
    fn garbage_before_marker_is_skipped() {
        let layout = test_layout().frame;
        let frame = hit(9, 77);
        let mut buf = PacketBuffer::new(None);

        buf.add(&[0x00, 0xFF, 0x13, 0x37]);
        buf.add(&frame);
        assert_eq!(buf.next(&layout), Some(frame));
        assert_eq!(buf.take_discarded(), 4);
        assert_eq!(buf.take_discarded(), 0);
    }

    #[test]
    fn marker_split_between_segments_survives() {
        let layout = test_layout().frame;
        let frame = hit(4, 44);
        let mut buf = PacketBuffer::new(None);

        buf.add(&[0x01, 0x02, MAGIC[0]]);
        assert_eq!(buf.next(&layout), None);
        assert_eq!(buf.len(), 1);

        buf.add(&frame[1..]);
        assert_eq!(buf.next(&layout), Some(frame));
    }

    #[test]
    fn impossible_length_resynchronizes_on_next_marker() {
        let layout = test_layout().frame;
        let frame = hit(5, 55);
        let mut buf = PacketBuffer::new(None);

        // A fake marker claiming a 60000 byte body, larger than max_frame_len
        buf.add(&[MAGIC[0], MAGIC[1], 0x60, 0xEA]);
        buf.add(&frame);
        assert_eq!(buf.next(&layout), Some(frame));
        assert_eq!(buf.take_discarded(), 4);
    }

    #[test]
    fn oversized_buffer_is_discarded() {
        let layout = test_layout().frame;
        let frame = hit(6, 66);
        let mut buf = PacketBuffer::new(None);

        buf.add(&frame[..frame.len() - 1]);
        assert_eq!(buf.next(&layout), None);
        assert_eq!(buf.discard_if_oversized(4), Some(frame.len() - 1));
        assert!(buf.is_empty());
        assert_eq!(buf.discard_if_oversized(4), None);
        assert_eq!(buf.take_discarded(), frame.len() - 1);
    }

    #[test]
    fn long_garbage_run_reports_once_and_frames_reset_it() {
        let layout = test_layout().frame;
        let mut buf = PacketBuffer::new(None);

        buf.add(&[0x11; 300]);
        assert_eq!(buf.next(&layout), None);
        assert_eq!(buf.take_garbage_run_over(512), None);

        buf.add(&[0x22; 300]);
        assert_eq!(buf.next(&layout), None);
        assert_eq!(buf.take_garbage_run_over(512), Some(599));
        assert_eq!(buf.take_garbage_run_over(512), None);

        // A good frame ends the run
        buf.add(&[0x33; 100]);
        buf.add(&hit(8, 8));
        assert!(buf.next(&layout).is_some());
        buf.add(&[0x44; 500]);
        assert_eq!(buf.next(&layout), None);
        assert_eq!(buf.take_garbage_run_over(512), None);
    }

    #[test]
    fn stale_partial_frame_is_dropped_on_next_append() {
        let layout = test_layout().frame;
        let frame = hit(7, 70);
        let mut buf = PacketBuffer::new(Some(Duration::from_millis(1)));

        buf.add(&frame[..5]);
        std::thread::sleep(Duration::from_millis(20));
        buf.add(&frame);
        assert_eq!(buf.next(&layout), Some(frame));
        assert_eq!(buf.take_discarded(), 5);
    }

    #[test]
    fn length_including_header_without_marker() {
        let layout = FrameLayout {
            magic: Vec::new(),
            length: FieldSpec { offset: 0, kind: FieldKind::U32Be },
            length_includes_header: true,
            length_adjust: 0,
            max_frame_len: 1024,
        };
        let mut buf = PacketBuffer::new(None);
        buf.add(&[0, 0, 0, 6, 0xAB, 0xCD, 0, 0, 0, 5, 0xEF]);

        assert_eq!(buf.next(&layout), Some(vec![0, 0, 0, 6, 0xAB, 0xCD]));
        assert_eq!(buf.next(&layout), Some(vec![0, 0, 0, 5, 0xEF]));
        assert_eq!(buf.next(&layout), None);
    }

    #[test]
    fn varint_reader_handles_partial_input() {
        assert_eq!(read_varint_safe(&[0x96, 0x01]), (150, 2));
        assert_eq!(read_varint_safe(&[0x96]), (0, 0));
        assert_eq!(read_varint_safe(&[]), (0, 0));
    }
}
