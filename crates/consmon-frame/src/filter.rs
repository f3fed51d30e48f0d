use tracing::{debug, warn};

use crate::codec::Frame;
use crate::error::FrameError;
use crate::{DLE, EOF, MAX_BODY, SOF};

/// Output of feeding bytes through the [`FrameFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEvent {
    /// Bytes that belong to the interactive session; forward untouched.
    User(Vec<u8>),
    /// A frame that decoded cleanly between a delimiter pair.
    Frame(Frame),
}

/// Counters for everything the filter drops on the floor.
///
/// Decode failures are recovered locally and never surface as errors; the
/// counters exist so logs and tests can see them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    /// Frames rejected by the CRC check.
    pub crc_mismatch: u64,
    /// Frames rejected for structural reasons (length, escapes).
    pub malformed: u64,
    /// Frames abandoned before their closing delimiter (restarted by a new
    /// SOF, or timed out mid-frame).
    pub aborted: u64,
    /// In-frame buffers discarded because they hit the 64-byte window.
    pub overflow: u64,
}

/// Streaming separator of heartbeat frames and user bytes.
///
/// A two-state machine fed one byte at a time. Outside a frame it
/// accumulates user bytes and releases them at every flush boundary (next
/// SOF, EOF arrival, full window, or quiescence timeout), so interactive
/// output is never held longer than 0.5 s. Inside a frame it accumulates
/// the stuffed body; `DLE` marks the following byte as escaped so stuffed
/// delimiter bytes cannot fake a state transition.
///
/// The buffer always holds bytes exactly as read (pre-unstuff); decoding
/// happens once, at the closing delimiter.
pub struct FrameFilter {
    buffer: Vec<u8>,
    in_frame: bool,
    escape: bool,
    stats: FilterStats,
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameFilter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_BODY),
            in_frame: false,
            escape: false,
            stats: FilterStats::default(),
        }
    }

    /// Feed a chunk of received bytes, returning the events it produced.
    ///
    /// Events come out in stream order: all user bytes preceding a frame
    /// are emitted before the frame itself.
    pub fn push(&mut self, data: &[u8]) -> Vec<FilterEvent> {
        let mut out = Vec::new();
        for &byte in data {
            self.push_byte(byte, &mut out);
        }
        out
    }

    fn push_byte(&mut self, byte: u8, out: &mut Vec<FilterEvent>) {
        if self.escape {
            // Escaped byte: append verbatim, delimiter or not.
            self.escape = false;
            self.buffer.push(byte);
            self.enforce_window(out);
            return;
        }

        match byte {
            DLE => {
                self.buffer.push(byte);
                self.escape = true;
                self.enforce_window(out);
            }
            SOF => {
                if self.in_frame {
                    // The previous frame never closed; drop it and restart.
                    if !self.buffer.is_empty() {
                        self.stats.aborted += 1;
                        debug!(
                            dropped = self.buffer.len(),
                            "frame restarted by new SOF"
                        );
                    }
                    self.buffer.clear();
                } else {
                    self.emit_user(out);
                }
                self.escape = false;
                self.in_frame = true;
            }
            EOF => {
                if self.in_frame {
                    self.close_frame(out);
                    self.in_frame = false;
                } else {
                    // EOF outside a frame is a flush boundary (the trailing
                    // delimiters of a frame land here); the byte itself is
                    // consumed.
                    self.emit_user(out);
                }
                self.escape = false;
            }
            _ => {
                self.buffer.push(byte);
                self.enforce_window(out);
            }
        }
    }

    /// Quiescence flush: no byte has arrived for the filter timeout.
    ///
    /// Outside a frame the pending bytes are user data and are returned;
    /// inside a frame the partial frame is discarded. Either way the filter
    /// returns to idle.
    pub fn on_timeout(&mut self) -> Option<Vec<u8>> {
        self.escape = false;
        if self.in_frame {
            self.in_frame = false;
            if !self.buffer.is_empty() {
                self.stats.aborted += 1;
                debug!(dropped = self.buffer.len(), "partial frame timed out");
                self.buffer.clear();
            }
            None
        } else if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Drain whatever is pending, regardless of state. Used on shutdown so
    /// buffered user bytes still reach the terminal.
    pub fn flush(&mut self) -> Vec<u8> {
        self.in_frame = false;
        self.escape = false;
        std::mem::take(&mut self.buffer)
    }

    /// Whether bytes are waiting on a flush boundary.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Whether the filter is between an opening and closing delimiter.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    fn emit_user(&mut self, out: &mut Vec<FilterEvent>) {
        if !self.buffer.is_empty() {
            out.push(FilterEvent::User(std::mem::take(&mut self.buffer)));
        }
    }

    fn close_frame(&mut self, out: &mut Vec<FilterEvent>) {
        if self.buffer.is_empty() {
            // Adjacent delimiters (SOF³ … EOF³ produce these); not a frame.
            return;
        }
        match Frame::decode(&self.buffer) {
            Ok(frame) => {
                if !frame.is_heartbeat() {
                    warn!(frame_type = frame.frame_type, "unknown frame type");
                }
                out.push(FilterEvent::Frame(frame));
            }
            Err(FrameError::CrcMismatch { expected, received }) => {
                self.stats.crc_mismatch += 1;
                debug!(expected, received, "frame dropped: CRC mismatch");
            }
            Err(err) => {
                self.stats.malformed += 1;
                debug!(%err, "frame dropped");
            }
        }
        self.buffer.clear();
    }

    fn enforce_window(&mut self, out: &mut Vec<FilterEvent>) {
        if self.buffer.len() < MAX_BODY {
            return;
        }
        if self.in_frame {
            // Too long to be a valid frame; nothing in it is user data.
            self.stats.overflow += 1;
            debug!("in-frame buffer overflowed, discarding");
            self.buffer.clear();
            self.in_frame = false;
        } else {
            self.emit_user(out);
        }
        self.escape = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::PROTOCOL_VERSION, crc::crc16, EOF, SOF};

    fn heartbeat_wire(seq: u8) -> Vec<u8> {
        Frame::heartbeat(seq).build().unwrap()
    }

    fn user_bytes(events: &[FilterEvent]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            if let FilterEvent::User(bytes) = event {
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    fn frames(events: &[FilterEvent]) -> Vec<&Frame> {
        events
            .iter()
            .filter_map(|e| match e {
                FilterEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_user_bytes_pass_through_on_timeout() {
        let mut filter = FrameFilter::new();
        let events = filter.push(b"Hello\r\n");
        assert!(events.is_empty(), "no flush boundary seen yet");
        assert!(filter.has_pending());

        let flushed = filter.on_timeout().unwrap();
        assert_eq!(flushed, b"Hello\r\n");
        assert_eq!(filter.stats(), FilterStats::default());
    }

    #[test]
    fn single_heartbeat_decodes() {
        let mut filter = FrameFilter::new();
        let events = filter.push(&heartbeat_wire(0));
        let found = frames(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].seq, 0);
        assert!(found[0].is_heartbeat());
        assert!(user_bytes(&events).is_empty());
        assert!(!filter.has_pending());
    }

    #[test]
    fn interleaved_user_and_frame() {
        // "AB" + heartbeat + "CD\n" must yield exactly "ABCD\n" and one
        // decode, user bytes first.
        let mut filter = FrameFilter::new();
        let mut stream = b"AB".to_vec();
        stream.extend_from_slice(&heartbeat_wire(0));
        stream.extend_from_slice(b"CD\n");

        let mut events = filter.push(&stream);
        if let Some(tail) = filter.on_timeout() {
            events.push(FilterEvent::User(tail));
        }

        assert_eq!(user_bytes(&events), b"ABCD\n");
        assert_eq!(frames(&events).len(), 1);
        assert!(matches!(events[0], FilterEvent::User(ref b) if b == b"AB"));
        assert!(matches!(events[1], FilterEvent::Frame(_)));
    }

    #[test]
    fn byte_at_a_time_delivery() {
        // Mid-stream reader entry means reads of any size; one byte at a
        // time is the worst case.
        let mut filter = FrameFilter::new();
        let mut stream = b"x".to_vec();
        stream.extend_from_slice(&heartbeat_wire(9));
        stream.extend_from_slice(b"y");

        let mut events = Vec::new();
        for &b in &stream {
            events.extend(filter.push(&[b]));
        }
        if let Some(tail) = filter.on_timeout() {
            events.push(FilterEvent::User(tail));
        }

        assert_eq!(user_bytes(&events), b"xy");
        assert_eq!(frames(&events)[0].seq, 9);
    }

    #[test]
    fn truncated_frame_discarded_on_timeout() {
        let mut filter = FrameFilter::new();
        // Opening delimiters plus a partial body, no EOF.
        let events = filter.push(&[0x01, 0x01, 0x01, 0x10, 0x01, 0x00, 0x00]);
        assert!(events.is_empty());
        assert!(filter.in_frame());

        assert_eq!(filter.on_timeout(), None);
        assert!(!filter.in_frame());
        assert_eq!(filter.stats().aborted, 1);
    }

    #[test]
    fn crc_error_emits_nothing() {
        let mut wire = heartbeat_wire(0);
        let idx = wire.len() - 4; // low CRC byte (0x18 -> 0x19)
        assert_eq!(wire[idx], 0x18);
        wire[idx] = 0x19;

        let mut filter = FrameFilter::new();
        let mut events = filter.push(&wire);
        if let Some(tail) = filter.on_timeout() {
            events.push(FilterEvent::User(tail));
        }

        assert!(events.is_empty());
        assert_eq!(filter.stats().crc_mismatch, 1);
    }

    #[test]
    fn corrupt_interval_never_leaks_user_bytes() {
        // Garbage between delimiters must not reach the user stream.
        let mut filter = FrameFilter::new();
        let mut stream = vec![SOF, SOF, SOF];
        stream.extend_from_slice(b"not a frame at all");
        stream.extend_from_slice(&[EOF, EOF, EOF]);

        let events = filter.push(&stream);
        assert!(user_bytes(&events).is_empty());
        assert!(frames(&events).is_empty());
        assert_eq!(filter.stats().crc_mismatch + filter.stats().malformed, 1);
    }

    #[test]
    fn sof_restarts_a_truncated_frame() {
        let mut filter = FrameFilter::new();
        // A frame cut short by the next frame's opening delimiter.
        let mut stream = vec![SOF, 0x42, 0x42, 0x42];
        stream.extend_from_slice(&heartbeat_wire(3));

        let events = filter.push(&stream);
        assert_eq!(frames(&events).len(), 1);
        assert_eq!(frames(&events)[0].seq, 3);
        assert!(user_bytes(&events).is_empty());
        assert_eq!(filter.stats().aborted, 1);
    }

    #[test]
    fn stuffed_delimiters_inside_body_do_not_restart() {
        // The seq=0 heartbeat body contains two stuffed SOF bytes; the
        // escape tracking must carry them through as data.
        let mut filter = FrameFilter::new();
        let events = filter.push(&heartbeat_wire(0));
        assert_eq!(frames(&events).len(), 1);
        assert_eq!(filter.stats().aborted, 0);
    }

    #[test]
    fn idle_overflow_flushes_user_bytes() {
        let mut filter = FrameFilter::new();
        let chunk = vec![0x41u8; 200];
        let events = filter.push(&chunk);

        // Three full windows released, remainder pending.
        assert_eq!(user_bytes(&events).len(), 192);
        assert_eq!(filter.on_timeout().unwrap().len(), 8);
        assert_eq!(filter.stats().overflow, 0);
    }

    #[test]
    fn in_frame_overflow_discards_and_resets() {
        let mut filter = FrameFilter::new();
        let mut stream = vec![SOF];
        stream.extend_from_slice(&[0x42u8; 64]);
        stream.extend_from_slice(b"after");

        let mut events = filter.push(&stream);
        if let Some(tail) = filter.on_timeout() {
            events.push(FilterEvent::User(tail));
        }

        assert_eq!(filter.stats().overflow, 1);
        // Once the window overflowed the filter is idle again, so
        // subsequent bytes are user data.
        assert_eq!(user_bytes(&events), b"after");
    }

    #[test]
    fn back_to_back_heartbeats() {
        let mut filter = FrameFilter::new();
        let mut stream = Vec::new();
        for seq in 0..5u8 {
            stream.extend_from_slice(&heartbeat_wire(seq));
        }
        let events = filter.push(&stream);
        let found = frames(&events);
        assert_eq!(found.len(), 5);
        for (i, frame) in found.iter().enumerate() {
            assert_eq!(frame.seq, i as u8);
        }
        assert!(user_bytes(&events).is_empty());
    }

    #[test]
    fn user_bytes_precede_liveness_event_in_same_read() {
        // Ordering guarantee: a frame's event comes after the user bytes
        // that preceded it in the stream.
        let mut filter = FrameFilter::new();
        let mut stream = b"prompt> ".to_vec();
        stream.extend_from_slice(&heartbeat_wire(1));

        let events = filter.push(&stream);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], FilterEvent::User(_)));
        assert!(matches!(events[1], FilterEvent::Frame(_)));
    }

    #[test]
    fn non_heartbeat_type_is_decoded_but_flagged() {
        let mut body = vec![PROTOCOL_VERSION, 0x00, 0x00, 0x7F, 0x00];
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_be_bytes());

        let mut wire = vec![SOF, SOF, SOF];
        wire.extend_from_slice(&crate::codec::stuff(&body));
        wire.extend_from_slice(&[EOF, EOF, EOF]);

        let mut filter = FrameFilter::new();
        let events = filter.push(&wire);
        let found = frames(&events);
        assert_eq!(found.len(), 1);
        assert!(!found[0].is_heartbeat());
    }

    #[test]
    fn flush_returns_pending_bytes_in_any_state() {
        let mut filter = FrameFilter::new();
        filter.push(b"tail");
        assert_eq!(filter.flush(), b"tail");

        filter.push(&[SOF, 0x42]);
        assert!(filter.in_frame());
        assert_eq!(filter.flush(), &[0x42]);
        assert!(!filter.in_frame());
    }
}
