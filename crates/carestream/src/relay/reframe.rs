//! SSE event reframing
//!
//! Upstream bytes arrive chunked at arbitrary boundaries with no alignment
//! to SSE events. [`EventReframer`] accumulates decoded text, re-splits it
//! on the event delimiter, runs each complete event through the repair
//! pipeline, and hands back fully framed outbound events. At most one
//! partial (unterminated) event is ever buffered.

use thiserror::Error;

use super::repair::{parse_failure_event, repair_event};

/// SSE event delimiter: two consecutive newlines.
pub const EVENT_DELIMITER: &str = "\n\n";

/// Prefix of an SSE data line.
pub const DATA_PREFIX: &str = "data:";

/// Payload literal marking the logical end of the producer's output.
///
/// The sentinel is forwarded as-is and never parsed as JSON. It does not
/// terminate the read loop; the loop ends when the upstream socket closes.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Errors produced while reframing an upstream stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReframeError {
    /// A single event grew past the configured bound
    #[error("Event exceeds the {limit}-byte limit")]
    EventTooLarge {
        /// The configured bound in bytes
        limit: usize,
    },
}

/// Result of feeding one chunk: the frames it completed, plus a terminal
/// error if the event-size bound was breached.
///
/// Frames completed ahead of the offending event are still returned, so
/// the forwarded sequence does not depend on how upstream chunked the
/// bytes.
#[derive(Debug, Default, PartialEq)]
pub struct PushOutcome {
    pub frames: Vec<String>,
    pub error: Option<ReframeError>,
}

/// Incremental UTF-8 decoder that carries incomplete multi-byte sequences
/// across chunk boundaries.
///
/// A chunk may end mid-character; the trailing incomplete bytes (at most 3)
/// are held back and prepended to the next chunk. Bytes that are invalid
/// UTF-8 outright decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, combining it with any carried-over bytes.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let joined;
        let mut rest: &[u8] = if self.carry.is_empty() {
            chunk
        } else {
            let mut bytes = std::mem::take(&mut self.carry);
            bytes.extend_from_slice(chunk);
            joined = bytes;
            &joined
        };

        let mut out = String::with_capacity(rest.len());
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match err.error_len() {
                        // Genuinely invalid sequence: replace and move on
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + len..];
                        }
                        // Incomplete trailing sequence: hold it for the next chunk
                        None => {
                            self.carry = rest[valid_up_to..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Stateful reframer that turns arbitrarily-chunked upstream bytes into
/// complete, repaired SSE frames.
pub struct EventReframer {
    decoder: Utf8Decoder,
    buffer: String,
    max_event_bytes: usize,
}

impl EventReframer {
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            decoder: Utf8Decoder::new(),
            buffer: String::new(),
            max_event_bytes,
        }
    }

    /// Feed one upstream chunk; returns every frame completed by it.
    ///
    /// Each returned frame is terminated by exactly one event delimiter.
    /// Frames come back in the order their terminating delimiter appeared
    /// in the cumulative byte stream. A trailing unterminated block at
    /// upstream close is never flushed; the wire contract is that every
    /// event ends with the delimiter.
    ///
    /// The size bound applies to each event block, delimiter excluded, and
    /// is checked both when a block completes and on the buffered
    /// remainder. The same byte stream therefore trips the bound at the
    /// same point in the output no matter where the chunk boundaries fall.
    pub fn push(&mut self, chunk: &[u8]) -> PushOutcome {
        self.buffer.push_str(&self.decoder.decode(chunk));

        let mut outcome = PushOutcome::default();
        while let Some(pos) = self.buffer.find(EVENT_DELIMITER) {
            if pos > self.max_event_bytes {
                outcome.error = Some(self.bound_breached());
                return outcome;
            }
            let block: String = self
                .buffer
                .drain(..pos + EVENT_DELIMITER.len())
                .collect();
            if let Some(frame) = reframe_block(&block[..pos]) {
                outcome.frames.push(frame);
            }
        }

        // The remainder may legally hold a bound-sized block plus the first
        // byte of its delimiter; anything longer can never complete within
        // the bound.
        if self.buffer.len() > self.max_event_bytes + 1 {
            outcome.error = Some(self.bound_breached());
        }

        outcome
    }

    fn bound_breached(&self) -> ReframeError {
        ReframeError::EventTooLarge {
            limit: self.max_event_bytes,
        }
    }
}

/// Process one complete event block (delimiter already stripped).
///
/// Returns the outbound frame, or `None` when the block is dropped (blank
/// blocks and repaired-away events).
fn reframe_block(block: &str) -> Option<String> {
    if let Some(raw) = block.strip_prefix(DATA_PREFIX) {
        let payload = raw.trim();
        if payload == DONE_SENTINEL {
            return Some(format!("{DATA_PREFIX} {DONE_SENTINEL}{EVENT_DELIMITER}"));
        }
        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(event) => {
                repair_event(event).map(|e| format!("{DATA_PREFIX} {e}{EVENT_DELIMITER}"))
            }
            Err(err) => {
                tracing::warn!("unparseable event payload, substituting error event: {err}");
                let error_event = parse_failure_event(&err.to_string(), payload);
                Some(format!("{DATA_PREFIX} {error_event}{EVENT_DELIMITER}"))
            }
        }
    } else if !block.trim().is_empty() {
        // Non-data fields (comments, retry directives) pass through uninterpreted
        Some(format!("{block}{EVENT_DELIMITER}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    /// Feed a byte stream in one go and return the forwarded frames.
    fn reframe_all(input: &[u8]) -> Vec<String> {
        let outcome = EventReframer::new(1024 * 1024).push(input);
        assert_eq!(outcome.error, None);
        outcome.frames
    }

    /// Extract the JSON payload of a `data:` frame.
    fn payload(frame: &str) -> Value {
        let inner = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(inner).unwrap()
    }

    #[test]
    fn test_valid_chunk_forwarded_unmodified() {
        let frames =
            reframe_all(b"data: {\"type\":\"section_reasoning_chunk\",\"content\":\"Assessing...\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(
            payload(&frames[0]),
            json!({"type": "section_reasoning_chunk", "content": "Assessing..."})
        );
    }

    #[test]
    fn test_every_frame_has_single_delimiter() {
        let frames = reframe_all(
            b"data: {\"type\":\"a\"}\n\n: comment\n\ndata: [DONE]\n\ndata: {\"type\":\"b\"}\n\n",
        );
        assert_eq!(frames.len(), 4);
        for frame in &frames {
            assert!(frame.ends_with("\n\n"));
            assert!(!frame[..frame.len() - 2].contains("\n\n"));
        }
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let stream: &[u8] =
            b"data: {\"type\":\"section_reasoning_chunk\",\"content\":\"ab\"}\n\ndata: [DONE]\n\n";

        let whole = reframe_all(stream);

        // Same bytes, every possible split point
        for split in 0..stream.len() {
            let mut reframer = EventReframer::new(1024 * 1024);
            let mut first = reframer.push(&stream[..split]);
            let second = reframer.push(&stream[split..]);
            assert_eq!(first.error.or(second.error), None, "split at {split}");
            first.frames.extend(second.frames);
            assert_eq!(first.frames, whole, "split at {split}");
        }
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let stream =
            "data: {\"type\":\"section_reasoning_chunk\",\"content\":\"vitals ✓ 37°C\"}\n\n"
                .as_bytes();
        let whole = reframe_all(stream);

        for split in 0..stream.len() {
            let mut reframer = EventReframer::new(1024 * 1024);
            let mut first = reframer.push(&stream[..split]);
            let second = reframer.push(&stream[split..]);
            assert_eq!(first.error.or(second.error), None, "split at {split}");
            first.frames.extend(second.frames);
            assert_eq!(first.frames, whole, "split at {split}");
        }

        assert_eq!(
            payload(&whole[0])["content"].as_str().unwrap(),
            "vitals ✓ 37°C"
        );
    }

    #[test]
    fn test_utf8_decoder_carries_partial_sequence() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "é".as_bytes(); // two bytes
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "é");
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_done_sentinel_forwarded_not_parsed() {
        let frames = reframe_all(b"data: [DONE]\n\n");
        assert_eq!(frames, vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn test_events_after_done_still_forwarded() {
        // Sentinel does not end the loop; termination is socket-driven
        let frames = reframe_all(b"data: [DONE]\n\ndata: {\"type\":\"late\"}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(payload(&frames[1]), json!({"type": "late"}));
    }

    #[test]
    fn test_non_data_lines_pass_through() {
        let frames = reframe_all(b": keepalive\n\nretry: 3000\n\n");
        assert_eq!(
            frames,
            vec![": keepalive\n\n".to_string(), "retry: 3000\n\n".to_string()]
        );
    }

    #[test]
    fn test_blank_blocks_dropped() {
        let frames = reframe_all(b"\n\n  \n\ndata: [DONE]\n\n");
        assert_eq!(frames, vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn test_empty_content_chunk_dropped() {
        let frames =
            reframe_all(b"data: {\"type\":\"section_reasoning_chunk\",\"content\":\"  \"}\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn test_missing_markdown_injected() {
        let frames = reframe_all(b"data: {\"type\":\"section_reasoning_complete\"}\n\n");
        assert_eq!(frames.len(), 1);
        let event = payload(&frames[0]);
        assert_eq!(
            event["full_reasoning_markdown"].as_str().unwrap(),
            "**AI Reasoning**\n\nGenerating clinical reasoning for this section..."
        );
    }

    #[test]
    fn test_invalid_sources_replaced() {
        let frames = reframe_all(b"data: {\"type\":\"sources_data\",\"data\":\"not-an-array\"}\n\n");
        let event = payload(&frames[0]);
        assert_eq!(
            event["data"],
            json!([{
                "title": "No citations available",
                "url": "#",
                "snippet": "Citations data could not be retrieved from the AI."
            }])
        );
    }

    #[test]
    fn test_malformed_payload_becomes_error_event() {
        let frames = reframe_all(b"data: {bad json\n\ndata: {\"type\":\"ok\"}\n\n");
        assert_eq!(frames.len(), 2);

        let error = payload(&frames[0]);
        assert_eq!(error["type"], "section_error");
        let content = error["content"].as_str().unwrap();
        assert!(content.contains("Failed to parse event"));
        assert!(content.contains("{bad json"));

        // Stream continues past the malformed event
        assert_eq!(payload(&frames[1]), json!({"type": "ok"}));
    }

    #[test]
    fn test_round_trip_preserves_field_values() {
        let original = json!({
            "type": "sources_data",
            "data": [{"title": "t", "url": "u", "snippet": "s"}],
            "extra": {"nested": [1, 2, 3]}
        });
        let wire = format!("data: {original}\n\n");
        let frames = reframe_all(wire.as_bytes());
        assert_eq!(payload(&frames[0]), original);
    }

    #[test]
    fn test_partial_event_never_forwarded() {
        let mut reframer = EventReframer::new(1024 * 1024);
        let outcome = reframer.push(b"data: {\"type\":\"section_reason");
        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn test_oversized_pending_event_rejected() {
        let mut reframer = EventReframer::new(64);
        let big = vec![b'x'; 128];
        let outcome = reframer.push(&big);
        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.error, Some(ReframeError::EventTooLarge { limit: 64 }));
    }

    #[test]
    fn test_oversized_complete_event_rejected() {
        // A block over the bound is rejected even when its delimiter
        // arrives in the same chunk
        let mut reframer = EventReframer::new(64);
        let mut big = vec![b'x'; 128];
        big.extend_from_slice(b"\n\n");
        let outcome = reframer.push(&big);
        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.error, Some(ReframeError::EventTooLarge { limit: 64 }));
    }

    #[test]
    fn test_size_bound_is_chunk_boundary_independent() {
        let wire = format!(
            "data: {{\"type\":\"section_reasoning_chunk\",\"content\":\"{}\"}}\n\n",
            "a".repeat(70)
        );
        let bytes = wire.as_bytes();

        let whole = EventReframer::new(64).push(bytes);
        assert!(whole.frames.is_empty());
        assert_eq!(whole.error, Some(ReframeError::EventTooLarge { limit: 64 }));

        // The same bytes split mid-event must be rejected identically
        for split in [40, 66, 80, bytes.len() - 1] {
            let mut reframer = EventReframer::new(64);
            let first = reframer.push(&bytes[..split]);
            assert!(first.frames.is_empty(), "split at {split}");
            let second = reframer.push(&bytes[split..]);
            assert!(second.frames.is_empty(), "split at {split}");
            assert_eq!(
                first.error.or(second.error),
                whole.error,
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_event_at_bound_accepted_any_split() {
        // Block of exactly the bound (delimiter excluded) always passes
        let wire = format!("{}\n\n", "a".repeat(64));
        let bytes = wire.as_bytes();

        for split in 0..bytes.len() {
            let mut reframer = EventReframer::new(64);
            let mut first = reframer.push(&bytes[..split]);
            let second = reframer.push(&bytes[split..]);
            assert_eq!(first.error.or(second.error), None, "split at {split}");
            first.frames.extend(second.frames);
            assert_eq!(first.frames.len(), 1, "split at {split}");
        }
    }

    #[test]
    fn test_frames_before_oversized_event_still_forwarded() {
        let mut wire = b"data: {\"type\":\"ok\"}\n\n".to_vec();
        wire.extend_from_slice(
            format!("data: {{\"content\":\"{}\"}}\n\n", "a".repeat(80)).as_bytes(),
        );

        let outcome = EventReframer::new(64).push(&wire);
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(payload(&outcome.frames[0]), json!({"type": "ok"}));
        assert_eq!(outcome.error, Some(ReframeError::EventTooLarge { limit: 64 }));
    }

    #[test]
    fn test_frames_preserve_upstream_order() {
        let frames = reframe_all(
            b"data: {\"type\":\"a\"}\n\ndata: {\"type\":\"b\"}\n\ndata: {\"type\":\"c\"}\n\n",
        );
        let types: Vec<String> = frames
            .iter()
            .map(|f| payload(f)["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, ["a", "b", "c"]);
    }
}
