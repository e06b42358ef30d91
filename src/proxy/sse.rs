// SPDX-License-Identifier: MIT
//! Incremental SSE scanner for usage extraction.
//!
//! The proxy forwards stream chunks verbatim; this scanner watches the same
//! bytes on the side and pulls the `usage` object out of the event stream
//! without ever buffering the full response. Memory is bounded: only the
//! current partial event is held, and a runaway event is discarded once it
//! exceeds the cap (usage events are tiny; oversized events can only be
//! content we have no need to parse).
//!
//! Events are delimited by a blank line (`\n\n` or `\r\n\r\n`). The sentinel
//! `data: [DONE]` terminates the stream. Any `data:` payload parseable as
//! JSON whose top-level `usage` field carries the three token counts updates
//! the "latest usage" buffer; the value present at stream end wins.

use serde::Deserialize;

/// A single event may not exceed this without being discarded unparsed.
const MAX_EVENT_BYTES: usize = 256 * 1024;

/// Token counts reported by the upstream runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UpstreamUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UpstreamUsage {
    /// The sum invariant the rest of the pipeline relies on. A violation is
    /// upstream corruption and surfaces as a protocol error.
    pub fn consistent(&self) -> bool {
        self.prompt_tokens + self.completion_tokens == self.total_tokens
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    usage: Option<UpstreamUsage>,
}

/// Stateful scanner fed with raw stream chunks as they are forwarded.
#[derive(Debug, Default)]
pub struct SseScanner {
    buf: Vec<u8>,
    latest_usage: Option<UpstreamUsage>,
    done: bool,
    /// Total payload bytes observed — the tokenizer-estimate fallback input.
    stream_bytes: u64,
    oversized: bool,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one forwarded chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.stream_bytes += chunk.len() as u64;
        if self.done {
            return;
        }
        self.buf.extend_from_slice(chunk);

        while let Some((event_end, delim_len)) = find_delimiter(&self.buf) {
            let event: Vec<u8> = self.buf.drain(..event_end + delim_len).collect();
            self.scan_event(&event[..event_end]);
            if self.done {
                self.buf.clear();
                return;
            }
        }

        if self.buf.len() > MAX_EVENT_BYTES {
            if !self.oversized {
                tracing::warn!("sse event exceeded {MAX_EVENT_BYTES} bytes — discarded unparsed");
                self.oversized = true;
            }
            self.buf.clear();
        }
    }

    fn scan_event(&mut self, event: &[u8]) {
        let Ok(text) = std::str::from_utf8(event) else {
            return;
        };
        for line in text.lines() {
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.done = true;
                return;
            }
            if let Ok(envelope) = serde_json::from_str::<EventEnvelope>(payload) {
                if let Some(usage) = envelope.usage {
                    self.latest_usage = Some(usage);
                }
            }
        }
    }

    /// Whether the `[DONE]` sentinel has been observed.
    pub fn finished(&self) -> bool {
        self.done
    }

    /// The last usage object seen so far, if any.
    pub fn latest_usage(&self) -> Option<UpstreamUsage> {
        self.latest_usage
    }

    /// Total bytes observed on the stream.
    pub fn stream_bytes(&self) -> u64 {
        self.stream_bytes
    }
}

/// Earliest event delimiter in `buf`: `\n\n` or `\r\n\r\n`, whichever comes
/// first. Returns (index of delimiter start, delimiter length).
fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buf, b"\n\n").map(|i| (i, 2));
    let crlf = find_subslice(buf, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Rough token estimate used when the upstream emitted no usage: one token
/// per four payload bytes. Documented as an approximation; never negative.
pub fn estimate_tokens_from_bytes(bytes: u64) -> u64 {
    bytes / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage_event(prompt: u64, completion: u64) -> String {
        format!(
            "data: {{\"choices\":[],\"usage\":{{\"prompt_tokens\":{prompt},\"completion_tokens\":{completion},\"total_tokens\":{}}}}}\n\n",
            prompt + completion
        )
    }

    #[test]
    fn extracts_usage_from_final_event() {
        let mut scanner = SseScanner::new();
        scanner.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n");
        scanner.feed(usage_event(10, 5).as_bytes());
        scanner.feed(b"data: [DONE]\n\n");

        assert!(scanner.finished());
        let usage = scanner.latest_usage().unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert!(usage.consistent());
    }

    #[test]
    fn latest_usage_wins() {
        let mut scanner = SseScanner::new();
        scanner.feed(usage_event(10, 1).as_bytes());
        scanner.feed(usage_event(10, 7).as_bytes());
        scanner.feed(b"data: [DONE]\n\n");
        assert_eq!(scanner.latest_usage().unwrap().completion_tokens, 7);
    }

    #[test]
    fn handles_events_split_across_chunks() {
        let event = usage_event(3, 4);
        let bytes = event.as_bytes();
        let mut scanner = SseScanner::new();
        // Feed one byte at a time — worst-case fragmentation.
        for b in bytes {
            scanner.feed(std::slice::from_ref(b));
        }
        assert_eq!(scanner.latest_usage().unwrap().total_tokens, 7);
    }

    #[test]
    fn handles_crlf_delimiters() {
        let mut scanner = SseScanner::new();
        scanner.feed(
            b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\r\n\r\n",
        );
        scanner.feed(b"data: [DONE]\r\n\r\n");
        assert!(scanner.finished());
        assert_eq!(scanner.latest_usage().unwrap().total_tokens, 3);
    }

    #[test]
    fn no_usage_stream_yields_byte_estimate() {
        let mut scanner = SseScanner::new();
        scanner.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hello world\"}}]}\n\n");
        scanner.feed(b"data: [DONE]\n\n");
        assert!(scanner.latest_usage().is_none());
        assert!(estimate_tokens_from_bytes(scanner.stream_bytes()) > 0);
        // Estimates are never negative — a zero-byte stream estimates zero.
        assert_eq!(estimate_tokens_from_bytes(0), 0);
    }

    #[test]
    fn inconsistent_usage_detected() {
        let mut scanner = SseScanner::new();
        scanner.feed(
            b"data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":5,\"total_tokens\":11}}\n\n",
        );
        let usage = scanner.latest_usage().unwrap();
        assert!(!usage.consistent());
    }

    #[test]
    fn oversized_event_is_discarded_not_fatal() {
        let mut scanner = SseScanner::new();
        let huge = vec![b'x'; MAX_EVENT_BYTES + 10];
        scanner.feed(&huge);
        // Scanner keeps working after the discard.
        scanner.feed(usage_event(1, 1).as_bytes());
        scanner.feed(b"data: [DONE]\n\n");
        assert!(scanner.finished());
        assert_eq!(scanner.latest_usage().unwrap().total_tokens, 2);
    }

    #[test]
    fn data_after_done_is_ignored() {
        let mut scanner = SseScanner::new();
        scanner.feed(b"data: [DONE]\n\n");
        scanner.feed(usage_event(9, 9).as_bytes());
        assert!(scanner.latest_usage().is_none());
    }
}
