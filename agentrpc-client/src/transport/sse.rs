//! Incremental Server-Sent Events parser.
//!
//! Feeds on body chunks as they arrive and yields the `data:` payload of
//! each complete event. Per the wire contract, only `data:` matters:
//! `id:`, `event:`, `retry:`, and comment lines are ignored. Chunk
//! boundaries may fall anywhere, including inside a UTF-8 sequence or
//! between `\r` and `\n`.

use bytes::{Bytes, BytesMut};

/// Streaming SSE parser.
#[derive(Default)]
pub struct SseParser {
    buf: BytesMut,
    /// `data:` lines of the event currently being assembled.
    data: Vec<Bytes>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk; returns the payloads of every event completed by
    /// it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos); // drop the \n
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                // Blank line: event boundary.
                if let Some(payload) = self.take_event() {
                    events.push(payload);
                }
                continue;
            }
            if line[0] == b':' {
                continue; // comment (e.g. keep-alive)
            }

            let line = line.freeze();
            let (field, value) = match line.iter().position(|&b| b == b':') {
                Some(colon) => {
                    let value_start = if line.get(colon + 1) == Some(&b' ') {
                        colon + 2
                    } else {
                        colon + 1
                    };
                    (line.slice(..colon), line.slice(value_start..))
                }
                None => (line.clone(), Bytes::new()),
            };

            if field.as_ref() == b"data" {
                self.data.push(value);
            }
            // id:, event:, retry:, unknown fields: ignored.
        }

        events
    }

    fn take_event(&mut self) -> Option<Bytes> {
        if self.data.is_empty() {
            return None;
        }
        let lines = std::mem::take(&mut self.data);
        if lines.len() == 1 {
            return lines.into_iter().next();
        }
        // Multi-line data joins with \n per the SSE spec.
        let mut joined = BytesMut::new();
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                joined.extend_from_slice(b"\n");
            }
            joined.extend_from_slice(line);
        }
        Some(joined.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut SseParser, input: &[u8]) -> Vec<String> {
        parser
            .push(input)
            .into_iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = collect(&mut parser, b"data: {\"a\":1}\n\n");
        assert_eq!(events, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"da").is_empty());
        assert!(parser.push(b"ta: hel").is_empty());
        let events = collect(&mut parser, b"lo\n\n");
        assert_eq!(events, vec!["hello"]);
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = collect(&mut parser, b"data: one\n\ndata: two\n\n");
        assert_eq!(events, vec!["one", "two"]);
    }

    #[test]
    fn test_crlf_lines() {
        let mut parser = SseParser::new();
        let events = collect(&mut parser, b"data: one\r\n\r\n");
        assert_eq!(events, vec!["one"]);
    }

    #[test]
    fn test_other_fields_and_comments_ignored() {
        let mut parser = SseParser::new();
        let events = collect(
            &mut parser,
            b": keepalive\nid: 7\nevent: envelope\nretry: 100\ndata: payload\n\n",
        );
        assert_eq!(events, vec!["payload"]);
    }

    #[test]
    fn test_multi_data_lines_join_with_newline() {
        let mut parser = SseParser::new();
        let events = collect(&mut parser, b"data: line1\ndata: line2\n\n");
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn test_blank_line_without_data_yields_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"\n\n: ping\n\n").is_empty());
    }

    #[test]
    fn test_no_space_after_colon() {
        let mut parser = SseParser::new();
        let events = collect(&mut parser, b"data:tight\n\n");
        assert_eq!(events, vec!["tight"]);
    }
}
