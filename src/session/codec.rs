//! Telemetry stream framing.
//!
//! The firmware writes JSON objects back to back with no delimiter, so a TCP
//! read may carry half a record or several. This codec yields one frame per
//! top-level object. Bytes outside an object come out as their own (malformed)
//! frame so the session can account for them. A record cut short by the
//! device ends at the next opening brace rather than absorbing what follows.

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Largest object accepted before it is cut and treated as malformed
pub const MAX_FRAME: usize = 4096;

#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_frame: usize,
}

impl RecordCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME)
    }
}

/// End of the frame starting at buf[0] (an opening brace).
///
/// Records are flat, so a second `{` outside a string means the current one
/// was cut short; the frame ends just before it and the next record starts
/// clean.
fn frame_end(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' if depth > 0 => return Some(i),
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

impl Decoder for RecordCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        let Some(start) = buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            buf.clear();
            return Ok(None);
        };
        buf.advance(start);

        if buf[0] != b'{' {
            let end = buf.iter().position(|&b| b == b'{').unwrap_or(buf.len());
            return Ok(Some(buf.split_to(end)));
        }

        match frame_end(buf) {
            Some(end) => Ok(Some(buf.split_to(end))),
            None if buf.len() > self.max_frame => {
                let len = buf.len();
                Ok(Some(buf.split_to(len)))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        // truncated object at close
        if buf.is_empty() {
            Ok(None)
        } else {
            let len = buf.len();
            Ok(Some(buf.split_to(len)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(codec: &mut RecordCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(String::from_utf8_lossy(&frame).into_owned());
        }
        out
    }

    #[test]
    fn test_back_to_back_objects() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"{"rssi":-60}{"rssi":-61}  {"rssi":-62}"#[..]);
        assert_eq!(
            frames(&mut codec, &mut buf),
            vec![r#"{"rssi":-60}"#, r#"{"rssi":-61}"#, r#"{"rssi":-62}"#]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_object_split_across_reads() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"{"humidity":40.5,"temp"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#"erature":21.0}"#);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"humidity":40.5,"temperature":21.0}"#);
    }

    #[test]
    fn test_braces_inside_strings() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"{"note":"a}b\"{"}{"x":1}"#[..]);
        assert_eq!(
            frames(&mut codec, &mut buf),
            vec![r#"{"note":"a}b\"{"}"#, r#"{"x":1}"#]
        );
    }

    #[test]
    fn test_stray_bytes_form_their_own_frame() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"garbage{"x":1}"#[..]);
        assert_eq!(frames(&mut codec, &mut buf), vec!["garbage", r#"{"x":1}"#]);
    }

    #[test]
    fn test_unterminated_record_does_not_swallow_the_next() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"{"humidity":4"#[..]);
        for n in 0..60 {
            let record = format!(r#"{{"humidity":40.0,"temperature":21.0,"rssi":-{}}}"#, n);
            buf.extend_from_slice(record.as_bytes());
        }

        let mut out = frames(&mut codec, &mut buf);
        while let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
            out.push(String::from_utf8_lossy(&frame).into_owned());
        }

        assert_eq!(out.len(), 61);
        assert_eq!(out[0], r#"{"humidity":4"#);
        assert_eq!(out[60], r#"{"humidity":40.0,"temperature":21.0,"rssi":-59}"#);
    }

    #[test]
    fn test_nested_object_splits_at_inner_brace() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"{"a":{"b":1}}"#[..]);
        assert_eq!(frames(&mut codec, &mut buf), vec![r#"{"a":"#, r#"{"b":1}"#, "}"]);
    }

    #[test]
    fn test_oversized_object_is_cut() {
        let mut codec = RecordCodec::new(8);
        let mut buf = BytesMut::from(&br#"{"humidity":4"#[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 13);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_object_at_eof() {
        let mut codec = RecordCodec::default();
        let mut buf = BytesMut::from(&br#"{"x":1}{"y""#[..]);
        assert_eq!(&codec.decode_eof(&mut buf).unwrap().unwrap()[..], br#"{"x":1}"#);
        assert_eq!(&codec.decode_eof(&mut buf).unwrap().unwrap()[..], br#"{"y""#);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
