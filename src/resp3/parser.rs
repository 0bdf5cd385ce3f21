//! Incremental RESP3 decoder.
//!
//! Decoding is split in two phases over the connection's read buffer:
//!
//! 1. [`check`] scans for one complete top-level frame and reports its
//!    byte length, or `None` when more data is needed. Partial reads cost
//!    a re-scan, never a partial consume.
//! 2. [`parse`] walks a complete frame and emits every [`Node`] in
//!    depth-first order through a callback.
//!
//! Both phases share one cursor-driven state machine with an explicit
//! stack of open aggregates, so nesting depth is bounded by the frame,
//! not the call stack.
//!
//! Streamed (`?`-sized) values carry [`AGGREGATE_SIZE_UNKNOWN`] and
//! terminate on an empty `streamed_string_part` at their level. RESP2
//! style `$-1`/`*-1` nulls decode as `Null` nodes.

use crate::error::{Error, Result};
use crate::resp3::node::{FrameType, Node, AGGREGATE_SIZE_UNKNOWN};

/// One open aggregate during the walk.
struct Level {
    /// Children still expected, already multiplied for map-like types.
    /// Meaningless when `streamed`.
    remaining: usize,
    /// Terminates on an empty streamed_string_part instead of a count.
    streamed: bool,
    /// Attribute aggregates annotate the value that follows them and
    /// never count as a child of their parent.
    attribute: bool,
}

/// Scan `buf` for one complete top-level frame.
///
/// Returns `Ok(Some(len))` when `buf[..len]` is a whole frame,
/// `Ok(None)` when more bytes are needed, or a protocol error. A bulk
/// length or aggregate size larger than `max_size` fails with
/// [`Error::ExceedsMaxReadSize`] before the payload is awaited.
pub fn check(buf: &[u8], max_size: usize) -> Result<Option<usize>> {
    drive(buf, max_size, &mut |_node: &Node<'_>| Ok(()))
}

/// Walk one complete frame, emitting nodes in depth-first order.
///
/// `frame` must hold exactly the bytes reported by [`check`]. The walk
/// stops early when `on_node` returns an error; the caller is expected
/// to discard the full frame length regardless, which keeps the byte
/// stream synchronized across adapter failures.
pub fn parse<F>(frame: &[u8], on_node: &mut F) -> Result<usize>
where
    F: FnMut(&Node<'_>) -> Result<()>,
{
    match drive(frame, usize::MAX, on_node)? {
        Some(len) => Ok(len),
        None => Err(Error::Eof),
    }
}

/// Peek the root type of the frame starting at `buf[0]`.
pub fn peek_type(buf: &[u8]) -> Result<Option<FrameType>> {
    match buf.first() {
        None => Ok(None),
        Some(&byte) => FrameType::from_sigil(byte)
            .map(Some)
            .ok_or(Error::UnknownType),
    }
}

/// The shared walker behind [`check`] and [`parse`].
fn drive<F>(buf: &[u8], max_size: usize, on_node: &mut F) -> Result<Option<usize>>
where
    F: FnMut(&Node<'_>) -> Result<()>,
{
    let mut pos = 0usize;
    let mut stack: Vec<Level> = Vec::new();

    loop {
        let depth = stack.len();

        let type_byte = match buf.get(pos) {
            Some(b) => *b,
            None => return Ok(None),
        };
        let data_type = FrameType::from_sigil(type_byte).ok_or(Error::UnknownType)?;
        let line_start = pos + 1;

        let line = match read_line(buf, line_start) {
            Some(line) => line,
            None => return Ok(None),
        };
        let after_line = line_start + line.len() + 2;

        let mut closes_streamed = false;

        if data_type.is_aggregate() {
            pos = after_line;
            if line == b"?" {
                on_node(&Node {
                    data_type,
                    aggregate_size: AGGREGATE_SIZE_UNKNOWN,
                    depth,
                    data: b"",
                })?;
                stack.push(Level {
                    remaining: 0,
                    streamed: true,
                    attribute: data_type == FrameType::Attribute,
                });
                continue;
            }
            match parse_size(line)? {
                Size::Null => {
                    // RESP2 style *-1: a null value in aggregate clothing.
                    on_node(&Node {
                        data_type: FrameType::Null,
                        aggregate_size: 0,
                        depth,
                        data: b"",
                    })?;
                }
                Size::Declared(size) => {
                    if size > max_size {
                        return Err(Error::ExceedsMaxReadSize);
                    }
                    on_node(&Node {
                        data_type,
                        aggregate_size: size,
                        depth,
                        data: b"",
                    })?;
                    let remaining = size * data_type.element_multiplicity();
                    if remaining > 0 {
                        stack.push(Level {
                            remaining,
                            streamed: false,
                            attribute: data_type == FrameType::Attribute,
                        });
                        continue;
                    }
                    if data_type == FrameType::Attribute {
                        // An empty attribute annotates the value that
                        // follows; it settles nothing by itself.
                        continue;
                    }
                }
            }
        } else if data_type.is_bulk() {
            if line == b"?" {
                // Streamed string: parts follow until an empty one.
                pos = after_line;
                on_node(&Node {
                    data_type,
                    aggregate_size: AGGREGATE_SIZE_UNKNOWN,
                    depth,
                    data: b"",
                })?;
                stack.push(Level {
                    remaining: 0,
                    streamed: true,
                    attribute: false,
                });
                continue;
            }
            match parse_size(line)? {
                Size::Null => {
                    pos = after_line;
                    on_node(&Node {
                        data_type: FrameType::Null,
                        aggregate_size: 0,
                        depth,
                        data: b"",
                    })?;
                }
                Size::Declared(len) => {
                    if len > max_size {
                        return Err(Error::ExceedsMaxReadSize);
                    }
                    if data_type == FrameType::StreamedStringPart && len == 0 {
                        // End-of-stream marker `;0` carries no payload line.
                        pos = after_line;
                        on_node(&Node {
                            data_type,
                            aggregate_size: 0,
                            depth,
                            data: b"",
                        })?;
                        if stack.last().is_some_and(|l| l.streamed) {
                            closes_streamed = true;
                        }
                    } else {
                        let data_start = after_line;
                        let data_end = data_start + len;
                        if buf.len() < data_end + 2 {
                            return Ok(None);
                        }
                        if &buf[data_end..data_end + 2] != b"\r\n" {
                            return Err(Error::NotANumber);
                        }
                        pos = data_end + 2;
                        on_node(&Node {
                            data_type,
                            aggregate_size: len,
                            depth,
                            data: &buf[data_start..data_end],
                        })?;
                    }
                }
            }
        } else {
            // Line leaf: the line itself is the payload.
            pos = after_line;
            on_node(&Node {
                data_type,
                aggregate_size: line.len(),
                depth,
                data: line,
            })?;
        }

        if closes_streamed {
            let level = stack.pop().expect("streamed level present");
            if level.attribute {
                continue;
            }
        }

        // A value just completed; settle it against the open aggregates.
        // A completed attribute settles nothing: it annotates whatever
        // value comes next at its depth.
        loop {
            match stack.last_mut() {
                None => return Ok(Some(pos)),
                Some(level) if level.streamed => break,
                Some(level) => {
                    level.remaining -= 1;
                    if level.remaining == 0 {
                        let was_attribute = level.attribute;
                        stack.pop();
                        if was_attribute {
                            break;
                        }
                        continue;
                    }
                    break;
                }
            }
        }
    }
}

/// Read a CRLF-terminated line starting at `start`, without the CRLF.
fn read_line(buf: &[u8], start: usize) -> Option<&[u8]> {
    let haystack = buf.get(start..)?;
    let mut i = 0;
    while i + 1 < haystack.len() {
        if haystack[i] == b'\r' && haystack[i + 1] == b'\n' {
            return Some(&haystack[..i]);
        }
        i += 1;
    }
    None
}

enum Size {
    /// `-1`, the RESP2 null marker.
    Null,
    Declared(usize),
}

fn parse_size(line: &[u8]) -> Result<Size> {
    if line == b"-1" {
        return Ok(Size::Null);
    }
    if line.is_empty() {
        return Err(Error::NotANumber);
    }
    let mut value = 0usize;
    for &byte in line {
        if !byte.is_ascii_digit() {
            return Err(Error::NotANumber);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((byte - b'0') as usize))
            .ok_or(Error::NotANumber)?;
    }
    Ok(Size::Declared(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp3::node::OwnedNode;

    fn collect(frame: &[u8]) -> Vec<OwnedNode> {
        let mut nodes = Vec::new();
        let len = parse(frame, &mut |node: &Node<'_>| {
            nodes.push(node.to_owned());
            Ok(())
        })
        .unwrap();
        assert_eq!(len, frame.len());
        nodes
    }

    fn depths(nodes: &[OwnedNode]) -> Vec<usize> {
        nodes.iter().map(|n| n.depth).collect()
    }

    #[test]
    fn test_simple_string() {
        let nodes = collect(b"+PONG\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].data_type, FrameType::SimpleString);
        assert_eq!(nodes[0].data, b"PONG");
        assert_eq!(nodes[0].depth, 0);
    }

    #[test]
    fn test_blob_string() {
        let nodes = collect(b"$5\r\nhello\r\n");
        assert_eq!(nodes[0].data_type, FrameType::BlobString);
        assert_eq!(nodes[0].data, b"hello");
        assert_eq!(nodes[0].aggregate_size, 5);
    }

    #[test]
    fn test_all_line_leaves() {
        for (frame, t) in [
            (&b":42\r\n"[..], FrameType::Number),
            (b",3.14\r\n", FrameType::Doublean),
            (b"#t\r\n", FrameType::Boolean),
            (b"(12345678901234567890\r\n", FrameType::BigNumber),
            (b"-ERR oops\r\n", FrameType::SimpleError),
            (b"_\r\n", FrameType::Null),
        ] {
            let nodes = collect(frame);
            assert_eq!(nodes.len(), 1, "{:?}", t);
            assert_eq!(nodes[0].data_type, t);
        }
    }

    #[test]
    fn test_array_nesting_depths() {
        // [[1, 2], "x"]
        let nodes = collect(b"*2\r\n*2\r\n:1\r\n:2\r\n$1\r\nx\r\n");
        assert_eq!(depths(&nodes), vec![0, 1, 2, 2, 1]);
        assert_eq!(nodes[0].aggregate_size, 2);
        assert_eq!(nodes[1].aggregate_size, 2);
        assert_eq!(nodes[4].data, b"x");
    }

    #[test]
    fn test_map_entry_multiplicity() {
        // {"k1": 1, "k2": 2} -- size 2 in entries, 4 child frames.
        let nodes = collect(b"%2\r\n$2\r\nk1\r\n:1\r\n$2\r\nk2\r\n:2\r\n");
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0].data_type, FrameType::Map);
        assert_eq!(nodes[0].aggregate_size, 2);
        assert_eq!(depths(&nodes), vec![0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_empty_aggregate() {
        let nodes = collect(b"*0\r\n");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].aggregate_size, 0);
    }

    #[test]
    fn test_attribute_before_value() {
        // The attribute (one ttl entry) annotates the reply after it;
        // both belong to the same top-level frame.
        let frame = b"|1\r\n+ttl\r\n:3600\r\n$5\r\nhello\r\n";
        let nodes = collect(frame);
        assert_eq!(nodes[0].data_type, FrameType::Attribute);
        assert_eq!(nodes[0].aggregate_size, 1);
        assert_eq!(nodes.len(), 4);
        assert_eq!(depths(&nodes), vec![0, 1, 1, 0]);
        assert_eq!(nodes[3].data, b"hello");
    }

    #[test]
    fn test_attribute_does_not_consume_a_child_slot() {
        // Array of two values, the first annotated by an attribute.
        let frame = b"*2\r\n|1\r\n+k\r\n+v\r\n:1\r\n:2\r\n";
        let nodes = collect(frame);
        assert_eq!(depths(&nodes), vec![0, 1, 2, 2, 1, 1]);
        assert_eq!(nodes[4].data, b"1");
        assert_eq!(nodes[5].data, b"2");
    }

    #[test]
    fn test_attribute_alone_is_not_a_frame() {
        // An attribute with no value after it leaves the frame open.
        assert_eq!(
            check(b"|1\r\n+ttl\r\n:3600\r\n", usize::MAX).unwrap(),
            None
        );
    }

    #[test]
    fn test_push_frame() {
        let nodes = collect(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n");
        assert_eq!(nodes[0].data_type, FrameType::Push);
        assert_eq!(nodes[0].aggregate_size, 3);
        assert_eq!(nodes[3].data, b"hello");
    }

    #[test]
    fn test_resp2_null_bulk() {
        let nodes = collect(b"$-1\r\n");
        assert_eq!(nodes[0].data_type, FrameType::Null);
    }

    #[test]
    fn test_resp2_null_array() {
        let nodes = collect(b"*-1\r\n");
        assert_eq!(nodes[0].data_type, FrameType::Null);
    }

    #[test]
    fn test_streamed_string() {
        let frame = b"$?\r\n;4\r\nHell\r\n;2\r\no!\r\n;0\r\n";
        let nodes = collect(frame);
        assert_eq!(nodes[0].data_type, FrameType::BlobString);
        assert_eq!(nodes[0].aggregate_size, AGGREGATE_SIZE_UNKNOWN);
        assert_eq!(nodes[1].data, b"Hell");
        assert_eq!(nodes[2].data, b"o!");
        assert_eq!(nodes[3].data, b"");
        assert_eq!(depths(&nodes), vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_streamed_aggregate() {
        // *? with two elements, closed by an empty part.
        let frame = b"*?\r\n:1\r\n:2\r\n;0\r\n";
        let nodes = collect(frame);
        assert_eq!(nodes[0].aggregate_size, AGGREGATE_SIZE_UNKNOWN);
        assert_eq!(nodes.len(), 4);
        assert_eq!(depths(&nodes), vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_check_incomplete() {
        let frame = b"*2\r\n:1\r\n:2\r\n";
        for cut in 0..frame.len() {
            assert_eq!(check(&frame[..cut], usize::MAX).unwrap(), None, "cut={}", cut);
        }
        assert_eq!(check(frame, usize::MAX).unwrap(), Some(frame.len()));
    }

    #[test]
    fn test_check_reports_exact_boundary() {
        let mut buf = b"+OK\r\n".to_vec();
        buf.extend_from_slice(b":1\r\n");
        assert_eq!(check(&buf, usize::MAX).unwrap(), Some(5));
    }

    #[test]
    fn test_unknown_sigil_errors() {
        assert!(matches!(
            check(b"&3\r\n", usize::MAX),
            Err(Error::UnknownType)
        ));
    }

    #[test]
    fn test_non_numeric_size_errors() {
        assert!(matches!(
            check(b"$abc\r\n", usize::MAX),
            Err(Error::NotANumber)
        ));
        assert!(matches!(
            check(b"*1x\r\n", usize::MAX),
            Err(Error::NotANumber)
        ));
    }

    #[test]
    fn test_max_size_guard() {
        assert!(matches!(
            check(b"$1000\r\n", 100),
            Err(Error::ExceedsMaxReadSize)
        ));
    }

    #[test]
    fn test_round_trip_depth_sequences() {
        // Nested map inside array inside push, mixed leaf kinds.
        let frame =
            b">2\r\n*2\r\n%1\r\n+k\r\n:7\r\n#f\r\n$3\r\nend\r\n";
        let nodes = collect(frame);
        assert_eq!(depths(&nodes), vec![0, 1, 2, 3, 3, 2, 1]);
        // Re-parsing the same bytes reproduces identical nodes.
        assert_eq!(collect(frame), nodes);
    }

    #[test]
    fn test_adapter_error_stops_walk() {
        let mut calls = 0;
        let res = parse(b"*2\r\n:1\r\n:2\r\n", &mut |_node: &Node<'_>| {
            calls += 1;
            if calls == 2 {
                Err(Error::NotANumber)
            } else {
                Ok(())
            }
        });
        assert!(matches!(res, Err(Error::NotANumber)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_verbatim_string() {
        let nodes = collect(b"=15\r\ntxt:Some string\r\n");
        assert_eq!(nodes[0].data_type, FrameType::VerbatimString);
        assert_eq!(nodes[0].data, b"txt:Some string");
    }

    #[test]
    fn test_blob_with_embedded_crlf() {
        let nodes = collect(b"$7\r\nab\r\ncd!\r\n");
        assert_eq!(nodes[0].data, b"ab\r\ncd!");
    }
}
