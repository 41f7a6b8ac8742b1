//! Minimal `multipart/byteranges` body parser, used only by
//! [`crate::file::File::vector_read`] when a server answers a multi-range
//! `Range` request with a single multipart response instead of one part per
//! requested range.
//!
//! This is deliberately not routed through [`crate::header::HeaderParser`]:
//! that parser is a line-oriented response-header state machine, and a
//! multipart body is a different grammar (boundary-delimited parts, each
//! with its own small header block and a binary payload) that only ever
//! shows up in one place.

use bytes::Bytes;

/// Splits a `multipart/byteranges` body into `(start_offset, data)` pairs,
/// one per part, reading each part's own `Content-Range` header rather than
/// trusting request order (a server may reorder or merge adjacent ranges).
/// Parts this function can't make sense of are skipped rather than failing
/// the whole parse; callers treat an offset their request needs but that
/// didn't show up here as unsatisfied.
pub fn parse_byteranges(body: &Bytes, boundary: &str) -> Vec<(u64, Bytes)> {
    if boundary.is_empty() {
        return Vec::new();
    }
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();

    let mut search_from = 0usize;
    while let Some(rel) = find(&body[search_from..], delimiter) {
        let start = search_from + rel + delimiter.len();
        if body[start..].starts_with(b"--") {
            break;
        }
        let next_rel = find(&body[start..], delimiter);
        let end = match next_rel {
            Some(r) => start + r,
            None => body.len(),
        };
        if let Some(part) = parse_one_part(&body.slice(start..end)) {
            parts.push(part);
        }
        search_from = end;
        if next_rel.is_none() {
            break;
        }
    }

    parts
}

fn parse_one_part(chunk: &Bytes) -> Option<(u64, Bytes)> {
    let header_end = find(chunk, b"\r\n\r\n")?;
    let header_block = std::str::from_utf8(&chunk[..header_end]).ok()?;
    let body_start = header_end + 4;
    let mut body_end = chunk.len();
    if chunk[body_start..].ends_with(b"\r\n") {
        body_end -= 2;
    }

    let mut offset = None;
    for line in header_block.split("\r\n") {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("Content-Range") {
            offset = parse_content_range_start(value.trim());
        }
    }

    let offset = offset?;
    Some((offset, chunk.slice(body_start..body_end)))
}

fn parse_content_range_start(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes ")?;
    let dash = rest.find('-')?;
    rest[..dash].parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_part_response() {
        let body = Bytes::from(
            concat!(
                "--SEP\r\n",
                "Content-Type: text/plain\r\n",
                "Content-Range: bytes 0-1/10\r\n",
                "\r\n",
                "aa\r\n",
                "--SEP\r\n",
                "Content-Range: bytes 6-7/10\r\n",
                "\r\n",
                "dd\r\n",
                "--SEP--\r\n",
            )
            .as_bytes()
            .to_vec(),
        );
        let parts = parse_byteranges(&body, "SEP");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], (0, Bytes::from_static(b"aa")));
        assert_eq!(parts[1], (6, Bytes::from_static(b"dd")));
    }

    #[test]
    fn empty_boundary_returns_nothing() {
        let body = Bytes::from_static(b"whatever");
        assert!(parse_byteranges(&body, "").is_empty());
    }
}
