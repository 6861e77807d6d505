//! Extraction of `<codemode>` blocks from assistant output.
//!
//! A block is text delimited by the literal markers `<codemode>` and
//! `</codemode>`; the contained code must define an async function named
//! `codemode` with no parameters whose return value is the block's result.
//! Multiple blocks per message are extracted left to right. An opening
//! marker with no closing marker is ignored.

use crate::agentstream::offset::Offset;

pub const OPEN_MARKER: &str = "<codemode>";
pub const CLOSE_MARKER: &str = "</codemode>";

/// All well-formed block bodies in `text`, in order of appearance.
pub fn extract_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(OPEN_MARKER) {
        let after_open = &rest[open + OPEN_MARKER.len()..];
        match after_open.find(CLOSE_MARKER) {
            Some(close) => {
                blocks.push(after_open[..close].trim().to_string());
                rest = &after_open[close + CLOSE_MARKER.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// `"<requestOffset>.<index>"`: the identity of one block within the LLM
/// request that produced it.
pub fn request_id(request_offset: Offset, index: usize) -> String {
    format!("{}.{}", request_offset, index)
}

/// Split a request id back into its request offset and block index.
pub fn parse_request_id(id: &str) -> Option<(Offset, usize)> {
    let (offset, index) = id.split_once('.')?;
    Some((Offset::parse(offset).ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_blocks_in_order() {
        let text = "thinking <codemode>async function codemode() { return 1 }</codemode> \
                    and <codemode>async function codemode() { return 2 }</codemode> done";
        let blocks = extract_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("return 1"));
        assert!(blocks[1].contains("return 2"));
    }

    #[test]
    fn test_unclosed_block_is_ignored() {
        let text = "<codemode>async function codemode() { return 1 }";
        assert!(extract_blocks(text).is_empty());
    }

    #[test]
    fn test_no_blocks() {
        assert!(extract_blocks("plain assistant prose").is_empty());
    }

    #[test]
    fn test_request_id_round_trip() {
        let id = request_id(Offset::new(7), 2);
        assert_eq!(id, "0000000000000007.2");
        let (offset, index) = parse_request_id(&id).unwrap();
        assert_eq!(offset, Offset::new(7));
        assert_eq!(index, 2);
    }
}
