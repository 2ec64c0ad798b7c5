//! Incremental UTF-8 decoding of a chunked byte stream.
//!
//! Chunk boundaries on the wire carry no meaning, so a multi-byte character
//! may arrive split across two reads. The decoder holds the incomplete tail
//! back until the rest of the character shows up.

/// Longest UTF-8 sequence; an incomplete tail is always shorter than this.
const MAX_SEQUENCE: usize = 4;

/// Stateful decoder turning byte chunks into text pieces.
///
/// # Examples
///
/// ```
/// use bluebox::consumer::Utf8Decoder;
///
/// let mut decoder = Utf8Decoder::new();
/// let bytes = "né".as_bytes();
/// assert_eq!(decoder.decode(&bytes[..2]), "n");
/// assert_eq!(decoder.decode(&bytes[2..]), "é");
/// assert_eq!(decoder.finish(), "");
/// ```
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `chunk` (plus any held-back bytes) as forms
    /// complete characters. Invalid sequences become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        debug_assert!(rest.len() < MAX_SEQUENCE);
        let held = rest.len();
        let keep_from = self.pending.len() - held;
        self.pending.drain(..keep_from);
        out
    }

    /// Flushes whatever is still held back. A truncated character at the very
    /// end of the stream becomes U+FFFD.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    /// Bytes waiting for the rest of their character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_straight_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"Hi there"), "Hi there");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn split_characters_are_reassembled() {
        let text = "a😀b";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();

        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn incomplete_tail_is_held_back() {
        let mut decoder = Utf8Decoder::new();
        let euro = "€".as_bytes();
        assert_eq!(decoder.decode(&[b'x', euro[0], euro[1]]), "x");
        assert_eq!(decoder.pending(), 2);
        assert_eq!(decoder.decode(&euro[2..]), "€");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn truncated_final_character_is_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&"é".as_bytes()[..1]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
