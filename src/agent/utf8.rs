//! Incremental UTF-8 decoding for byte streams.
//!
//! Network chunks split multi-byte sequences at arbitrary points. The
//! decoder carries the incomplete tail of each chunk into the next one
//! and substitutes U+FFFD only for bytes that can never complete a valid
//! sequence.

#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning all text complete so far.
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let bytes = std::mem::take(&mut self.pending);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&rest[..valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        // Truly invalid bytes: substitute and move on.
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + invalid..];
                        }
                        // Incomplete tail: keep it for the next chunk.
                        None => {
                            self.pending.extend_from_slice(&rest[valid..]);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
