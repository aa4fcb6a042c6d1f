//! SLIP framing (RFC 1055) as used by the ESP ROM loader.
//!
//! Every request and response travels as one SLIP frame:
//!
//! ```text
//! 0xC0 | payload with 0xC0 -> 0xDB 0xDC and 0xDB -> 0xDB 0xDD | 0xC0
//! ```

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape byte.
pub const ESC: u8 = 0xDB;
/// Escaped `END`.
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`.
pub const ESC_ESC: u8 = 0xDD;

/// Encode one payload as a complete SLIP frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 16 + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Streaming SLIP decoder.
///
/// Bytes are fed as they arrive from the port; complete frames come out.
/// Anything received outside a frame (boot log noise) is discarded.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl SlipDecoder {
    /// Create an idle decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns a frame when `byte` completes one.
    pub fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        if !self.in_frame {
            if byte == END {
                self.in_frame = true;
                self.buf.clear();
            }
            return None;
        }

        if self.escaped {
            self.escaped = false;
            match byte {
                ESC_END => self.buf.push(END),
                ESC_ESC => self.buf.push(ESC),
                other => {
                    // Invalid escape, keep the byte so the frame fails parsing
                    // instead of silently shifting.
                    self.buf.push(ESC);
                    self.buf.push(other);
                },
            }
            return None;
        }

        match byte {
            END if self.buf.is_empty() => {
                // Back-to-back delimiters: treat as the start of a new frame.
                None
            },
            END => {
                self.in_frame = false;
                Some(std::mem::take(&mut self.buf))
            },
            ESC => {
                self.escaped = true;
                None
            },
            _ => {
                self.buf.push(byte);
                None
            },
        }
    }

    /// Feed a chunk of bytes, collecting every completed frame.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes
            .iter()
            .filter_map(|&b| self.feed(b))
            .collect()
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_frame = false;
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_escapes_special_bytes() {
        let frame = encode(&[0x01, END, 0x02, ESC, 0x03]);
        assert_eq!(
            frame,
            vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn test_decoder_skips_noise_between_frames() {
        let mut decoder = SlipDecoder::new();
        let mut stream = b"ets Jun  8 2016 boot:0x13".to_vec();
        stream.extend(encode(&[0x01, 0x08, END]));
        stream.extend_from_slice(b"garbage");
        stream.extend(encode(&[0xAA]));

        let frames = decoder.feed_all(&stream);
        assert_eq!(frames, vec![vec![0x01, 0x08, END], vec![0xAA]]);
    }

    #[test]
    fn test_decoder_handles_split_delivery() {
        let mut decoder = SlipDecoder::new();
        let frame = encode(&[ESC, 0x10, END]);
        let (a, b) = frame.split_at(3);

        assert!(decoder.feed_all(a).is_empty());
        assert_eq!(decoder.feed_all(b), vec![vec![ESC, 0x10, END]]);
    }

    #[test]
    fn test_decoder_tolerates_doubled_delimiter() {
        let mut decoder = SlipDecoder::new();
        let frames = decoder.feed_all(&[END, END, 0x05, END]);
        assert_eq!(frames, vec![vec![0x05]]);
    }
}
