//! Streaming UTF-8 decoding for PTY output. A chunk boundary can land in the
//! middle of a multibyte sequence; the decoder carries the incomplete tail
//! into the next chunk so valid bytes are never mangled into replacement
//! characters on their way to the frontend or a peer.

use encoding_rs::{Decoder, UTF_8};

/// How malformed subparts are rendered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvalidPolicy {
    /// WHATWG behavior: emit U+FFFD for malformed parts.
    Replace,
    /// Suppress malformed bytes entirely.
    Remove,
}

pub struct Utf8Stream {
    decoder: Decoder,
    invalid_policy: InvalidPolicy,
}

impl Default for Utf8Stream {
    fn default() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
            invalid_policy: InvalidPolicy::Remove,
        }
    }
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_policy(policy: InvalidPolicy) -> Self {
        Self {
            invalid_policy: policy,
            ..Self::default()
        }
    }

    /// Decode one chunk, holding back any incomplete trailing sequence.
    pub fn decode_chunk(&mut self, input: &[u8]) -> String {
        let mut out = String::with_capacity(input.len());
        let (_res, _read, had_replacements) =
            self.decoder.decode_to_string(input, &mut out, false);
        if had_replacements && self.invalid_policy == InvalidPolicy::Remove {
            out.retain(|ch| ch != '\u{FFFD}');
        }
        out
    }

    /// Flush whatever the decoder still holds at stream end.
    pub fn finish(&mut self) -> Option<String> {
        let mut out = String::new();
        let (_res, _read, had_replacements) = self.decoder.decode_to_string(&[], &mut out, true);
        if had_replacements && self.invalid_policy == InvalidPolicy::Remove {
            out.retain(|ch| ch != '\u{FFFD}');
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}
