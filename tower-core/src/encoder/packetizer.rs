//! Streaming MPEG-1 Layer III frame parser.
//!
//! Accepts arbitrary-sized byte chunks from the encoder's stdout drain and
//! yields complete, byte-identical MP3 frames as they become available.
//! Internal to the supervisor's stdout drain thread — never performs I/O,
//! never blocks, never mutates the bytes it parses.

use bytes::{Bytes, BytesMut};

use crate::protocol_constants::PACKETIZER_BUFFER_CAPACITY;

/// MPEG-1 Layer III bitrate table (kbps), indexed by the 4-bit bitrate
/// field. Index 0 ("free format") and 15 (reserved) are not supported.
const BITRATES_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];

/// MPEG-1 sample rate table (Hz), indexed by the 2-bit sampling-rate
/// field. Index 3 is reserved.
const SAMPLE_RATES: [u32; 4] = [44_100, 48_000, 32_000, 0];

/// A streaming parser that splits a raw MP3 byte stream into discrete,
/// complete frames. Resynchronizes on corrupted or non-MP3 input by
/// skipping bytes one at a time until the next plausible sync word.
pub struct Mp3Packetizer {
    buffer: BytesMut,
}

impl Default for Mp3Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mp3Packetizer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds a chunk of bytes and returns zero, one, or many complete
    /// frames extracted from the accumulated stream. `feed` is O(n) in the
    /// input length.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(sync_at) = find_sync_candidate(&self.buffer) else {
                // No plausible sync byte anywhere in the buffer: all of it
                // is noise relative to what we know so far.
                self.buffer.clear();
                break;
            };

            if sync_at > 0 {
                let _ = self.buffer.split_to(sync_at);
            }

            if self.buffer.len() < 4 {
                break; // wait for more header bytes
            }

            match parse_header(&self.buffer[..4]) {
                Some(frame_len) => {
                    if self.buffer.len() < frame_len {
                        break; // wait for the rest of this frame
                    }
                    frames.push(self.buffer.split_to(frame_len).freeze());
                }
                None => {
                    // Candidate sync word didn't resolve to a valid
                    // header; it was noise. Skip just that byte and keep
                    // searching from the next position.
                    let _ = self.buffer.split_to(1);
                }
            }

            self.trim_to_capacity();
        }

        self.trim_to_capacity();
        frames
    }

    fn trim_to_capacity(&mut self) {
        if self.buffer.len() > PACKETIZER_BUFFER_CAPACITY {
            let excess = self.buffer.len() - PACKETIZER_BUFFER_CAPACITY;
            let _ = self.buffer.split_to(excess);
        }
    }
}

/// Finds the first byte offset that could plausibly begin an 11-bit MP3
/// sync word (`0xFFE`). Returns `Some(len - 1)` for a dangling `0xFF` at
/// the very end of the buffer so the caller waits for its follow-up byte
/// instead of discarding a sync word split across two `feed` calls.
fn find_sync_candidate(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i] != 0xFF {
            continue;
        }
        if i + 1 >= buf.len() {
            return Some(i);
        }
        if (buf[i + 1] & 0xE0) == 0xE0 {
            return Some(i);
        }
    }
    None
}

/// Parses a 4-byte MPEG-1 Layer III header and returns the total frame
/// length (header + payload) in bytes, or `None` if the header is not a
/// valid MPEG-1 Layer III header (wrong version/layer, reserved bitrate or
/// sample-rate index).
fn parse_header(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 4 || bytes[0] != 0xFF || (bytes[1] & 0xE0) != 0xE0 {
        return None;
    }

    let version_bits = (bytes[1] >> 3) & 0b11;
    let layer_bits = (bytes[1] >> 1) & 0b11;
    if version_bits != 0b11 || layer_bits != 0b01 {
        return None; // not MPEG-1 Layer III
    }

    let bitrate_index = (bytes[2] >> 4) & 0x0F;
    let samplerate_index = (bytes[2] >> 2) & 0b11;
    let padding = u32::from((bytes[2] >> 1) & 0b1);

    if bitrate_index == 0 || bitrate_index == 0x0F || samplerate_index == 0b11 {
        return None;
    }

    let bitrate_bps = BITRATES_KBPS[bitrate_index as usize] * 1000;
    let sample_rate = SAMPLE_RATES[samplerate_index as usize];
    if bitrate_bps == 0 || sample_rate == 0 {
        return None;
    }

    Some((144 * bitrate_bps / sample_rate + padding) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Builds a syntactically valid MPEG-1 Layer III frame at the given
    /// bitrate/sample-rate, filled with a marker byte so tests can assert
    /// on byte-identity.
    fn build_frame(bitrate_kbps: u32, sample_rate: u32, padding: bool, fill: u8) -> Vec<u8> {
        let bitrate_index = match bitrate_kbps {
            128 => 0x9,
            192 => 0xB,
            320 => 0xE,
            _ => panic!("unsupported test bitrate"),
        };
        let samplerate_index = match sample_rate {
            44_100 => 0b00,
            48_000 => 0b01,
            32_000 => 0b10,
            _ => panic!("unsupported test sample rate"),
        };

        let byte1 = 0xFFu8;
        let byte2 = 0xE0 | (0b11 << 3) | (0b01 << 1); // MPEG1, Layer III, no CRC bit set here
        let byte3 = (bitrate_index << 4) | (samplerate_index << 2) | (u8::from(padding) << 1);
        let byte4 = 0x00;

        let frame_len =
            (144 * bitrate_kbps * 1000 / sample_rate + u32::from(padding)) as usize;
        let mut frame = vec![fill; frame_len];
        frame[0] = byte1;
        frame[1] = byte2;
        frame[2] = byte3;
        frame[3] = byte4;
        frame
    }

    #[test]
    fn emits_single_cbr_frame() {
        let frame = build_frame(128, 44_100, false, 0xAB);
        let mut p = Mp3Packetizer::new();
        let out = p.feed(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn splits_frame_across_multiple_feed_calls() {
        let frame = build_frame(128, 48_000, false, 0xCD);
        let mut p = Mp3Packetizer::new();
        let mid = frame.len() / 2;
        assert!(p.feed(&frame[..mid]).is_empty());
        let out = p.feed(&frame[mid..]);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn resyncs_after_leading_noise() {
        let mut data = vec![0x12, 0x34, 0xFF, 0x00, 0x9A]; // noise, including a fake 0xFF
        let frame = build_frame(192, 48_000, false, 0x55);
        data.extend_from_slice(&frame);

        let mut p = Mp3Packetizer::new();
        let out = p.feed(&data);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
    }

    #[test]
    fn emits_consecutive_vbr_frames_with_different_lengths() {
        let a = build_frame(128, 44_100, true, 0x01);
        let b = build_frame(320, 44_100, false, 0x02);
        let mut combined = a.clone();
        combined.extend_from_slice(&b);

        let mut p = Mp3Packetizer::new();
        let out = p.feed(&combined);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &a[..]);
        assert_eq!(&out[1][..], &b[..]);
    }

    #[test]
    fn random_noise_alone_emits_nothing() {
        let noise = vec![0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66];
        let mut p = Mp3Packetizer::new();
        assert!(p.feed(&noise).is_empty());
    }

    #[test]
    fn one_second_of_noise_then_valid_stream_emits_exactly_the_valid_frames() {
        let noise: Vec<u8> = (0..1024).map(|i| (i * 37 % 251) as u8).collect();
        let mut valid = Vec::new();
        let mut expected_count = 0;
        for i in 0..40 {
            let fill = (i % 256) as u8;
            let frame = build_frame(128, 44_100, i % 3 == 0, fill);
            valid.extend_from_slice(&frame);
            expected_count += 1;
        }

        let mut combined = noise.clone();
        combined.extend_from_slice(&valid);

        let mut p = Mp3Packetizer::new();
        let out = p.feed(&combined);
        assert_eq!(out.len(), expected_count);

        let mut reconstructed = Vec::new();
        for frame in &out {
            reconstructed.extend_from_slice(frame);
        }
        assert_eq!(reconstructed, valid);
    }

    proptest! {
        /// Regardless of how an input byte stream is split across `feed`
        /// calls, the packetizer must extract the same frames it would
        /// extract from one single `feed` of the whole stream, and every
        /// emitted frame's length must match its own header independent of
        /// chunking — i.e. `feed` is a pure function of the concatenated
        /// input, not of the chunk boundaries.
        #[test]
        fn chunking_does_not_affect_extracted_frames(
            noise_before in proptest::collection::vec(any::<u8>(), 0..64),
            frame_count in 0usize..6,
            noise_after in proptest::collection::vec(any::<u8>(), 0..64),
            chunk_sizes in proptest::collection::vec(1usize..37, 1..40),
        ) {
            let mut combined = noise_before;
            for i in 0..frame_count {
                let bitrate = [128, 192, 320][i % 3];
                let rate = [44_100, 48_000, 32_000][i % 3];
                combined.extend_from_slice(&build_frame(bitrate, rate, i % 2 == 0, i as u8));
            }
            combined.extend_from_slice(&noise_after);

            let mut whole = Mp3Packetizer::new();
            let expected = whole.feed(&combined);

            let mut chunked = Mp3Packetizer::new();
            let mut got = Vec::new();
            let mut pos = 0;
            let mut i = 0;
            while pos < combined.len() {
                let size = chunk_sizes[i % chunk_sizes.len()].min(combined.len() - pos);
                got.extend(chunked.feed(&combined[pos..pos + size]));
                pos += size;
                i += 1;
            }

            prop_assert_eq!(got.len(), expected.len());
            for (a, b) in got.iter().zip(expected.iter()) {
                prop_assert_eq!(&a[..], &b[..]);
            }
        }
    }
}
