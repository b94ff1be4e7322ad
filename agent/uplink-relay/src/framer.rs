//! Annex-B access-unit framer.
//!
//! The capture pipeline writes a container-less elementary stream; TCP read
//! boundaries have nothing to do with NAL or frame boundaries. The framer
//! accumulates bytes and cuts the stream where the *next* access unit begins:
//!
//! - an access unit delimiter, parameter set or prefix SEI after a VCL NAL
//! - a VCL NAL whose first-slice flag is set, after a VCL NAL
//!
//! An access unit is therefore emitted as soon as the first header bytes of
//! the following one arrive. With `h264parse ... alignment=au` upstream (AUD
//! inserted) that is right after the last byte of the picture.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    H264,
    H265,
}

impl Codec {
    /// MIME type of the outbound track carrying this codec.
    pub fn mime(self) -> &'static str {
        match self {
            Codec::H264 => "video/h264",
            Codec::H265 => "video/h265",
        }
    }

    fn header_len(self) -> usize {
        match self {
            Codec::H264 => 1,
            Codec::H265 => 2,
        }
    }

    /// Classify a NAL from its header plus the first payload byte.
    fn classify(self, b: &[u8]) -> NalInfo {
        match self {
            Codec::H264 => {
                let t = b[0] & 0x1F;
                let vcl = (1..=5).contains(&t);
                NalInfo {
                    vcl,
                    // first_mb_in_slice is ue(v); a leading '1' bit encodes 0
                    first_slice: vcl && b[1] & 0x80 != 0,
                    keyframe:    t == 5,
                    starts_au:   matches!(t, 6..=9 | 14..=18),
                }
            }
            Codec::H265 => {
                let t = (b[0] >> 1) & 0x3F;
                let vcl = t <= 31;
                NalInfo {
                    vcl,
                    first_slice: vcl && b[2] & 0x80 != 0,
                    keyframe:    (16..=21).contains(&t),
                    starts_au:   matches!(t, 32..=35 | 39 | 41..=44 | 48..=55),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NalInfo {
    vcl:         bool,
    first_slice: bool,
    keyframe:    bool,
    /// AUD / parameter sets / prefix SEI: open a new AU when they follow a VCL NAL
    starts_au:   bool,
}

/// One complete access unit cut from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FramedUnit {
    pub data:     Bytes,
    pub keyframe: bool,
}

pub struct AccessUnitFramer {
    codec:        Codec,
    /// Holds the access unit being accumulated; once synced, byte 0 is its first start code.
    buf:          BytesMut,
    /// First byte not yet searched for a start code.
    scan_pos:     usize,
    synced:       bool,
    au_has_vcl:   bool,
    au_keyframe:  bool,
    max_au_bytes: usize,
    resyncs:      u64,
}

impl AccessUnitFramer {
    pub fn new(codec: Codec, max_au_bytes: usize) -> Self {
        Self {
            codec,
            buf: BytesMut::with_capacity(256 * 1024),
            scan_pos: 0,
            synced: false,
            au_has_vcl: false,
            au_keyframe: false,
            max_au_bytes,
            resyncs: 0,
        }
    }

    /// Feed bytes read from the endpoint; returns every access unit they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<FramedUnit> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        let need = self.codec.header_len() + 1;

        loop {
            let Some(mut sc) = find_start_code(&self.buf, self.scan_pos) else {
                // Only a start code straddling this read and the next one is left to find.
                self.scan_pos = self.scan_pos.max(self.buf.len().saturating_sub(2));
                break;
            };
            let hdr = sc + 3;
            if self.buf.len() < hdr + need {
                self.scan_pos = sc;
                break;
            }

            // A zero byte right before 00 00 01 makes it a 4-byte start code.
            let nal_start = if sc > 0 && self.buf[sc - 1] == 0 { sc - 1 } else { sc };
            let nal = self.codec.classify(&self.buf[hdr..hdr + need]);

            if !self.synced {
                // Drop whatever preceded the first start code.
                let _ = self.buf.split_to(nal_start);
                sc -= nal_start;
                self.synced = true;
            } else if self.au_has_vcl && (nal.starts_au || (nal.vcl && nal.first_slice)) {
                let data = self.buf.split_to(nal_start).freeze();
                out.push(FramedUnit { data, keyframe: self.au_keyframe });
                sc -= nal_start;
                self.au_has_vcl = false;
                self.au_keyframe = false;
            }

            if nal.vcl {
                self.au_has_vcl = true;
            }
            if nal.keyframe {
                self.au_keyframe = true;
            }
            self.scan_pos = sc + 3;
        }

        if self.buf.len() > self.max_au_bytes {
            warn!(
                buffered = self.buf.len(),
                max = self.max_au_bytes,
                "No access unit boundary within size limit, resynchronizing"
            );
            self.resyncs += 1;
            self.reset();
        }

        out
    }

    /// Discard any partial access unit (endpoint lost, resync).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan_pos = 0;
        self.synced = false;
        self.au_has_vcl = false;
        self.au_keyframe = false;
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(bytes: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1];
        v.extend_from_slice(bytes);
        v
    }

    const AUD: &[u8] = &[0x09, 0xF0];
    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1F];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x33];
    const P_FIRST: &[u8] = &[0x41, 0x9A, 0x02, 0x04];
    const P_SECOND_SLICE: &[u8] = &[0x41, 0x20, 0x11];

    fn idr_au() -> Vec<u8> {
        [nal(AUD), nal(SPS), nal(PPS), nal(IDR)].concat()
    }

    fn p_au() -> Vec<u8> {
        [nal(AUD), nal(P_FIRST)].concat()
    }

    #[test]
    fn splits_on_delimiters_regardless_of_read_boundaries() {
        let stream = [idr_au(), p_au(), p_au(), nal(AUD)].concat();
        let mut framer = AccessUnitFramer::new(Codec::H264, 1 << 20);

        let mut units = Vec::new();
        for byte in &stream {
            units.extend(framer.push(std::slice::from_ref(byte)));
        }

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].data.as_ref(), idr_au().as_slice());
        assert!(units[0].keyframe);
        assert_eq!(units[1].data.as_ref(), p_au().as_slice());
        assert!(!units[1].keyframe);
        // trailing AUD is the start of a fourth unit still being accumulated
        assert_eq!(framer.buffered(), nal(AUD).len());
    }

    #[test]
    fn finds_start_codes_split_at_any_offset() {
        let stream = [p_au(), idr_au(), p_au(), nal(AUD)].concat();
        for split in 1..stream.len() {
            let mut framer = AccessUnitFramer::new(Codec::H264, 1 << 20);
            let mut units = framer.push(&stream[..split]);
            units.extend(framer.push(&stream[split..]));

            let got: Vec<&[u8]> = units.iter().map(|u| u.data.as_ref()).collect();
            assert_eq!(
                got,
                vec![p_au().as_slice(), idr_au().as_slice(), p_au().as_slice()],
                "split at {split}"
            );
        }
    }

    #[test]
    fn uses_first_slice_flag_without_delimiters() {
        let first = [nal(SPS), nal(PPS), nal(IDR)].concat();
        let second = [nal(P_FIRST), nal(P_SECOND_SLICE)].concat();
        let third = nal(P_FIRST);
        let stream = [first.clone(), second.clone(), third].concat();

        let mut framer = AccessUnitFramer::new(Codec::H264, 1 << 20);
        let units = framer.push(&stream);

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data.as_ref(), first.as_slice());
        // the second slice of the same picture stays in its access unit
        assert_eq!(units[1].data.as_ref(), second.as_slice());
    }

    #[test]
    fn discards_bytes_before_first_start_code() {
        let stream = [vec![0xDE, 0xAD, 0xBE, 0xEF], p_au(), nal(AUD)].concat();
        let mut framer = AccessUnitFramer::new(Codec::H264, 1 << 20);
        let units = framer.push(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data.as_ref(), p_au().as_slice());
    }

    #[test]
    fn resyncs_when_unit_exceeds_limit() {
        let mut framer = AccessUnitFramer::new(Codec::H264, 64);
        let mut huge = nal(IDR);
        huge.extend(std::iter::repeat(0x55).take(128));
        assert!(framer.push(&huge).is_empty());
        assert_eq!(framer.resyncs(), 1);
        assert_eq!(framer.buffered(), 0);

        // stream recovers on the next clean units
        let units = framer.push(&[p_au(), p_au()].concat());
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data.as_ref(), p_au().as_slice());
    }

    #[test]
    fn frames_h265() {
        let aud   = nal(&[0x46, 0x01, 0x50]);             // type 35
        let vps   = nal(&[0x40, 0x01, 0x0C, 0x01]);       // type 32
        let idr   = nal(&[0x26, 0x01, 0xAF, 0x06]);       // type 19, first slice
        let trail = nal(&[0x02, 0x01, 0xD0, 0x10]);       // type 1, first slice

        let first = [aud.clone(), vps, idr].concat();
        let second = [aud.clone(), trail].concat();
        let stream = [first.clone(), second.clone(), aud].concat();

        let mut framer = AccessUnitFramer::new(Codec::H265, 1 << 20);
        let units = framer.push(&stream);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data.as_ref(), first.as_slice());
        assert!(units[0].keyframe);
        assert_eq!(units[1].data.as_ref(), second.as_slice());
        assert!(!units[1].keyframe);
    }
}
