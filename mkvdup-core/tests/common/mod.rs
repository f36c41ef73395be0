#![allow(dead_code)]

use mkvdup_core::container::{Packet, PacketList, Track, TrackType};
use std::path::{Path, PathBuf};

pub const VIDEO_PID: u16 = 0x1011;
pub const AC3_PID: u16 = 0x1100;
pub const LPCM_PID: u16 = 0x1101;
pub const AC3_PID_2: u16 = 0x1102;
const PMT_PID: u16 = 0x0100;

/// Pseudo-random bytes that never form a start code or audio sync word.
pub fn payload(rng: &mut fastrand::Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.u8(0x10..0xF0)).collect()
}

/// An MPEG video-like elementary stream: `frames` units, each starting
/// with a start code and `unit` bytes long.
pub fn video_es(rng: &mut fastrand::Rng, frames: usize, unit: usize) -> Vec<Vec<u8>> {
    (0..frames)
        .map(|i| {
            let mut f = vec![0x00, 0x00, 0x01, if i == 0 { 0xB3 } else { 0x00 }];
            f.extend(payload(rng, unit - 4));
            f
        })
        .collect()
}

pub fn ac3_frames(rng: &mut fastrand::Rng, frames: usize, unit: usize) -> Vec<Vec<u8>> {
    (0..frames)
        .map(|_| {
            let mut f = vec![0x0B, 0x77];
            f.extend(payload(rng, unit - 2));
            f
        })
        .collect()
}

/// Big-endian 16-bit stereo PCM frames as stored on disc.
pub fn lpcm_frames(rng: &mut fastrand::Rng, frames: usize, unit: usize) -> Vec<Vec<u8>> {
    assert_eq!(unit % 4, 0);
    (0..frames).map(|_| payload(rng, unit)).collect()
}

pub fn swap16(frame: &[u8]) -> Vec<u8> {
    frame.chunks_exact(2).flat_map(|s| [s[1], s[0]]).collect()
}

/// Write `bytes` as `VIDEO_TS/VTS_01_1.VOB` under a fresh directory.
pub fn dvd_source(dir: &Path, bytes: &[u8]) -> PathBuf {
    let root = dir.join("dvd");
    std::fs::create_dir_all(root.join("VIDEO_TS")).unwrap();
    std::fs::write(root.join("VIDEO_TS").join("VTS_01_1.VOB"), bytes).unwrap();
    root
}

/// Minimal 192-byte-packet transport stream writer.
pub struct TsWriter {
    out: Vec<u8>,
    cc: std::collections::HashMap<u16, u8>,
}

impl TsWriter {
    pub fn new() -> Self {
        Self { out: Vec::new(), cc: Default::default() }
    }

    fn packet(&mut self, pid: u16, pusi: bool, data: &[u8]) {
        assert!(data.len() <= 184);
        let cc = self.cc.entry(pid).or_insert(0);
        let mut p = vec![0u8; 4];
        p.push(0x47);
        p.push((if pusi { 0x40 } else { 0 }) | (pid >> 8) as u8);
        p.push(pid as u8);
        let stuffing = 184 - data.len();
        if stuffing == 0 {
            p.push(0x10 | *cc);
        } else {
            p.push(0x30 | *cc);
            p.push((stuffing - 1) as u8);
            if stuffing > 1 {
                p.push(0x00);
                p.extend(std::iter::repeat(0xFF).take(stuffing - 2));
            }
        }
        *cc = (*cc + 1) & 0x0F;
        p.extend_from_slice(data);
        assert_eq!(p.len(), 192);
        self.out.extend(p);
    }

    pub fn tables(&mut self, streams: &[(u8, u16)]) {
        let pat = [
            0x00, 0x00, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01,
            0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8, 0xFF, 0xFF, 0xFF, 0xFF,
        ];
        self.packet(0, true, &pat);
        let section_len = 9 + 5 * streams.len() + 4;
        let mut pmt = vec![
            0x00,
            0x02,
            0xB0 | (section_len >> 8) as u8,
            section_len as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
        ];
        for &(stream_type, pid) in streams {
            pmt.extend([stream_type, 0xE0 | (pid >> 8) as u8, pid as u8, 0xF0, 0x00]);
        }
        pmt.extend([0xFF; 4]);
        self.packet(PMT_PID, true, &pmt);
    }

    /// One PES packet carrying `es`, preceded by `extra` (e.g. an LPCM header).
    pub fn pes(&mut self, pid: u16, stream_id: u8, extra: &[u8], es: &[u8]) {
        let mut body = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x00, 0x00];
        body.extend_from_slice(extra);
        body.extend_from_slice(es);
        for (i, chunk) in body.chunks(184).enumerate() {
            self.packet(pid, i == 0, chunk);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// 16-bit stereo Blu-ray LPCM header.
pub const LPCM_HEADER_16_STEREO: [u8; 4] = [0x00, 0x00, 0x31, 0x40];
/// 16-bit 3/0 Blu-ray LPCM header; frames carry a fourth, padding channel.
pub const LPCM_HEADER_16_3CH: [u8; 4] = [0x00, 0x00, 0x41, 0x40];

/// Write `bytes` as `BDMV/STREAM/00001.m2ts` under a fresh directory.
pub fn bluray_source(dir: &Path, bytes: &[u8]) -> PathBuf {
    let root = dir.join("bd");
    std::fs::create_dir_all(root.join("BDMV").join("STREAM")).unwrap();
    std::fs::write(root.join("BDMV").join("STREAM").join("00001.m2ts"), bytes).unwrap();
    root
}

/// Builds a container file: each frame is preceded by a short opaque block
/// header, and recorded as one packet. Block headers start and end with a
/// byte that never occurs in payloads, so matches cannot grow into them.
pub struct ContainerBuilder {
    pub bytes: Vec<u8>,
    pub list: PacketList,
    rng: fastrand::Rng,
}

impl ContainerBuilder {
    pub fn new(seed: u64, tracks: Vec<Track>) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let bytes = payload(&mut rng, 200);
        Self { bytes, list: PacketList { tracks, packets: Vec::new() }, rng }
    }

    pub fn frame(&mut self, track: u64, data: &[u8]) {
        let header = payload(&mut self.rng, 9);
        self.bytes.push(0x05);
        self.bytes.extend(header);
        self.bytes.push(0x05);
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(data);
        self.list.packets.push(Packet {
            offset,
            size: data.len() as u64,
            track,
            timestamp: 0,
            keyframe: false,
        });
    }

    pub fn trailer(&mut self, len: usize) {
        let t = payload(&mut self.rng, len);
        self.bytes.extend(t);
    }
}

pub fn track(number: u64, track_type: TrackType, codec_id: &str) -> Track {
    Track {
        number,
        track_type,
        codec_id: codec_id.to_string(),
        codec_private: Vec::new(),
        channels: None,
        bit_depth: None,
    }
}

pub fn pcm_track(number: u64, channels: u8, bit_depth: u8) -> Track {
    Track {
        channels: Some(channels),
        bit_depth: Some(bit_depth),
        ..track(number, TrackType::Audio, "A_PCM/INT/LIT")
    }
}
