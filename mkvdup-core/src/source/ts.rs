//! MPEG transport-stream demultiplexing for elementary-stream indexing.

use super::read_fill;
use super::scanner::SyncScanner;
use super::IndexerConfig;
use crate::error::{Error, Result};
use crate::index::{HashIndex, Location};
use crate::rangemap::{FileRangeMap, LpcmFormat, RangeMap, StreamMap};
use crate::sync::{AudioCodec, StreamKind};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{debug, warn};
use xxhash_rust::xxh64::Xxh64;

const TS_PACKET: usize = 188;
const M2TS_PACKET: usize = 192;
const SYNC_BYTE: u8 = 0x47;
const PES_FIXED_HEADER: usize = 9;
const LPCM_HEADER: usize = 4;
const FALLBACK_VIDEO_PID: u16 = 0x1011;
const FALLBACK_AUDIO_PIDS: RangeInclusive<u16> = 0x1100..=0x111F;

/// Map a PMT stream_type to the sync kind used for its elementary stream.
pub(crate) fn stream_kind_for_type(stream_type: u8) -> Option<StreamKind> {
    let kind = match stream_type {
        0x01 | 0x02 | 0x1B | 0x24 | 0xEA => StreamKind::AnnexB,
        0x80 => StreamKind::Audio(AudioCodec::Lpcm),
        0x81 | 0x84 | 0x87 | 0xA1 => StreamKind::Audio(AudioCodec::Ac3),
        0x82 | 0x85 | 0x86 | 0xA2 => StreamKind::Audio(AudioCodec::Dts),
        0x83 => StreamKind::Audio(AudioCodec::TrueHd),
        0x03 | 0x04 => StreamKind::Audio(AudioCodec::Mpeg),
        0x0F => StreamKind::Audio(AudioCodec::Aac),
        _ => return None,
    };
    Some(kind)
}

/// Returns `(packet stride, bytes before the 0x47 sync byte)`.
fn detect_packet_size(head: &[u8]) -> Option<(usize, usize)> {
    let fits = |stride: usize, lead: usize| {
        let count = (head.len() / stride).min(4);
        count > 0 && (0..count).all(|i| head.get(i * stride + lead) == Some(&SYNC_BYTE))
    };
    if fits(M2TS_PACKET, 4) {
        Some((M2TS_PACKET, 4))
    } else if fits(TS_PACKET, 0) {
        Some((TS_PACKET, 0))
    } else {
        None
    }
}

/// Blu-ray LPCM header: channel assignment in byte 2, sample size in byte 3.
fn parse_lpcm_header(h: &[u8]) -> Option<LpcmFormat> {
    let channels: u8 = match h.get(2)? >> 4 {
        1 => 1,
        3 => 2,
        4 | 5 => 3,
        6 | 7 => 4,
        8 => 5,
        9 => 6,
        10 => 7,
        11 => 8,
        _ => return None,
    };
    let bits = match h.get(3)? >> 6 {
        1 => 16,
        2 => 20,
        3 => 24,
        _ => return None,
    };
    Some(LpcmFormat { bits, channels })
}

struct EsStream {
    is_video: bool,
    substream: u8,
    kind: StreamKind,
    lpcm: Option<LpcmFormat>,
    map: RangeMap,
    scanner: SyncScanner,
    in_pes: bool,
    header_done: bool,
    hdr: Vec<u8>,
    lpcm_hdr: Vec<u8>,
}

impl EsStream {
    fn new(is_video: bool, substream: u8, kind: StreamKind, window: usize) -> Self {
        // Blu-ray TrueHD streams carry an interleaved AC-3 core.
        let kinds: Vec<StreamKind> = match kind {
            StreamKind::Audio(AudioCodec::TrueHd) => {
                vec![kind, StreamKind::Audio(AudioCodec::Ac3)]
            }
            _ => vec![kind],
        };
        Self {
            is_video,
            substream,
            kind,
            lpcm: None,
            map: RangeMap::new(),
            scanner: SyncScanner::new(&kinds, window),
            in_pes: false,
            header_done: false,
            hdr: Vec::with_capacity(32),
            lpcm_hdr: Vec::with_capacity(LPCM_HEADER),
        }
    }

    /// Consume one transport packet payload that starts at `raw_off` in the file.
    fn feed(&mut self, payload: &[u8], raw_off: u64, pusi: bool, file: u32, index: &mut HashIndex) {
        if pusi {
            self.in_pes = true;
            self.header_done = false;
            self.hdr.clear();
            self.lpcm_hdr.clear();
        }
        if !self.in_pes {
            return;
        }
        let mut pos = 0usize;
        while !self.header_done {
            let target = if self.hdr.len() < PES_FIXED_HEADER {
                PES_FIXED_HEADER
            } else {
                PES_FIXED_HEADER + self.hdr[8] as usize
            };
            if self.hdr.len() >= target {
                self.header_done = true;
                break;
            }
            if pos == payload.len() {
                return;
            }
            let take = (target - self.hdr.len()).min(payload.len() - pos);
            self.hdr.extend_from_slice(&payload[pos..pos + take]);
            pos += take;
            if self.hdr.len() >= PES_FIXED_HEADER && self.hdr[..3] != [0, 0, 1] {
                // Not a PES start; drop bytes until the next unit start.
                self.in_pes = false;
                return;
            }
        }
        if self.kind == StreamKind::Audio(AudioCodec::Lpcm) && self.lpcm_hdr.len() < LPCM_HEADER {
            let take = (LPCM_HEADER - self.lpcm_hdr.len()).min(payload.len() - pos);
            self.lpcm_hdr.extend_from_slice(&payload[pos..pos + take]);
            pos += take;
            if self.lpcm_hdr.len() < LPCM_HEADER {
                return;
            }
            // The layout is fixed by the first header, before any samples are indexed.
            if self.lpcm.is_none() && self.map.is_empty() {
                if let Some(fmt) = parse_lpcm_header(&self.lpcm_hdr) {
                    self.lpcm = Some(fmt);
                    self.scanner.set_lpcm(fmt);
                }
            }
        }
        let data = &payload[pos..];
        if data.is_empty() {
            return;
        }
        self.map.push(raw_off + pos as u64, data.len() as u32);
        let (is_video, substream) = (self.is_video, self.substream);
        let mut emit = |offset: u64, hash: u64| {
            index.insert(hash, Location { file, offset, is_video, substream });
        };
        self.scanner.push(data, &mut emit);
    }
}

struct TsDemuxer<'a> {
    file_idx: u32,
    window: usize,
    index: &'a mut HashIndex,
    pmt_pids: HashSet<u16>,
    streams: BTreeMap<u16, EsStream>,
    have_video: bool,
    next_substream: u8,
    saw_pmt: bool,
    bad_packets: u64,
}

fn psi_section(payload: &[u8]) -> Option<&[u8]> {
    let ptr = *payload.first()? as usize;
    let sec = payload.get(1 + ptr..)?;
    if sec.len() < 3 {
        return None;
    }
    let len = (((sec[1] & 0x0F) as usize) << 8) | sec[2] as usize;
    Some(&sec[..(3 + len).min(sec.len())])
}

fn pid_of(hi: u8, lo: u8) -> u16 {
    (((hi & 0x1F) as u16) << 8) | lo as u16
}

impl<'a> TsDemuxer<'a> {
    fn new(file_idx: u32, window: usize, index: &'a mut HashIndex) -> Self {
        Self {
            file_idx,
            window,
            index,
            pmt_pids: HashSet::new(),
            streams: BTreeMap::new(),
            have_video: false,
            next_substream: 0,
            saw_pmt: false,
            bad_packets: 0,
        }
    }

    /// `pkt` is one 188-byte transport packet located at `raw_off`.
    fn process(&mut self, pkt: &[u8], raw_off: u64) {
        if pkt.len() < TS_PACKET || pkt[0] != SYNC_BYTE {
            self.bad_packets += 1;
            return;
        }
        let pusi = pkt[1] & 0x40 != 0;
        let pid = pid_of(pkt[1], pkt[2]);
        let afc = (pkt[3] >> 4) & 0x03;
        if afc & 0x01 == 0 {
            return;
        }
        let mut start = 4usize;
        if afc & 0x02 != 0 {
            start += 1 + pkt[4] as usize;
        }
        if start >= TS_PACKET {
            return;
        }
        let payload = &pkt[start..TS_PACKET];
        if pid == 0 {
            if pusi {
                self.parse_pat(payload);
            }
            return;
        }
        if self.pmt_pids.contains(&pid) {
            if pusi {
                self.parse_pmt(payload);
            }
            return;
        }
        if !self.saw_pmt && !self.streams.contains_key(&pid) {
            if pid == FALLBACK_VIDEO_PID {
                self.register(pid, StreamKind::AnnexB);
            } else if FALLBACK_AUDIO_PIDS.contains(&pid) {
                self.register(pid, StreamKind::Audio(AudioCodec::Ac3));
            }
        }
        let file = self.file_idx;
        if let Some(s) = self.streams.get_mut(&pid) {
            s.feed(payload, raw_off + start as u64, pusi, file, &mut *self.index);
        }
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(sec) = psi_section(payload) else { return };
        if sec[0] != 0x00 || sec.len() < 12 {
            return;
        }
        let body_end = sec.len() - 4;
        for e in sec[8..body_end].chunks_exact(4) {
            let program = u16::from_be_bytes([e[0], e[1]]);
            if program != 0 {
                self.pmt_pids.insert(pid_of(e[2], e[3]));
            }
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        let Some(sec) = psi_section(payload) else { return };
        if sec[0] != 0x02 || sec.len() < 16 {
            return;
        }
        self.saw_pmt = true;
        let body_end = sec.len() - 4;
        let program_info = (((sec[10] & 0x0F) as usize) << 8) | sec[11] as usize;
        let mut i = 12 + program_info;
        while i + 5 <= body_end {
            let stream_type = sec[i];
            let pid = pid_of(sec[i + 1], sec[i + 2]);
            let info_len = (((sec[i + 3] & 0x0F) as usize) << 8) | sec[i + 4] as usize;
            i += 5 + info_len;
            if self.streams.contains_key(&pid) {
                continue;
            }
            match stream_kind_for_type(stream_type) {
                Some(kind) => self.register(pid, kind),
                None => debug!(pid, stream_type, "skipping unindexed stream"),
            }
        }
    }

    fn register(&mut self, pid: u16, kind: StreamKind) {
        let stream = if kind.is_video() {
            if self.have_video {
                return;
            }
            self.have_video = true;
            EsStream::new(true, 0, kind, self.window)
        } else {
            let sub = self.next_substream;
            self.next_substream = self.next_substream.saturating_add(1);
            EsStream::new(false, sub, kind, self.window)
        };
        debug!(pid, ?kind, substream = stream.substream, "registered elementary stream");
        self.streams.insert(pid, stream);
    }

    fn finish(self) -> FileRangeMap {
        let TsDemuxer { file_idx, index, streams, .. } = self;
        let mut out = Vec::with_capacity(streams.len());
        for (_pid, mut s) in streams {
            let (is_video, substream) = (s.is_video, s.substream);
            let mut emit = |offset: u64, hash: u64| {
                index.insert(hash, Location { file: file_idx, offset, is_video, substream });
            };
            s.scanner.finish(&mut emit);
            if s.map.is_empty() {
                continue;
            }
            out.push(StreamMap { is_video, substream, kind: s.kind, lpcm: s.lpcm, ranges: s.map });
        }
        out.sort_by_key(|s| (!s.is_video, s.substream));
        FileRangeMap { file: file_idx, streams: out }
    }
}

/// Demultiplex and index one transport-stream file.
/// Returns `(size, checksum, range maps)`.
pub(crate) fn index_ts_file(
    file_idx: u32,
    path: &Path,
    cfg: &IndexerConfig,
    index: &mut HashIndex,
    tick: &mut dyn FnMut(u64),
) -> Result<(u64, u64, FileRangeMap)> {
    let mut f = File::open(path)
        .map_err(|e| Error::IndexBuild(format!("open {}: {e}", path.display())))?;
    let mut head = vec![0u8; M2TS_PACKET * 4];
    let n = read_fill(&mut f, &mut head)?;
    if n == 0 {
        let empty = FileRangeMap { file: file_idx, streams: Vec::new() };
        return Ok((0, Xxh64::new(0).digest(), empty));
    }
    let (stride, lead) = detect_packet_size(&head[..n]).ok_or_else(|| {
        Error::IndexBuild(format!("{} is not an MPEG transport stream", path.display()))
    })?;
    f.seek(SeekFrom::Start(0))?;

    let mut demux = TsDemuxer::new(file_idx, cfg.window_size, index);
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0u8; (cfg.read_chunk / stride).max(1) * stride];
    let mut pos = 0u64;
    loop {
        let n = read_fill(&mut f, &mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        for (i, pkt) in buf[..n].chunks_exact(stride).enumerate() {
            demux.process(&pkt[lead..], pos + (i * stride + lead) as u64);
        }
        pos += n as u64;
        tick(n as u64);
    }
    if demux.bad_packets > 0 {
        warn!(file = %path.display(), bad = demux.bad_packets, "skipped packets without sync byte");
    }
    let map = demux.finish();
    Ok((pos, hasher.digest(), map))
}
