//! Types supplied by the external container parser.

use crate::error::{Error, Result};
use crate::source::SourceLayout;
use crate::sync::{AudioCodec, StreamKind};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub number: u64,
    #[serde(rename = "type")]
    pub track_type: TrackType,
    pub codec_id: String,
    #[serde(default)]
    pub codec_private: Vec<u8>,
    /// Audio channel count, when the parser reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
}

/// One frame/block payload as laid out in the container file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub offset: u64,
    pub size: u64,
    pub track: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub keyframe: bool,
}

impl Packet {
    /// End offset; validated lists never saturate here.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

impl Track {
    /// Sync-point kind for this track's payloads.
    pub fn stream_kind(&self) -> StreamKind {
        let id = self.codec_id.as_str();
        match id {
            "V_MPEG4/ISO/AVC" => StreamKind::LengthPrefixed { size_len: self.nal_size_len(4) },
            "V_MPEGH/ISO/HEVC" => StreamKind::LengthPrefixed { size_len: self.nal_size_len(21) },
            _ if id.starts_with("V_") => StreamKind::AnnexB,
            _ if id.starts_with("A_AC3") || id.starts_with("A_EAC3") => {
                StreamKind::Audio(AudioCodec::Ac3)
            }
            _ if id.starts_with("A_DTS") => StreamKind::Audio(AudioCodec::Dts),
            _ if id.starts_with("A_MPEG/L") => StreamKind::Audio(AudioCodec::Mpeg),
            _ if id.starts_with("A_AAC") => StreamKind::Audio(AudioCodec::Aac),
            "A_TRUEHD" | "A_MLP" => StreamKind::Audio(AudioCodec::TrueHd),
            _ if id.starts_with("A_PCM/INT") => StreamKind::Audio(AudioCodec::Lpcm),
            _ if id.starts_with("S_") => StreamKind::Subtitle,
            _ => match self.track_type {
                TrackType::Video => StreamKind::AnnexB,
                TrackType::Subtitle => StreamKind::Subtitle,
                TrackType::Audio | TrackType::Other => StreamKind::Audio(AudioCodec::Other),
            },
        }
    }

    /// Bytes per PCM frame, when this is an integer PCM track with a known layout.
    pub fn pcm_frame_bytes(&self) -> Option<usize> {
        if self.stream_kind() != StreamKind::Audio(AudioCodec::Lpcm) {
            return None;
        }
        let channels = self.channels.filter(|&c| c > 0)? as usize;
        let sample = (self.bit_depth.filter(|&b| b > 0)? as usize).div_ceil(8);
        Some(channels * sample)
    }

    /// NAL length-field size stored in the low two bits of the avcC/hvcC byte at `at`.
    fn nal_size_len(&self, at: usize) -> u8 {
        self.codec_private.get(at).map(|b| (b & 0x03) + 1).unwrap_or(4)
    }
}

/// The parser's output for one container file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PacketList {
    pub tracks: Vec<Track>,
    pub packets: Vec<Packet>,
}

impl PacketList {
    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path)?;
        let list: PacketList = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| Error::InvalidInput(format!("packet list {}: {e}", path.display())))?;
        list.validate()?;
        Ok(list)
    }

    /// Every packet must reference a known track and end inside the u64 range.
    pub fn validate(&self) -> Result<()> {
        for p in &self.packets {
            if !self.tracks.iter().any(|t| t.number == p.track) {
                return Err(Error::InvalidInput(format!(
                    "packet at {} references unknown track {}",
                    p.offset, p.track
                )));
            }
            if p.offset.checked_add(p.size).is_none() {
                return Err(Error::InvalidInput(format!(
                    "packet at {} with size {} overflows",
                    p.offset, p.size
                )));
            }
        }
        Ok(())
    }
}

const TRANSCODED_AUDIO: &[&str] = &["A_AAC", "A_OPUS", "A_VORBIS", "A_FLAC"];

/// Coarse check that the container's codecs could have been remuxed from
/// a source of this layout. Each returned line describes one suspicious track.
pub fn codec_warnings(layout: SourceLayout, tracks: &[Track]) -> Vec<String> {
    let mut out = Vec::new();
    for t in tracks {
        let id = t.codec_id.as_str();
        let video_mismatch = match layout {
            SourceLayout::Dvd => {
                t.track_type == TrackType::Video && !matches!(id, "V_MPEG1" | "V_MPEG2")
            }
            SourceLayout::Bluray => {
                t.track_type == TrackType::Video
                    && !matches!(
                        id,
                        "V_MPEG2" | "V_MPEG4/ISO/AVC" | "V_MPEGH/ISO/HEVC" | "V_MS/VFW/FOURCC"
                    )
            }
        };
        let audio_transcoded = TRANSCODED_AUDIO.iter().any(|p| id.starts_with(p));
        if video_mismatch || audio_transcoded {
            out.push(format!(
                "track {} ({id}) is unlikely to come from a {layout:?} source unchanged; \
                 expect little deduplication",
                t.number
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(number: u64, track_type: TrackType, codec_id: &str) -> Track {
        Track {
            number,
            track_type,
            codec_id: codec_id.into(),
            codec_private: Vec::new(),
            channels: None,
            bit_depth: None,
        }
    }

    fn packet(offset: u64, size: u64, track: u64) -> Packet {
        Packet { offset, size, track, timestamp: 0, keyframe: false }
    }

    #[test]
    fn validate_rejects_unknown_track_and_overflow() {
        let mut list = PacketList {
            tracks: vec![track(1, TrackType::Video, "V_MPEG2")],
            packets: vec![packet(10, 20, 1)],
        };
        list.validate().unwrap();

        list.packets.push(packet(40, 5, 9));
        assert!(matches!(list.validate(), Err(Error::InvalidInput(_))));

        list.packets[1] = packet(u64::MAX - 3, 10, 1);
        assert!(matches!(list.validate(), Err(Error::InvalidInput(_))));
        assert_eq!(list.packets[1].end(), u64::MAX);
    }

    #[test]
    fn packet_list_loads_audio_layout_from_json() {
        let json = r#"{
            "tracks": [{"number": 2, "type": "audio", "codec_id": "A_PCM/INT/LIT",
                        "channels": 3, "bit_depth": 24}],
            "packets": [{"offset": 0, "size": 9, "track": 2}]
        }"#;
        let list: PacketList = serde_json::from_str(json).unwrap();
        list.validate().unwrap();
        assert_eq!(list.tracks[0].pcm_frame_bytes(), Some(9));
        assert_eq!(track(2, TrackType::Audio, "A_PCM/INT/LIT").pcm_frame_bytes(), None);
        assert_eq!(track(2, TrackType::Audio, "A_AC3").pcm_frame_bytes(), None);
    }

    #[test]
    fn warnings_flag_tracks_foreign_to_the_layout() {
        let tracks = vec![
            track(1, TrackType::Video, "V_MPEG4/ISO/AVC"),
            track(2, TrackType::Audio, "A_AC3"),
            track(3, TrackType::Audio, "A_AAC"),
            track(4, TrackType::Subtitle, "S_VOBSUB"),
        ];
        let dvd = codec_warnings(SourceLayout::Dvd, &tracks);
        assert_eq!(dvd.len(), 2);
        assert!(dvd[0].starts_with("track 1 (V_MPEG4/ISO/AVC)"));
        assert!(dvd[1].starts_with("track 3 (A_AAC)"));

        let bluray = codec_warnings(SourceLayout::Bluray, &tracks);
        assert_eq!(bluray.len(), 1);
        assert!(bluray[0].contains("Bluray"));
        assert!(codec_warnings(SourceLayout::Bluray, &tracks[1..2]).is_empty());
    }
}
