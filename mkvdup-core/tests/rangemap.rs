use mkvdup_core::rangemap::{swap_sample_bytes, LpcmFormat, RangeMap};
use mkvdup_core::Error;
use proptest::prelude::*;

fn map_from_json(json: &str) -> RangeMap {
    serde_json::from_str(json).unwrap()
}

#[test]
fn es_range_spanning_two_raw_ranges() {
    let mut m = RangeMap::new();
    m.push(1000, 20);
    m.push(2000, 30);
    assert_eq!(m.es_len(), 50);
    assert_eq!(m.translate(0, 50), Some(vec![(1000, 20), (2000, 30)]));
    assert_eq!(m.translate(15, 10), Some(vec![(1015, 5), (2000, 5)]));
    assert_eq!(m.translate(45, 10), None);
}

#[test]
fn equal_pieces_at_fixed_stride_collapse() {
    let mut m = RangeMap::new();
    for i in 0..100u64 {
        m.push(4 + i * 192, 184);
    }
    assert_eq!(m.runs().len(), 1);
    let run = m.runs()[0];
    assert_eq!((run.piece_len, run.raw_stride, run.count), (184, 192, 100));
    assert_eq!(m.translate(184 * 7 + 3, 2), Some(vec![(4 + 7 * 192 + 3, 2)]));
}

#[test]
fn contiguous_pieces_coalesce() {
    let mut m = RangeMap::new();
    m.push(500, 10);
    m.push(510, 7);
    assert_eq!(m.runs().len(), 1);
    assert_eq!(m.translate(0, 17), Some(vec![(500, 17)]));
}

#[test]
fn sample_swap_is_an_involution() {
    let mut buf = vec![1u8, 2, 3, 4, 5, 6, 7];
    swap_sample_bytes(&mut buf, 3);
    assert_eq!(buf, vec![3, 2, 1, 6, 5, 4, 7]);
    swap_sample_bytes(&mut buf, 3);
    assert_eq!(buf, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn tampered_runs_fail_validation() {
    let cases = [
        // zero-length pieces
        r#"{"runs":[{"es_start":0,"raw_start":0,"piece_len":0,"raw_stride":0,"count":3}],
            "es_len":0}"#,
        // ES offsets out of order
        r#"{"runs":[{"es_start":100,"raw_start":0,"piece_len":100,"raw_stride":100,"count":1},
                    {"es_start":0,"raw_start":500,"piece_len":100,"raw_stride":100,"count":1}],
            "es_len":200}"#,
        // pieces overlap in raw space
        r#"{"runs":[{"es_start":0,"raw_start":0,"piece_len":10,"raw_stride":5,"count":2}],
            "es_len":20}"#,
        // length disagrees with the runs
        r#"{"runs":[{"es_start":0,"raw_start":0,"piece_len":10,"raw_stride":10,"count":1}],
            "es_len":99}"#,
        // raw end past u64
        r#"{"runs":[{"es_start":0,"raw_start":18446744073709551615,
                     "piece_len":10,"raw_stride":10,"count":1}],"es_len":10}"#,
    ];
    for json in cases {
        let m = map_from_json(json);
        assert!(matches!(m.validate(), Err(Error::CorruptFormat(_))), "{json}");
    }
}

#[test]
fn translate_refuses_unsorted_runs() {
    let m = map_from_json(
        r#"{"runs":[{"es_start":100,"raw_start":0,"piece_len":100,"raw_stride":100,"count":1},
                    {"es_start":0,"raw_start":500,"piece_len":100,"raw_stride":100,"count":1}],
            "es_len":200}"#,
    );
    assert_eq!(m.translate(0, 50), None);
}

#[test]
fn odd_channel_pcm_drops_padding_channel() {
    let fmt = LpcmFormat { bits: 16, channels: 3 };
    assert_eq!((fmt.stored_channels(), fmt.frame_bytes(), fmt.stored_frame_bytes()), (4, 6, 8));
    // Two stored frames of big-endian samples, the fourth channel is padding.
    let stored = [1, 2, 3, 4, 5, 6, 0xEE, 0xEE, 7, 8, 9, 10, 11, 12, 0xEE, 0xEE];
    let mut out = Vec::new();
    fmt.normalize(&stored, &mut out);
    assert_eq!(out, vec![2, 1, 4, 3, 6, 5, 8, 7, 10, 9, 12, 11]);
    assert_eq!(fmt.indexed_len(stored.len() as u64), 12);
    // A truncated last frame keeps only audible bytes.
    assert_eq!(fmt.indexed_len(8 + 7), 12);
    assert_eq!(fmt.indexed_len(8 + 3), 9);

    let stereo = LpcmFormat { bits: 24, channels: 2 };
    assert_eq!((stereo.frame_bytes(), stereo.stored_frame_bytes()), (6, 6));
    assert!(!LpcmFormat { bits: 16, channels: 0 }.is_valid());
    assert!(!LpcmFormat { bits: 12, channels: 2 }.is_valid());
}

proptest! {
    #[test]
    fn translate_agrees_with_piecewise_map(
        pieces in prop::collection::vec((1u32..300, 0u64..50), 1..60),
        a in 0u64..20_000,
        b in 0u64..20_000,
    ) {
        // Reference: explicit per-byte ES -> raw table.
        let mut m = RangeMap::new();
        let mut raw = 0u64;
        let mut table = Vec::new();
        for (len, gap) in &pieces {
            raw += gap;
            m.push(raw, *len);
            table.extend(raw..raw + *len as u64);
            raw += *len as u64;
        }
        prop_assert_eq!(m.es_len(), table.len() as u64);
        prop_assert!(m.validate().is_ok());
        let total = table.len() as u64;
        let (start, end) = (a.min(b) % (total + 1), a.max(b) % (total + 1));
        let (start, end) = (start.min(end), start.max(end));
        let spans = m.translate(start, end - start).unwrap();
        let flat: Vec<u64> = spans.iter().flat_map(|&(o, n)| o..o + n).collect();
        prop_assert_eq!(&flat[..], &table[start as usize..end as usize]);
        prop_assert!(m.translate(start, total - start + 1).is_none());
    }
}
