use crate::{
    BufferExtent, BuilderOptions, Error, Extent, GapPolicy, MemorySource, PassThroughExtent,
    StreamBuilder, ZeroExtent,
};
use proptest::prelude::*;
use std::sync::Arc;

const MAX_EXTENTS: usize = 12;
const MAX_EXTENT_LEN: u64 = 48;
const MAX_GAP: u64 = 16;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Fixed,
    Computed,
    Zero,
    PassThrough,
}

fn kind_strategy() -> impl Strategy<Value = Kind> {
    prop_oneof![
        Just(Kind::Fixed),
        Just(Kind::Computed),
        Just(Kind::Zero),
        Just(Kind::PassThrough),
    ]
}

/// Deterministic, non-zero content for an extent.
fn pattern(start: u64, length: u64, seed: u8) -> Vec<u8> {
    (0..length)
        .map(|i| ((start + i) as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

fn make_extent(kind: Kind, start: u64, length: u64, seed: u8) -> (Box<dyn Extent>, Vec<u8>) {
    let data = match kind {
        Kind::Zero => vec![0u8; length as usize],
        _ => pattern(start, length, seed),
    };
    let extent: Box<dyn Extent> = match kind {
        Kind::Fixed => Box::new(BufferExtent::fixed(start, data.clone())),
        Kind::Computed => {
            let content = data.clone();
            Box::new(BufferExtent::from_fn(start, length, move || Ok(content.clone())))
        }
        Kind::Zero => Box::new(ZeroExtent::new(start, length)),
        Kind::PassThrough => {
            // Source carries a prefix the extent skips over.
            let mut backing = vec![0xEEu8; 5];
            backing.extend_from_slice(&data);
            Box::new(PassThroughExtent::new(start, length, Arc::new(MemorySource::new(backing)), 5))
        }
    };
    (extent, data)
}

/// Non-overlapping extents as (gap before, length, kind, seed), plus a
/// permutation to add them in.
fn layout_strategy() -> impl Strategy<Value = (Vec<(u64, u64, Kind, u8)>, Vec<usize>)> {
    prop::collection::vec(
        (0..=MAX_GAP, 1..=MAX_EXTENT_LEN, kind_strategy(), any::<u8>()),
        0..=MAX_EXTENTS,
    )
    .prop_flat_map(|specs| {
        let order: Vec<usize> = (0..specs.len()).collect();
        (Just(specs), Just(order).prop_shuffle())
    })
}

/// Builds the stream and the expected bytes (gaps as zeros).
fn build(
    specs: &[(u64, u64, Kind, u8)],
    order: &[usize],
    options: BuilderOptions,
) -> (crate::BuiltStream, Vec<u8>) {
    let mut reference = Vec::new();
    let mut extents = Vec::with_capacity(specs.len());
    for &(gap, length, kind, seed) in specs {
        reference.resize(reference.len() + gap as usize, 0);
        let start = reference.len() as u64;
        let (extent, data) = make_extent(kind, start, length, seed);
        reference.extend_from_slice(&data);
        extents.push(Some(extent));
    }

    let mut builder = StreamBuilder::with_options(options);
    for &i in order {
        if let Some(extent) = extents[i].take() {
            builder.add_boxed(extent);
        }
    }
    (builder.seal().unwrap(), reference)
}

fn intersects(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_seal_rejects_exactly_the_overlapping_sets(
        ranges in prop::collection::vec((0u64..200, 1u64..=40), 0..=8)
    ) {
        let overlapping = ranges.iter().enumerate().any(|(i, &a)| {
            ranges[i + 1..].iter().any(|&b| intersects(a, b))
        });

        let mut builder = StreamBuilder::new();
        for &(start, length) in &ranges {
            builder.add(ZeroExtent::new(start, length));
        }

        match builder.seal() {
            Ok(stream) => {
                prop_assert!(!overlapping);
                let starts: Vec<u64> = stream.extents().map(|e| e.start()).collect();
                prop_assert!(starts.windows(2).all(|w| w[0] < w[1]));
            }
            Err(Error::Overlap { .. }) => prop_assert!(overlapping),
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    #[test]
    fn prop_reads_match_reference(
        (specs, order) in layout_strategy(),
        reads in prop::collection::vec((0u64..800, 0usize..200), 1..16),
    ) {
        let (stream, reference) = build(&specs, &order, BuilderOptions::default());
        let total = reference.len() as u64;
        prop_assert_eq!(stream.total_length(), total);

        for (offset, count) in reads {
            let offset = offset % (total + 2);
            let mut buf = vec![0xFFu8; count];
            match stream.read(offset, &mut buf) {
                Ok(n) => {
                    prop_assert!(offset <= total);
                    let expected_len = std::cmp::min(count as u64, total - offset) as usize;
                    prop_assert_eq!(n, expected_len);
                    let start = offset as usize;
                    prop_assert_eq!(&buf[..n], &reference[start..start + n]);
                }
                Err(Error::OutOfRange { .. }) => prop_assert!(offset > total),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }

    #[test]
    fn prop_point_lookup_agrees_with_linear_scan(
        (specs, order) in layout_strategy(),
        probes in prop::collection::vec(0u64..800, 1..32),
    ) {
        let (stream, reference) = build(&specs, &order, BuilderOptions::default());
        let total = reference.len() as u64 + 1;

        for probe in probes {
            let probe = probe % total;
            let linear = stream
                .extents()
                .find(|e| e.start() <= probe && probe < e.end())
                .map(|e| e.start());
            prop_assert_eq!(stream.find(probe).map(|e| e.start()), linear);
        }
    }

    #[test]
    fn prop_strict_reads_fail_only_on_gaps(
        (specs, order) in layout_strategy(),
        reads in prop::collection::vec((0u64..800, 1usize..64), 1..16),
    ) {
        let (stream, reference) =
            build(&specs, &order, BuilderOptions::default().with_gap_policy(GapPolicy::Strict));
        let total = reference.len() as u64;
        prop_assume!(total > 0);

        for (offset, count) in reads {
            let offset = offset % total;
            let end = std::cmp::min(offset + count as u64, total);
            let touches_gap = (offset..end).any(|pos| stream.find(pos).is_none());

            let mut buf = vec![0u8; count];
            match stream.read(offset, &mut buf) {
                Ok(n) => {
                    prop_assert!(!touches_gap);
                    let start = offset as usize;
                    prop_assert_eq!(&buf[..n], &reference[start..start + n]);
                }
                Err(Error::OutOfRange { .. }) => prop_assert!(touches_gap),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}
