//! Property-based tests for state histories.
//!
//! Random write sequences are replayed against a plain in-memory model, then
//! every point query and range query of the built history is compared with
//! the model.

use alopex_statehist::{HistoryTreeConfig, StateSystemBuilder, StateValue};
use proptest::prelude::*;
use tempfile::TempDir;

const ATTRIBUTES: usize = 4;

/// Strategy for write sequences: (time delta, attribute, value).
///
/// Deltas of zero exercise same-timestamp replacements.
fn writes_strategy() -> impl Strategy<Value = Vec<(i64, usize, i32)>> {
    prop::collection::vec((0i64..20, 0..ATTRIBUTES, -1000i32..1000), 1..200)
}

/// Small nodes so that even short sequences split the tree.
fn config_strategy() -> impl Strategy<Value = HistoryTreeConfig> {
    (320usize..1024, 2usize..6).prop_map(|(block_size, max_children)| {
        HistoryTreeConfig::default()
            .with_block_size(block_size)
            .with_max_children(max_children)
    })
}

/// Value of every attribute at every time in `[0, end]`.
fn model(writes: &[(i64, usize, i32)], end: i64) -> Vec<Vec<StateValue>> {
    let mut timeline = vec![vec![StateValue::Null; end as usize + 1]; ATTRIBUTES];
    let mut time = 0;
    for &(delta, attribute, value) in writes {
        time += delta;
        for slot in &mut timeline[attribute][time as usize..] {
            *slot = StateValue::Int(value);
        }
    }
    timeline
}

proptest! {
    /// Point queries on the sealed history match the model at every time.
    #[test]
    fn test_point_queries_match_model(
        writes in writes_strategy(),
        config in config_strategy(),
        tail in 0i64..10,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut builder =
            StateSystemBuilder::create(&temp_dir.path().join("p.ht"), "prop", 0, config).unwrap();
        let quarks: Vec<_> = (0..ATTRIBUTES)
            .map(|i| builder.get_or_create_quark(&[i.to_string()]))
            .collect();

        let mut time = 0;
        for &(delta, attribute, value) in &writes {
            time += delta;
            builder.modify_attribute(time, quarks[attribute], value).unwrap();
        }
        let end = time + tail;
        let ss = builder.close_history(end).unwrap();
        let expected = model(&writes, end);

        for (attribute, &quark) in quarks.iter().enumerate() {
            for t in 0..=end {
                let interval = ss.query_single_state(t, quark).unwrap();
                prop_assert!(interval.contains(t));
                prop_assert_eq!(interval.value(), &expected[attribute][t as usize], "Time {}", t);
            }
        }
    }

    /// Range queries return non-overlapping intervals covering the history.
    #[test]
    fn test_range_queries_are_gap_free(
        writes in writes_strategy(),
        config in config_strategy(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut builder =
            StateSystemBuilder::create(&temp_dir.path().join("r.ht"), "prop", 0, config).unwrap();
        let quarks: Vec<_> = (0..ATTRIBUTES)
            .map(|i| builder.get_or_create_quark(&["CPUs".to_string(), i.to_string()]))
            .collect();

        let mut time = 0;
        for &(delta, attribute, value) in &writes {
            time += delta;
            builder.modify_attribute(time, quarks[attribute], value).unwrap();
        }
        let ss = builder.close_history(time).unwrap();

        for &quark in &quarks {
            let history = ss.query_history_range(quark, 0, time).unwrap();
            prop_assert_eq!(history[0].start(), 0);
            prop_assert_eq!(history[history.len() - 1].end(), time);
            for pair in history.windows(2) {
                prop_assert_eq!(pair[0].end() + 1, pair[1].start());
            }
        }
    }
}
