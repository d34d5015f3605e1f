//! Fuzz target for key range routing.
//!
//! Checks that range filtering never panics on arbitrary bounds and
//! agrees with point containment.

#![no_main]

use libfuzzer_sys::fuzz_target;
use xcluster_consumer::record::{filter_tablets_by_key_range, KeyRange, RemoteTablet};

fuzz_target!(|data: (Vec<Vec<u8>>, Vec<u8>, Vec<u8>, Vec<u8>)| {
    let (mut splits, start, end, key) = data;
    splits.sort();
    splits.dedup();
    splits.retain(|s| !s.is_empty());

    let mut bounds = vec![Vec::new()];
    bounds.extend(splits);
    bounds.push(Vec::new());
    let tablets: Vec<RemoteTablet> = bounds
        .windows(2)
        .enumerate()
        .map(|(i, w)| RemoteTablet::new(format!("t-{i}"), KeyRange::new(w[0].clone(), w[1].clone())))
        .collect();

    // Exactly one owner per key
    let owners = tablets.iter().filter(|t| t.partition.contains(&key)).count();
    assert_eq!(owners, 1);

    let range = KeyRange::new(start.clone(), end.clone());
    let matched = filter_tablets_by_key_range(&tablets, &range);
    for tablet in &matched {
        assert!(range.overlaps(&tablet.partition));
    }

    // A non-empty range always reaches the owner of its first key
    if end.is_empty() || start < end {
        assert!(matched.iter().any(|t| t.partition.contains(&start)));
    }
});
