//! Fuzz target for write request batching.
//!
//! Feeds arbitrary record routes into both strategies and checks no pair
//! is lost and no request exceeds the size limit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use xcluster_consumer::record::{ChangeRecord, KvPair, Operation};
use xcluster_consumer::types::HybridTime;
use xcluster_consumer::write_strategy::{ProcessRecordInfo, WriteStrategy, WriteStrategyKind};

fuzz_target!(|data: (Vec<(u8, u8)>, u8, bool)| {
    let (routes, max, per_record) = data;
    let max = usize::from(max).max(1);
    let kind = if per_record {
        WriteStrategyKind::PerRecord
    } else {
        WriteStrategyKind::Batched
    };
    let mut strategy = kind.build(max);

    let mut expected = 0;
    for (i, (tablet, key)) in routes.iter().enumerate() {
        let info = ProcessRecordInfo {
            tablet_id: format!("t-{}", tablet % 8),
            enable_replicate_transaction_status_table: false,
            status_tablet_id: None,
            last_compatible_consumer_schema_version: 1,
        };
        let changes = vec![KvPair::new(vec![*key], vec![])];
        let record = ChangeRecord::new(Operation::Write, HybridTime(i as u64), changes);
        strategy.process_record(&info, &record).unwrap();
        expected += 1;
    }

    let mut total = 0;
    while let Some(request) = strategy.next_write_request() {
        if !per_record {
            assert!(request.pairs.len() <= max);
        }
        assert_eq!(request.schema_version, 1);
        total += request.pairs.len();
    }
    assert_eq!(total, expected);
});
