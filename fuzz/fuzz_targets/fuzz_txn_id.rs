//! Fuzz target for transaction id decoding and status tablet selection.
//!
//! Arbitrary bytes must never panic; valid ids must select the same
//! status tablet every time.

#![no_main]

use libfuzzer_sys::fuzz_target;
use xcluster_consumer::output_client::select_status_tablet;
use xcluster_consumer::types::TransactionId;

fuzz_target!(|data: (&[u8], u8)| {
    let (bytes, tablet_count) = data;
    let tablets: Vec<String> = (0..tablet_count).map(|i| format!("status-{i}")).collect();

    match TransactionId::from_bytes(bytes) {
        Ok(id) => {
            assert_eq!(bytes.len(), TransactionId::LEN);
            assert_eq!(id.as_bytes().as_slice(), bytes);

            match select_status_tablet(&id, &tablets) {
                Ok(first) => {
                    let again = select_status_tablet(&id, &tablets).unwrap();
                    assert_eq!(first, again);
                }
                Err(_) => assert!(tablets.is_empty()),
            }
        }
        Err(_) => assert_ne!(bytes.len(), TransactionId::LEN),
    }
});
