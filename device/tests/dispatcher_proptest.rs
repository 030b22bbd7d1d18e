// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Property: every group index in `0..num_groups` is claimed exactly once,
//! no matter how many threads race to claim them.

use std::sync::Arc;
use std::thread;

use device::exec::Dispatcher;
use proptest::prelude::*;

proptest! {
    #[test]
    fn claims_cover_every_index_exactly_once(num_groups in 0usize..2000, num_claimers in 1usize..17) {
        let dispatcher = Arc::new(Dispatcher::new(num_groups));

        let handles: Vec<_> = (0..num_claimers)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(i) = dispatcher.claim_next_group() {
                        claimed.push(i);
                    }
                    claimed
                })
            })
            .collect();

        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();

        prop_assert_eq!(all, (0..num_groups).collect::<Vec<_>>());
        prop_assert_eq!(dispatcher.claim_next_group(), None);
    }
}
