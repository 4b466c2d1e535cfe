// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use cpugov::edp::EdpLimit;
use cpugov::edp::EdpTables;
use cpugov::testing::TestRig;
use cpugov::FrequencyTable;
use cpugov::Governor;
use cpugov::Tunables;
use cpugov::REFERENCE_FREQS;

pub fn governor(rig: &TestRig) -> Governor {
    governor_with(rig, Tunables::default())
}

pub fn governor_with(rig: &TestRig, tunables: Tunables) -> Governor {
    Governor::new(FrequencyTable::reference(), rig.platform(), tunables, None).unwrap()
}

/// Reference table with `extra` entries added.
pub fn table_with(extra: &[u32]) -> FrequencyTable {
    let mut freqs = REFERENCE_FREQS.to_vec();
    freqs.extend_from_slice(extra);
    FrequencyTable::new(freqs).unwrap()
}

/// Two zones split at 60C and a system alarm table.
pub fn edp_tables() -> EdpTables {
    EdpTables {
        limits: vec![
            EdpLimit {
                temperature: 23,
                freq_limits: vec![1700000, 1400000, 1200000, 1000000],
                freq_limits_oc: vec![],
            },
            EdpLimit {
                temperature: 60,
                freq_limits: vec![1300000, 1100000, 1000000, 860000],
                freq_limits_oc: vec![],
            },
        ],
        system_limits: vec![1000000, 860000, 760000, 640000],
    }
}

pub fn governor_with_edp(rig: &TestRig) -> Governor {
    Governor::new(
        FrequencyTable::reference(),
        rig.platform(),
        Tunables::default(),
        Some(edp_tables()),
    )
    .unwrap()
}
