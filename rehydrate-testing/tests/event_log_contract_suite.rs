//! A chaos wrapper with nothing to inject must be indistinguishable from the
//! log it wraps.

use rehydrate_testing::event_log_contract_tests;

event_log_contract_tests! {
    suite = behind_passive_chaos,
    make_log = || {
        use rehydrate_testing::{ChaosConfig, ChaosEventLogExt};
        rehydrate_memory::InMemoryEventLog::new().with_chaos(ChaosConfig::deterministic())
    },
}
