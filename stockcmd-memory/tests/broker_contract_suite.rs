//! Runs the shared broker contract suite against the in-memory adapter.

use stockcmd_testing::contract::broker_contract_tests;

broker_contract_tests! {
    suite = in_memory,
    make_broker = stockcmd_memory::InMemoryBroker::new,
}
