//! Runs the shared broker contract suite against PostgreSQL.

mod common;

use stockcmd_testing::contract::broker_contract_tests;

broker_contract_tests! {
    suite = postgres_contract,
    make_broker = crate::common::make_broker,
    attributes = [ignore = "requires Docker"],
}
