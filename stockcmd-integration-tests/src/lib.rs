//! End-to-end tests of the inventory command pipeline.
//!
//! Publisher, consumer runtimes, inventory handlers and the in-memory
//! stores are wired together the way the service wires them, with the
//! in-memory broker in place of PostgreSQL.

// This is a test-only crate
#![cfg(test)]
