//! Channel-level tests.
//!
//! - `harness.rs`       - sender fakes, mock HTTP endpoint, fixtures
//! - `scenarios.rs`     - end-to-end flush outcomes (deliver, quarantine, drop, recover, abandon)
//! - `crash_safety.rs`  - write-ahead durability and restart recovery
//! - `backpressure.rs`  - bounded permit wait and disposal
//! - `invariants.rs`    - single-flight transmission and sweeping, backlog bound, poison isolation
//! - `http.rs`          - delivery through `HttpBatchSender` against a loopback endpoint

mod invariants;
