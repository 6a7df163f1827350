//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema strings and
//! block-version thresholds that both the manager and its sandboxes agree on.
//! Thresholds are append-only: historical blocks replay against the branch
//! that was in force when they were produced, so an existing value never moves.

pub const CVM_WIRE_SCHEMA_VERSION: &str = "cvm.docker-vm-message@1.0.0";
pub const CVM_CONFIG_SCHEMA_VERSION: &str = "cvm.scheduler-config@0.3.0";
pub const CVM_TX_DURATION_REPORT_SCHEMA_VERSION: &str = "cvm.tx-duration.report@0.1.0";

/// First block version billed with the rebalanced gas rules.
pub const BLOCK_VERSION_GAS_V2: u32 = 2_300;

/// First block version whose contract keys carry the re-deployment index.
pub const BLOCK_VERSION_CONTRACT_INDEX: u32 = 2_220;

/// Maximum number of nested cross-contract calls below an original tx.
pub const CALL_CONTRACT_DEPTH: u32 = 5;

/// Upper bound of a single wire frame, header excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
