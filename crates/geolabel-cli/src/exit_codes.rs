//! Process exit codes. Part of the CLI contract.

pub const SUCCESS: i32 = 0;
pub const ENRICH_FAILED: i32 = 1; // --strict and at least one record failed
pub const CONFIG_ERROR: i32 = 2; // Bad flags/config, unreadable input, missing geo table
