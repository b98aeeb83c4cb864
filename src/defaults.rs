// src/defaults.rs

// Pipeline Constants
pub const MIN_ALIGNMENT_LENGTH: usize = 100;
pub const KMER_FREQUENCY: usize = 10;

// Filter Constants
pub const CHAIN_GAP: u64 = 2000;
pub const MAX_PER_QUERY: usize = 100;
pub const MAX_PER_TARGET: usize = 1;
pub const MAX_OVERLAP: f64 = 0.5;

// Streaming Constants
pub const BUFFER_DEPTH: usize = 4;

// Tabular Format Constants
pub const PAF_MANDATORY_FIELDS: usize = 12;
pub const DEFAULT_MAPPING_QUALITY: u8 = 255;

// Environment variable consulted before PATH when locating external binaries
pub const BIN_DIR_ENV: &str = "ALNSWEEP_BIN_DIR";

// Other Constants
pub const VERBOSITY: i32 = 3;
