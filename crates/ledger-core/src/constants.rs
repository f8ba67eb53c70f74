pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
/// Highest difficulty that can ever be satisfied by a hex digest.
pub const MAX_DIFFICULTY: u32 = HASH_HEX_SIZE as u32;
pub const AMOUNT_DECIMALS: usize = 8;
pub const AMOUNT_SCALE: i64 = 100_000_000;
pub const GENESIS_PAYER: &str = "genesis";
