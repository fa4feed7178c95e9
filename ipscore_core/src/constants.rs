//! Geometry and format constants for the scoring engine

/// One bit per /24 prefix: 2^24 bits = 2 MiB.
pub const BITMAP_BITS: usize = 1 << 24;
pub const BITMAP_BYTES: usize = BITMAP_BITS / 8;

/// Number of /16 rows in the block directory.
pub const PREFIX16_COUNT: usize = 1 << 16;

/// /24 block slots per /16 row.
pub const BLOCKS_PER_ROW: usize = 256;

/// Host slots per /24 block.
pub const SCORES_PER_BLOCK: usize = 256;

pub const CACHE_LINE: usize = 64;

/// Stripe-lock pool size for directory/block allocation, indexed by
/// /16 prefix mod the pool size.
pub const ALLOC_LOCK_STRIPES: usize = 256;

/// Scores saturate at these bounds; -32768 is never stored.
pub const SCORE_MIN: i16 = -32767;
pub const SCORE_MAX: i16 = 32767;

// ===== archive format =====

pub const ARCHIVE_MAGIC: [u8; 4] = *b"SAUR";
pub const ARCHIVE_VERSION: u32 = 1;

/// magic(4) + version(4) + entry_count(8)
pub const ARCHIVE_HEADER_BYTES: u64 = 16;

/// ip(4) + score(2), packed
pub const ARCHIVE_ENTRY_BYTES: usize = 6;

/// Entries staged in memory between write syscalls during save.
pub const SAVE_BUFFER_ENTRIES: usize = 4096;

/// Safety cap on the archive entry count: one entry per possible IPv4
/// address. Anything larger is a corrupt or hostile header.
pub const MAX_ARCHIVE_ENTRIES: u64 = 1 << 32;

// ===== bulk loader =====

/// Read buffer for file-based bulk loads.
pub const BULK_READ_BUFFER: usize = 64 * 1024;
