//! 通用工具

pub mod time;

pub use time::{normalize_time, TimeNormalizer, TimeOfDay, TimezoneConfig, EPOCH_SANITY_THRESHOLD};
