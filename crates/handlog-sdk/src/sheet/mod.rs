//! 表格镜像模块
//!
//! 职责：
//! - 解析远端表格导出的 CSV 文本（parser）
//! - 维护按行号 / 时间 / 牌局编号（hand number）索引的内存行缓存（cache）

pub mod parser;
pub mod cache;

pub use parser::{iter_rows, parse_line, parse_rows, rows_from_json, ParsedRow, RawRow, RowIter};
pub use cache::{
    CacheAnalysis, CacheStats, ColumnLayout, MatchStrategy, RebuildSummary, RowCache, RowCacheConfig, RowRecord,
    TimeOfDayBuckets,
};
