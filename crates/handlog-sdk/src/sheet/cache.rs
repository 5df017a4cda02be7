//! 行缓存
//!
//! 远端表格的内存镜像：行号 → 记录，外加两个派生索引：
//! - 时间索引：`"HH:MM"` → 共享该分钟的行号集合（只用于近似查找，不含秒）
//! - 牌局编号索引：hand number → 最后一次出现该编号的行号
//!
//! 每次全量刷新都整体重建，不做增量修补：源数据在编辑/删除后不保证行身份稳定。
//! 所有查找"未找到"时返回 None，不报错。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sheet::parser::{ParsedRow, RawRow};
use crate::utils::time::{
    canonical_minute_key, minute_key_to_minutes, TimeNormalizer, TimeOfDay, TimezoneConfig,
    EPOCH_SANITY_THRESHOLD,
};

/// 列位置约定（0-based 下标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    /// 牌局编号列（默认第 2 列）
    pub hand_number: usize,
    /// 时刻列（默认第 3 列）
    pub time: usize,
    /// 状态列（默认第 5 列）
    pub status: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            hand_number: 1,
            time: 2,
            status: 4,
        }
    }
}

/// 最近时间查找策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// 容差内分钟差最小的行；并列时取行号最小者
    #[default]
    Nearest,
    /// 旧版行为：按行号顺序扫描，返回第一条落在容差内的行（不保证最近）
    FirstWithinTolerance,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RowCacheConfig {
    pub columns: ColumnLayout,
    /// 近似匹配的最大分钟差
    pub match_tolerance_minutes: u32,
    pub match_strategy: MatchStrategy,
    /// 纯数字 token 被视为 epoch 秒的阈值
    pub epoch_threshold: i64,
    /// 时刻字符串所在时区；None 表示系统本地时区
    pub timezone: Option<TimezoneConfig>,
}

impl Default for RowCacheConfig {
    fn default() -> Self {
        Self {
            columns: ColumnLayout::default(),
            match_tolerance_minutes: 3,
            match_strategy: MatchStrategy::Nearest,
            epoch_threshold: EPOCH_SANITY_THRESHOLD,
            timezone: None,
        }
    }
}

/// 缓存中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRecord {
    /// 源表格中的 1-based 行号
    pub row_number: usize,
    /// 原样保留的时刻 token
    pub time: String,
    /// 规范化的 `"HH:MM"`；纯牌局引用行（无时刻）为 None
    pub minute_key: Option<String>,
    /// epoch 秒
    pub timestamp: Option<i64>,
    pub hand_number: Option<u64>,
    pub status: String,
    pub raw_row: RawRow,
}

impl RowRecord {
    /// 距零点的分钟数
    pub fn minute_of_day(&self) -> Option<u32> {
        self.minute_key.as_deref().and_then(minute_key_to_minutes)
    }
}

/// 一次重建的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub cached: usize,
    pub dropped: usize,
}

/// 缓存统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub cache_size: usize,
    pub time_index_size: usize,
    pub hand_index_size: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// 按时段统计的行数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeOfDayBuckets {
    /// 00-06 时
    pub dawn: usize,
    /// 07-16 时
    pub day: usize,
    /// 17-21 时
    pub evening: usize,
    /// 22-23 时
    pub night: usize,
}

/// 缓存分布分析
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheAnalysis {
    pub total_rows: usize,
    pub hour_histogram: [usize; 24],
    pub buckets: TimeOfDayBuckets,
    /// 最早的分钟键
    pub earliest: Option<String>,
    /// 最晚的分钟键
    pub latest: Option<String>,
    /// 没有任何行的小时
    pub empty_hours: Vec<u32>,
}

/// 行缓存
#[derive(Debug)]
pub struct RowCache {
    config: RowCacheConfig,
    normalizer: TimeNormalizer,
    rows: BTreeMap<usize, RowRecord>,
    time_index: HashMap<String, BTreeSet<usize>>,
    hand_index: HashMap<u64, usize>,
    last_updated: Option<DateTime<Utc>>,
}

impl RowCache {
    pub fn new(config: RowCacheConfig) -> Result<Self> {
        let normalizer = match config.timezone {
            Some(tz) => TimeNormalizer::new(tz, config.epoch_threshold)?,
            None => TimeNormalizer::with_local_zone(config.epoch_threshold),
        };

        Ok(Self {
            config,
            normalizer,
            rows: BTreeMap::new(),
            time_index: HashMap::new(),
            hand_index: HashMap::new(),
            last_updated: None,
        })
    }

    pub fn config(&self) -> &RowCacheConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &TimeNormalizer {
        &self.normalizer
    }

    /// 用新的行序列整体替换缓存与索引
    pub fn rebuild<I>(&mut self, rows: I) -> RebuildSummary
    where
        I: IntoIterator<Item = ParsedRow>,
    {
        self.rebuild_at(rows, Utc::now())
    }

    /// 以给定的 `now` 解释时刻字符串并重建
    pub fn rebuild_at<I>(&mut self, rows: I, now: DateTime<Utc>) -> RebuildSummary
    where
        I: IntoIterator<Item = ParsedRow>,
    {
        let mut cache = BTreeMap::new();
        let mut time_index: HashMap<String, BTreeSet<usize>> = HashMap::new();
        let mut hand_index = HashMap::new();
        let mut summary = RebuildSummary::default();

        for row in rows {
            // 行号是缓存主键：重复行号只保留第一次出现的行
            if cache.contains_key(&row.row_number) {
                warn!("⚠️ 重复行号，跳过: row={}", row.row_number);
                summary.dropped += 1;
                continue;
            }

            match self.build_record(row, now) {
                Some(record) => {
                    if let Some(key) = &record.minute_key {
                        time_index
                            .entry(key.clone())
                            .or_default()
                            .insert(record.row_number);
                    }
                    if let Some(hand) = record.hand_number {
                        // 同一编号出现多次时以解析顺序中最后一行为准
                        hand_index.insert(hand, record.row_number);
                    }
                    cache.insert(record.row_number, record);
                    summary.cached += 1;
                }
                None => summary.dropped += 1,
            }
        }

        self.rows = cache;
        self.time_index = time_index;
        self.hand_index = hand_index;
        self.last_updated = Some(now);

        info!(
            "📋 行缓存已重建: cached={}, dropped={}, time_keys={}, hands={}",
            summary.cached,
            summary.dropped,
            self.time_index.len(),
            self.hand_index.len()
        );

        summary
    }

    fn build_record(&self, row: ParsedRow, now: DateTime<Utc>) -> Option<RowRecord> {
        let columns = self.config.columns;
        let cell = |index: usize| row.cells.get(index).map(|s| s.trim()).unwrap_or("");

        let time = cell(columns.time).to_string();
        let hand_number = parse_hand_number(cell(columns.hand_number));
        let status = cell(columns.status).to_string();

        let (timestamp, minute_key) = if time.is_empty() {
            if hand_number.is_none() {
                debug!("跳过空行引用: row={}", row.row_number);
                return None;
            }
            (None, None)
        } else {
            let Some(ts) = self.normalizer.normalize_at(&time, now) else {
                warn!("⚠️ 时间解析失败，跳过: row={}, token=\"{}\"", row.row_number, time);
                return None;
            };
            let key = match TimeOfDay::parse(&time) {
                Some(tod) => Some(tod.minute_key()),
                None => self.normalizer.minute_key_of(ts),
            };
            (Some(ts), key)
        };

        Some(RowRecord {
            row_number: row.row_number,
            time,
            minute_key,
            timestamp,
            hand_number,
            status,
            raw_row: row.cells,
        })
    }

    /// 按行号直接查找
    pub fn get_row(&self, row_number: usize) -> Option<&RowRecord> {
        self.rows.get(&row_number)
    }

    /// 精确分钟匹配，多行时返回行号最小者
    ///
    /// `time` 接受 `H:MM`、`HH:MM` 或 `HH:MM:SS`，秒会被忽略。
    pub fn find_exact(&self, time: &str) -> Option<&RowRecord> {
        let key = canonical_minute_key(time)?;
        self.first_in_minute(&key)
    }

    fn first_in_minute(&self, key: &str) -> Option<&RowRecord> {
        let row_number = self.time_index.get(key)?.iter().next()?;
        self.rows.get(row_number)
    }

    /// 最近时间查找（使用配置的策略）
    pub fn find_closest(&self, target_timestamp: i64) -> Option<&RowRecord> {
        self.find_closest_with(target_timestamp, self.config.match_strategy)
    }

    /// 最近时间查找
    ///
    /// 1. 目标所在分钟在时间索引中有行 → 行号最小的那行
    /// 2. 否则在容差内按策略扫描全部行
    pub fn find_closest_with(
        &self,
        target_timestamp: i64,
        strategy: MatchStrategy,
    ) -> Option<&RowRecord> {
        let target_key = self.normalizer.minute_key_of(target_timestamp)?;
        if let Some(record) = self.first_in_minute(&target_key) {
            debug!("精确匹配: {} → row {}", target_key, record.row_number);
            return Some(record);
        }

        let target_minutes = self.normalizer.minute_of_day(target_timestamp)?;
        let tolerance = self.config.match_tolerance_minutes;
        let mut best: Option<(&RowRecord, u32)> = None;

        for record in self.rows.values() {
            let Some(minutes) = record.minute_of_day() else {
                continue;
            };
            let diff = minutes.abs_diff(target_minutes);
            if diff > tolerance {
                continue;
            }

            match strategy {
                MatchStrategy::FirstWithinTolerance => return Some(record),
                MatchStrategy::Nearest => {
                    // 按行号升序遍历，严格小于才替换 → 并列时保留行号最小者
                    if best.map_or(true, |(_, best_diff)| diff < best_diff) {
                        best = Some((record, diff));
                    }
                }
            }
        }

        best.map(|(record, _)| record)
    }

    /// 按牌局编号查找
    pub fn lookup_hand(&self, hand_number: u64) -> Option<&RowRecord> {
        let row_number = self.hand_index.get(&hand_number)?;
        self.rows.get(row_number)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cache_size: self.rows.len(),
            time_index_size: self.time_index.len(),
            hand_index_size: self.hand_index.len(),
            last_updated: self.last_updated,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 按行号顺序遍历所有记录
    pub fn records(&self) -> impl Iterator<Item = &RowRecord> {
        self.rows.values()
    }

    /// 时段分布分析
    pub fn analyze(&self) -> CacheAnalysis {
        let mut hour_histogram = [0usize; 24];
        let mut buckets = TimeOfDayBuckets::default();

        for minutes in self.rows.values().filter_map(RowRecord::minute_of_day) {
            let hour = (minutes / 60) as usize;
            hour_histogram[hour] += 1;
            match hour {
                0..=6 => buckets.dawn += 1,
                7..=16 => buckets.day += 1,
                17..=21 => buckets.evening += 1,
                _ => buckets.night += 1,
            }
        }

        let mut keys: Vec<&String> = self.time_index.keys().collect();
        keys.sort();

        let empty_hours = hour_histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(hour, _)| hour as u32)
            .collect();

        CacheAnalysis {
            total_rows: self.rows.len(),
            hour_histogram,
            buckets,
            earliest: keys.first().map(|k| (*k).clone()),
            latest: keys.last().map(|k| (*k).clone()),
            empty_hours,
        }
    }
}

/// 牌局编号单元格：允许前缀 `#`
fn parse_hand_number(cell: &str) -> Option<u64> {
    let cell = cell.trim().trim_start_matches('#');
    if cell.is_empty() {
        return None;
    }
    cell.parse().ok()
}
