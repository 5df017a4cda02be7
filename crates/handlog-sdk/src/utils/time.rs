//! 时间处理工具模块
//!
//! 把表格里的自由格式时间单元格（`HH:MM`、`HH:MM:SS` 或纯数字 epoch 秒）
//! 统一转换为 epoch 秒。
//!
//! # 设计原则
//!
//! - **存储层**: 缓存里的时间统一使用 epoch 秒（`i64`）
//! - **时区**: 时刻字符串按配置的固定偏移解释；未配置时按系统本地时区逐日换算（跟随夏令时）
//! - **日期推断**: 只有时刻的单元格默认属于"今天"；若结果晚于当前时间则回退一天
//!   （午夜之后读取前一天记录的日志）
//! - **可测试**: 所有依赖"当前时间"的函数都有接受显式 `now` 的版本

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{HandlogSDKError, Result};

/// 纯数字 token 被视为 epoch 秒的最小值（约 2001-09-09）
pub const EPOCH_SANITY_THRESHOLD: i64 = 1_000_000_000;

static TIME_OF_DAY_RE: OnceLock<Regex> = OnceLock::new();

fn time_of_day_re() -> &'static Regex {
    TIME_OF_DAY_RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").expect("time-of-day pattern is valid")
    })
}

/// 时区配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimezoneConfig {
    /// 时区偏移（秒），例如：+09:00 = 32400, -05:00 = -18000
    pub offset_seconds: i32,
}

impl TimezoneConfig {
    /// 创建时区配置（从小时偏移）
    pub fn from_hours(hours: i32) -> Self {
        Self {
            offset_seconds: hours * 3600,
        }
    }

    /// 创建时区配置（从分钟偏移）
    pub fn from_minutes(minutes: i32) -> Self {
        Self {
            offset_seconds: minutes * 60,
        }
    }

    pub fn utc() -> Self {
        Self { offset_seconds: 0 }
    }

    /// 当前时刻的系统本地偏移（固定值，之后不随夏令时变化）
    pub fn local() -> Self {
        let now = Local::now();
        Self {
            offset_seconds: now.offset().local_minus_utc(),
        }
    }

    /// 获取 FixedOffset，偏移超出 ±24h 时返回 None
    pub fn to_fixed_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.offset_seconds)
    }
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self::local()
    }
}

/// 一天中的某个时刻（从 `HH:MM[:SS]` 解析）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    /// 解析 `H:MM`、`HH:MM` 或 `HH:MM:SS`；小时 0-23，分/秒 0-59
    pub fn parse(token: &str) -> Option<Self> {
        let caps = time_of_day_re().captures(token.trim())?;
        let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(2)?.as_str().parse().ok()?;
        let second: u32 = match caps.get(3) {
            Some(s) => s.as_str().parse().ok()?,
            None => 0,
        };

        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }

        Some(Self {
            hour,
            minute,
            second,
        })
    }

    /// 规范化的分钟键 `"HH:MM"`（不含秒）
    pub fn minute_key(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }

    /// 距当天零点的分钟数
    pub fn minute_of_day(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

/// 把用户输入的时刻字符串规范化为 `"HH:MM"`，例如 `"9:05"` → `"09:05"`
pub fn canonical_minute_key(token: &str) -> Option<String> {
    TimeOfDay::parse(token).map(|t| t.minute_key())
}

/// 解析 `"HH:MM"` 分钟键为当天分钟数
pub fn minute_key_to_minutes(key: &str) -> Option<u32> {
    TimeOfDay::parse(key).map(|t| t.minute_of_day())
}

/// 时刻字符串的解释时区
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    /// 显式配置的固定偏移
    Fixed(FixedOffset),
    /// 系统本地时区：每次换算都按当时日期取偏移（跟随夏令时）
    SystemLocal,
}

/// 时间规范化器
///
/// 持有时区与 epoch 阈值；本身无状态，可以随意 `Clone`。
#[derive(Debug, Clone, Copy)]
pub struct TimeNormalizer {
    zone: Zone,
    epoch_threshold: i64,
}

impl TimeNormalizer {
    pub fn new(timezone: TimezoneConfig, epoch_threshold: i64) -> Result<Self> {
        let offset = timezone.to_fixed_offset().ok_or_else(|| {
            HandlogSDKError::Config(format!(
                "invalid timezone offset: {}s",
                timezone.offset_seconds
            ))
        })?;

        Ok(Self {
            zone: Zone::Fixed(offset),
            epoch_threshold,
        })
    }

    /// 使用系统本地时区（含夏令时规则）
    pub fn with_local_zone(epoch_threshold: i64) -> Self {
        Self {
            zone: Zone::SystemLocal,
            epoch_threshold,
        }
    }

    /// 系统本地时区 + 默认阈值
    pub fn local() -> Self {
        Self::with_local_zone(EPOCH_SANITY_THRESHOLD)
    }

    /// 显式配置的固定偏移；系统本地时区时为 None
    pub fn fixed_offset(&self) -> Option<FixedOffset> {
        match self.zone {
            Zone::Fixed(offset) => Some(offset),
            Zone::SystemLocal => None,
        }
    }

    /// 以当前时间为基准规范化
    pub fn normalize(&self, token: &str) -> Option<i64> {
        self.normalize_at(token, Utc::now())
    }

    /// 以给定的 `now` 为基准规范化
    ///
    /// - 纯数字且大于阈值：原样返回（已经是 epoch 秒）
    /// - `HH:MM[:SS]`：今天的该时刻；若严格晚于 `now` 则取前一天的同一时刻
    /// - 其它：返回 None（表头、空单元格、格式错误都属正常情况，不报错）
    pub fn normalize_at(&self, token: &str, now: DateTime<Utc>) -> Option<i64> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }

        if token.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = token.parse::<i64>() {
                if value > self.epoch_threshold {
                    return Some(value);
                }
            }
        }

        let Some(time) = TimeOfDay::parse(token) else {
            debug!("时间解析失败: \"{}\"", token);
            return None;
        };

        match self.zone {
            Zone::Fixed(offset) => resolve_wall_clock(&offset, time, now),
            Zone::SystemLocal => resolve_wall_clock(&Local, time, now),
        }
    }

    /// epoch 秒在配置时区下的 `"HH:MM"` 分钟键
    pub fn minute_key_of(&self, timestamp: i64) -> Option<String> {
        let wall = self.wall_clock(timestamp)?;
        Some(format!("{:02}:{:02}", wall.hour(), wall.minute()))
    }

    /// epoch 秒在配置时区下距零点的分钟数
    pub fn minute_of_day(&self, timestamp: i64) -> Option<u32> {
        let wall = self.wall_clock(timestamp)?;
        Some(wall.hour() * 60 + wall.minute())
    }

    fn wall_clock(&self, timestamp: i64) -> Option<NaiveTime> {
        match self.zone {
            Zone::Fixed(offset) => offset.timestamp_opt(timestamp, 0).single().map(|dt| dt.time()),
            Zone::SystemLocal => Local.timestamp_opt(timestamp, 0).single().map(|dt| dt.time()),
        }
    }
}

/// 把"某天的 HH:MM:SS"落到具体时区：先取 `now` 当天，晚于 `now` 时取前一天
fn resolve_wall_clock<Tz: TimeZone>(tz: &Tz, time: TimeOfDay, now: DateTime<Utc>) -> Option<i64> {
    let on = |date: NaiveDate| -> Option<i64> {
        let naive = date.and_hms_opt(time.hour, time.minute, time.second)?;
        // 夏令时回拨造成的重复时刻取较早的一个
        tz.from_local_datetime(&naive).earliest().map(|dt| dt.timestamp())
    };

    let today = now.with_timezone(tz).date_naive();
    let candidate = on(today)?;
    if candidate > now.timestamp() {
        on(today.pred_opt()?)
    } else {
        Some(candidate)
    }
}

impl Default for TimeNormalizer {
    fn default() -> Self {
        Self::local()
    }
}

/// 使用系统本地时区规范化时间 token
pub fn normalize_time(token: &str) -> Option<i64> {
    TimeNormalizer::local().normalize(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_normalizer() -> TimeNormalizer {
        TimeNormalizer::new(TimezoneConfig::utc(), EPOCH_SANITY_THRESHOLD).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 17, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_timezone_config() {
        let config = TimezoneConfig::from_hours(9);
        assert_eq!(config.offset_seconds, 32400);

        let config = TimezoneConfig::from_minutes(540);
        assert_eq!(config.offset_seconds, 32400);

        assert!(TimezoneConfig::from_hours(30).to_fixed_offset().is_none());
        assert!(TimeNormalizer::new(TimezoneConfig::from_hours(30), 0).is_err());
        assert_eq!(
            TimeNormalizer::new(config, 0).unwrap().fixed_offset(),
            FixedOffset::east_opt(32400)
        );
    }

    #[test]
    fn test_time_of_day_parse() {
        assert_eq!(
            TimeOfDay::parse("9:05"),
            Some(TimeOfDay { hour: 9, minute: 5, second: 0 })
        );
        assert_eq!(TimeOfDay::parse("23:59:59").map(|t| t.second), Some(59));
        assert!(TimeOfDay::parse("24:00").is_none());
        assert!(TimeOfDay::parse("10:60").is_none());
        assert!(TimeOfDay::parse("10:15:60").is_none());
        assert!(TimeOfDay::parse("10:5").is_none());
        assert!(TimeOfDay::parse("Time").is_none());

        assert_eq!(canonical_minute_key("9:05:41").as_deref(), Some("09:05"));
        assert_eq!(minute_key_to_minutes("10:18"), Some(618));
    }

    #[test]
    fn test_normalize_past_time_today() {
        let n = utc_normalizer();
        let expected = Utc.with_ymd_and_hms(2025, 9, 17, 10, 18, 2).unwrap().timestamp();
        assert_eq!(n.normalize_at("10:18:02", fixed_now()), Some(expected));

        // 恰好等于 now 不算未来
        let exact = fixed_now().timestamp();
        assert_eq!(n.normalize_at("10:30", fixed_now()), Some(exact));
    }

    #[test]
    fn test_normalize_future_time_rolls_back_one_day() {
        let n = utc_normalizer();
        let expected = Utc.with_ymd_and_hms(2025, 9, 16, 23, 0, 0).unwrap().timestamp();
        assert_eq!(n.normalize_at("23:00", fixed_now()), Some(expected));
    }

    #[test]
    fn test_normalize_epoch_passthrough() {
        let n = utc_normalizer();
        assert_eq!(n.normalize_at("1758075882", fixed_now()), Some(1758075882));
        // 低于阈值的纯数字不是时间
        assert_eq!(n.normalize_at("138", fixed_now()), None);
        assert_eq!(n.normalize_at("1000000000", fixed_now()), None);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        let n = utc_normalizer();
        assert_eq!(n.normalize_at("", fixed_now()), None);
        assert_eq!(n.normalize_at("   ", fixed_now()), None);
        assert_eq!(n.normalize_at("Time", fixed_now()), None);
        assert_eq!(n.normalize_at("25:10", fixed_now()), None);
    }

    #[test]
    fn test_local_zone_follows_dst_per_date() {
        let n = TimeNormalizer::local();
        assert!(n.fixed_offset().is_none());

        // 冬季和夏季各取一个 now，结果都应落在当地墙上时间 10:00
        for now in [
            Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 15, 20, 0, 0).unwrap(),
        ] {
            let ts = n.normalize_at("10:00", now).unwrap();
            let wall = Local.timestamp_opt(ts, 0).unwrap();
            assert_eq!((wall.hour(), wall.minute()), (10, 0), "now={}", now);
            assert!(ts <= now.timestamp());
            assert!(now.timestamp() - ts < 25 * 3600);
            assert_eq!(n.minute_key_of(ts).as_deref(), Some("10:00"));
            assert_eq!(n.minute_of_day(ts), Some(600));
        }
    }

    #[test]
    fn test_normalize_respects_timezone() {
        // UTC+9 下 now 是 19:30，所以 "19:00" 是当天
        let n = TimeNormalizer::new(TimezoneConfig::from_hours(9), EPOCH_SANITY_THRESHOLD).unwrap();
        let ts = n.normalize_at("19:00", fixed_now()).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 9, 17, 10, 0, 0).unwrap().timestamp();
        assert_eq!(ts, expected);
        assert_eq!(n.minute_key_of(ts).as_deref(), Some("19:00"));
        assert_eq!(n.minute_of_day(ts), Some(19 * 60));
    }
}
