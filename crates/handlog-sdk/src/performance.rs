//! 性能监控模块
//!
//! 被动记录同步客户端的每一次 API 调用（类型、耗时、字节数）和错误，
//! 定期输出汇总报告，用来验证 checksum 轮询相对全量轮询节省的调用量。
//!
//! 内存有界：调用时间戳和流量样本只保留最近一小时，延迟样本只保留最近 N 个。

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// API 调用类型
pub mod call_type {
    pub const CHECKSUM: &str = "checksum";
    pub const FULL_DATA: &str = "full_data";
    pub const MULTI_CHECKSUM: &str = "multi_checksum";
    pub const CSV: &str = "csv";
}

/// 性能监控配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// 是否启用（关闭时 SDK 不创建监控器）
    pub enabled: bool,
    /// 定期报告间隔（秒）
    pub report_interval_secs: u64,
    /// 保留的延迟样本数
    pub latency_window: usize,
    /// 调用时间戳 / 流量样本的保留时长（秒）
    pub sample_retention_secs: u64,
    /// "最近调用率"的统计窗口（秒）
    pub recent_window_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_secs: 600,
            latency_window: 100,
            sample_retention_secs: 3600,
            recent_window_secs: 600,
        }
    }
}

#[derive(Debug)]
struct Metrics {
    total_calls: u64,
    calls_by_type: HashMap<String, u64>,
    call_times: VecDeque<Instant>,
    latency_samples: VecDeque<f64>,
    latency_min: Option<f64>,
    latency_max: Option<f64>,
    total_bytes: u64,
    transfer_samples: VecDeque<(Instant, u64)>,
    error_count: u64,
    errors_by_type: HashMap<String, u64>,
    last_reset: Instant,
    last_reset_at: DateTime<Utc>,
}

impl Metrics {
    fn new(now: Instant) -> Self {
        Self {
            total_calls: 0,
            calls_by_type: HashMap::new(),
            call_times: VecDeque::new(),
            latency_samples: VecDeque::new(),
            latency_min: None,
            latency_max: None,
            total_bytes: 0,
            transfer_samples: VecDeque::new(),
            error_count: 0,
            errors_by_type: HashMap::new(),
            last_reset: now,
            last_reset_at: Utc::now(),
        }
    }

    fn average_latency(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }
        self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64
    }
}

/// 最近窗口内的调用率
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentCallRate {
    pub count: usize,
    pub window_minutes: f64,
    pub calls_per_minute: f64,
}

/// 报告摘要
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_api_calls: u64,
    pub api_calls_per_minute: f64,
    pub estimated_daily_api_calls: u64,
    pub average_latency_ms: f64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub total_bytes: u64,
    /// 人类可读的总流量，例如 `"1.5 KB"`
    pub total_data_transfer: String,
    /// 错误率（百分比）
    pub error_rate: f64,
    pub monitoring_duration: String,
}

/// 报告明细
#[derive(Debug, Clone, Serialize)]
pub struct ReportDetails {
    pub api_calls_by_type: BTreeMap<String, u64>,
    pub error_types: BTreeMap<String, u64>,
    pub recent_api_calls: RecentCallRate,
    /// 保留窗口内的流量
    pub recent_bytes: u64,
    pub monitoring_since: DateTime<Utc>,
}

/// 性能报告
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub summary: ReportSummary,
    pub details: ReportDetails,
}

/// 性能监控器
pub struct PerformanceMonitor {
    config: MonitorConfig,
    metrics: RwLock<Metrics>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            metrics: RwLock::new(Metrics::new(Instant::now())),
            reporter: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// 记录一次 API 调用
    pub fn track_api_call(&self, call_type: &str, latency_ms: f64, bytes: u64) {
        self.track_api_call_at(call_type, latency_ms, bytes, Instant::now());
    }

    pub fn track_api_call_at(&self, call_type: &str, latency_ms: f64, bytes: u64, now: Instant) {
        {
            let mut m = self.metrics.write();
            m.total_calls += 1;
            *m.calls_by_type.entry(call_type.to_string()).or_insert(0) += 1;
            m.call_times.push_back(now);

            m.latency_samples.push_back(latency_ms);
            m.latency_min = Some(m.latency_min.map_or(latency_ms, |v| v.min(latency_ms)));
            m.latency_max = Some(m.latency_max.map_or(latency_ms, |v| v.max(latency_ms)));

            m.total_bytes += bytes;
            m.transfer_samples.push_back((now, bytes));
        }

        debug!(
            "API 调用: type={}, latency={:.0}ms, bytes={}",
            call_type, latency_ms, bytes
        );
        self.prune_at(now);
    }

    /// 记录一次错误
    pub fn track_error(&self, error_type: &str, error: &dyn fmt::Display) {
        {
            let mut m = self.metrics.write();
            m.error_count += 1;
            *m.errors_by_type.entry(error_type.to_string()).or_insert(0) += 1;
        }
        warn!("[Performance Monitor] Error: {} - {}", error_type, error);
    }

    /// 清理过期样本
    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    /// 以给定时刻为基准清理：时间戳/流量样本超过保留时长的丢弃，延迟样本只留最近 N 个
    pub fn prune_at(&self, now: Instant) {
        let retention = Duration::from_secs(self.config.sample_retention_secs);
        let mut m = self.metrics.write();

        while m
            .call_times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= retention)
        {
            m.call_times.pop_front();
        }
        while m
            .transfer_samples
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) >= retention)
        {
            m.transfer_samples.pop_front();
        }

        let window = self.config.latency_window.max(1);
        while m.latency_samples.len() > window {
            m.latency_samples.pop_front();
        }
    }

    /// 最近窗口（默认 10 分钟）内的调用率
    pub fn recent_api_call_rate(&self) -> RecentCallRate {
        self.recent_api_call_rate_at(Instant::now())
    }

    pub fn recent_api_call_rate_at(&self, now: Instant) -> RecentCallRate {
        let window = Duration::from_secs(self.config.recent_window_secs);
        let count = self
            .metrics
            .read()
            .call_times
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count();

        let window_minutes = self.config.recent_window_secs as f64 / 60.0;
        let calls_per_minute = if window_minutes > 0.0 {
            count as f64 / window_minutes
        } else {
            0.0
        };

        RecentCallRate {
            count,
            window_minutes,
            calls_per_minute,
        }
    }

    /// 生成报告
    pub fn generate_report(&self) -> PerformanceReport {
        self.generate_report_at(Instant::now())
    }

    pub fn generate_report_at(&self, now: Instant) -> PerformanceReport {
        let recent_api_calls = self.recent_api_call_rate_at(now);
        let m = self.metrics.read();

        let elapsed = now.saturating_duration_since(m.last_reset).as_secs_f64();
        let api_calls_per_minute = if elapsed > 0.0 {
            m.total_calls as f64 / elapsed * 60.0
        } else {
            0.0
        };
        let error_rate = if m.total_calls > 0 {
            m.error_count as f64 / m.total_calls as f64 * 100.0
        } else {
            0.0
        };

        PerformanceReport {
            summary: ReportSummary {
                total_api_calls: m.total_calls,
                api_calls_per_minute,
                estimated_daily_api_calls: (api_calls_per_minute * 60.0 * 24.0).round() as u64,
                average_latency_ms: m.average_latency(),
                min_latency_ms: m.latency_min,
                max_latency_ms: m.latency_max,
                total_bytes: m.total_bytes,
                total_data_transfer: format_bytes(m.total_bytes),
                error_rate,
                monitoring_duration: format_duration(elapsed),
            },
            details: ReportDetails {
                api_calls_by_type: m.calls_by_type.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                error_types: m.errors_by_type.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                recent_api_calls,
                recent_bytes: m.transfer_samples.iter().map(|(_, b)| *b).sum(),
                monitoring_since: m.last_reset_at,
            },
        }
    }

    /// 以 `Metric,Value` 两列 CSV 导出报告摘要
    pub fn export_csv(&self) -> String {
        let s = self.generate_report().summary;
        let optional_ms = |v: Option<f64>| v.map(|v| format!("{:.0}ms", v)).unwrap_or_default();

        let rows = [
            ("Total API Calls", s.total_api_calls.to_string()),
            ("API Calls Per Minute", format!("{:.2}", s.api_calls_per_minute)),
            ("Estimated Daily API Calls", s.estimated_daily_api_calls.to_string()),
            ("Average Latency", format!("{:.0}ms", s.average_latency_ms)),
            ("Min Latency", optional_ms(s.min_latency_ms)),
            ("Max Latency", optional_ms(s.max_latency_ms)),
            ("Total Data Transfer", s.total_data_transfer),
            ("Error Rate", format!("{:.2}%", s.error_rate)),
            ("Monitoring Duration", s.monitoring_duration),
        ];

        let mut csv = String::from("Metric,Value");
        for (metric, value) in rows {
            csv.push('\n');
            csv.push_str(metric);
            csv.push(',');
            csv.push_str(&value);
        }
        csv
    }

    /// 清空所有指标
    pub fn reset(&self) {
        *self.metrics.write() = Metrics::new(Instant::now());
        info!("📊 性能指标已重置");
    }

    /// 启动定期报告任务（重复调用无效果）
    ///
    /// 任务只持有弱引用，监控器被释放后自动结束。
    pub fn start_reporting(self: &Arc<Self>) {
        let mut reporter = self.reporter.lock();
        if reporter.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("性能报告任务已在运行");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("⚠️ 没有运行中的 tokio runtime，无法启动性能报告任务");
            return;
        };

        let monitor: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.report_interval_secs.max(1));

        *reporter = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 第一次 tick 立即返回，跳过
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.prune();
                monitor.log_report();
            }
        }));

        info!(
            "📊 性能报告任务已启动 (间隔: {}s)",
            self.config.report_interval_secs
        );
    }

    /// 停止定期报告任务
    pub fn stop_reporting(&self) {
        if let Some(handle) = self.reporter.lock().take() {
            handle.abort();
            info!("⏹️ 性能报告任务已停止");
        }
    }

    /// 以 JSON 格式把当前报告写入日志
    pub fn log_report(&self) {
        match serde_json::to_string_pretty(&self.generate_report()) {
            Ok(json) => info!("=== 性能监控报告 ===\n{}", json),
            Err(e) => warn!("性能报告序列化失败: {}", e),
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.reporter.get_mut().take() {
            handle.abort();
        }
    }
}

/// 字节数转为人类可读格式，例如 `1536` → `"1.5 KB"`
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

/// 秒数转为 `"1h 2m 3s"` / `"2m 3s"` / `"3s"`
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(500), "500 Bytes");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5 MB");

        assert_eq!(format_duration(42.9), "42s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3723.0), "1h 2m 3s");
    }

    #[test]
    fn test_track_api_call_counts_and_latency() {
        let monitor = PerformanceMonitor::default();
        let start = Instant::now();

        monitor.track_api_call_at(call_type::CHECKSUM, 100.0, 40, start);
        monitor.track_api_call_at(call_type::CHECKSUM, 300.0, 40, start);
        monitor.track_api_call_at(call_type::FULL_DATA, 200.0, 4000, start);

        let report = monitor.generate_report_at(start + Duration::from_secs(60));
        assert_eq!(report.summary.total_api_calls, 3);
        assert_eq!(report.summary.total_bytes, 4080);
        assert_eq!(report.summary.average_latency_ms, 200.0);
        assert_eq!(report.summary.min_latency_ms, Some(100.0));
        assert_eq!(report.summary.max_latency_ms, Some(300.0));
        assert_eq!(report.details.api_calls_by_type.get("checksum"), Some(&2));
        assert_eq!(report.details.api_calls_by_type.get("full_data"), Some(&1));
    }

    #[test]
    fn test_error_rate() {
        let monitor = PerformanceMonitor::default();
        assert_eq!(monitor.generate_report().summary.error_rate, 0.0);

        for _ in 0..4 {
            monitor.track_api_call(call_type::CHECKSUM, 10.0, 10);
        }
        monitor.track_error("transport", &"connection refused");

        let report = monitor.generate_report();
        assert_eq!(report.summary.error_rate, 25.0);
        assert_eq!(report.details.error_types.get("transport"), Some(&1));
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let monitor = PerformanceMonitor::default();
        let start = Instant::now();
        for i in 0..150 {
            monitor.track_api_call_at(call_type::CHECKSUM, i as f64, 1, start);
        }

        assert_eq!(monitor.metrics.read().latency_samples.len(), 100);
        // 平均值只基于最近 100 个样本（50..150）
        let report = monitor.generate_report_at(start);
        assert_eq!(report.summary.average_latency_ms, 99.5);
        // min/max 是全程值
        assert_eq!(report.summary.min_latency_ms, Some(0.0));
        assert_eq!(report.summary.total_api_calls, 150);
    }

    #[test]
    fn test_prune_drops_samples_older_than_retention() {
        let monitor = PerformanceMonitor::default();
        let start = Instant::now();

        monitor.track_api_call_at(call_type::CHECKSUM, 10.0, 100, start);
        let later = start + Duration::from_secs(3601);
        monitor.track_api_call_at(call_type::CHECKSUM, 10.0, 50, later);

        let report = monitor.generate_report_at(later);
        assert_eq!(report.summary.total_api_calls, 2);
        assert_eq!(report.summary.total_bytes, 150);
        assert_eq!(report.details.recent_bytes, 50);
        assert_eq!(monitor.metrics.read().call_times.len(), 1);
    }

    #[test]
    fn test_recent_api_call_rate() {
        let monitor = PerformanceMonitor::default();
        let start = Instant::now();

        monitor.track_api_call_at(call_type::CHECKSUM, 10.0, 1, start);
        for _ in 0..5 {
            monitor.track_api_call_at(
                call_type::CHECKSUM,
                10.0,
                1,
                start + Duration::from_secs(15 * 60),
            );
        }

        let rate = monitor.recent_api_call_rate_at(start + Duration::from_secs(16 * 60));
        assert_eq!(rate.count, 5);
        assert_eq!(rate.window_minutes, 10.0);
        assert_eq!(rate.calls_per_minute, 0.5);
    }

    #[test]
    fn test_export_csv_and_reset() {
        let monitor = PerformanceMonitor::default();
        monitor.track_api_call(call_type::FULL_DATA, 120.0, 2048);

        let csv = monitor.export_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Metric,Value");
        assert_eq!(lines[1], "Total API Calls,1");
        assert!(csv.contains("Total Data Transfer,2 KB"));
        assert_eq!(lines.len(), 10);

        monitor.reset();
        let report = monitor.generate_report();
        assert_eq!(report.summary.total_api_calls, 0);
        assert!(report.details.api_calls_by_type.is_empty());
        assert_eq!(report.summary.min_latency_ms, None);
    }

    #[tokio::test]
    async fn test_start_and_stop_reporting() {
        let monitor = Arc::new(PerformanceMonitor::default());
        monitor.start_reporting();
        monitor.start_reporting();
        assert!(monitor.reporter.lock().is_some());

        monitor.stop_reporting();
        assert!(monitor.reporter.lock().is_none());
    }

    #[test]
    fn test_start_reporting_outside_runtime_is_skipped() {
        let monitor = Arc::new(PerformanceMonitor::default());
        monitor.start_reporting();
        assert!(monitor.reporter.lock().is_none());
    }
}
