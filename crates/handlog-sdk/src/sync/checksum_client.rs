//! Checksum 同步客户端
//!
//! 每个周期先查询 checksum；只有当 checksum 与上次已知值不同时才拉取全量数据。
//!
//! 周期之间默认不互斥：手动 `force_refresh` 和定时周期可能交错执行，
//! 最后写入 `ChecksumState` 的一方生效。需要严格顺序时用
//! [`ChecksumSyncClient::with_serialized_cycles`] 打开单周期互斥。

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::PollingState;
use crate::error::{HandlogSDKError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::http_client::{
    ChecksumResponse, FullDataResponse, MultiChecksumResponse, SheetTransport,
};
use crate::performance::{call_type, PerformanceMonitor};

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// 最后一次成功同步的状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChecksumState {
    pub last_checksum: Option<String>,
    pub last_data: Option<Value>,
    pub last_timestamp: Option<String>,
}

/// `check_for_updates` 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateResult {
    pub updated: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl UpdateResult {
    fn cached() -> Self {
        Self {
            updated: false,
            cached: true,
            data: None,
        }
    }

    fn updated(data: Value) -> Self {
        Self {
            updated: true,
            cached: false,
            data: Some(data),
        }
    }
}

/// 同步统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    pub total_calls: u64,
    pub checksum_calls: u64,
    pub data_calls: u64,
    pub cache_hits: u64,
    /// 缓存命中率（百分比）= 命中数 / checksum 调用数
    pub cache_hit_rate: f64,
    /// API 节省率（百分比）= 1 - 全量调用数 / checksum 调用数
    pub api_reduction: f64,
    pub running_time_secs: u64,
    pub calls_per_minute: f64,
}

/// 客户端状态视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncClientStatus {
    pub state: PollingState,
    pub is_polling: bool,
    pub poll_interval_ms: u64,
    pub has_data: bool,
    /// checksum 前 10 个字符 + `...`
    pub last_checksum: Option<String>,
    pub stats: SyncStats,
}

#[derive(Debug)]
struct Counters {
    checksum_calls: u64,
    data_calls: u64,
    cache_hits: u64,
    started: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            checksum_calls: 0,
            data_calls: 0,
            cache_hits: 0,
            started: Instant::now(),
        }
    }
}

struct PollState {
    is_polling: bool,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

/// Checksum 同步客户端
pub struct ChecksumSyncClient {
    transport: Arc<dyn SheetTransport>,
    events: Arc<EventManager>,
    monitor: Option<Arc<PerformanceMonitor>>,
    state: RwLock<ChecksumState>,
    counters: RwLock<Counters>,
    poll: Mutex<PollState>,
    /// 定时器触发的周期数（不含手动检查）
    poll_ticks: AtomicU64,
    cycle_guard: Option<tokio::sync::Mutex<()>>,
}

impl ChecksumSyncClient {
    pub fn new(
        transport: Arc<dyn SheetTransport>,
        events: Arc<EventManager>,
        poll_interval: Duration,
    ) -> Self {
        info!("🔧 ChecksumSyncClient 初始化完成");
        Self {
            transport,
            events,
            monitor: None,
            state: RwLock::new(ChecksumState::default()),
            counters: RwLock::new(Counters::new()),
            poll: Mutex::new(PollState {
                is_polling: false,
                interval: poll_interval,
                handle: None,
            }),
            poll_ticks: AtomicU64::new(0),
            cycle_guard: None,
        }
    }

    /// 附加性能监控器
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// 打开单周期互斥：重叠的 `check_for_updates` 调用排队执行
    pub fn with_serialized_cycles(mut self, enabled: bool) -> Self {
        self.cycle_guard = enabled.then(|| tokio::sync::Mutex::new(()));
        self
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    // ========== 请求 ==========

    async fn request<T: DeserializeOwned>(&self, query: &[(&str, &str)]) -> Result<(T, usize)> {
        let body = self.transport.get(query).await?;
        let parsed = serde_json::from_str(&body)?;
        Ok((parsed, body.len()))
    }

    fn track_call(&self, kind: &str, started: Instant, bytes: usize) -> f64 {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Some(monitor) = &self.monitor {
            monitor.track_api_call(kind, elapsed_ms, bytes as u64);
        }
        elapsed_ms
    }

    fn report_error(&self, operation: &str, error: &HandlogSDKError) {
        error!("❌ {} 失败: {}", operation, error);
        if let Some(monitor) = &self.monitor {
            monitor.track_error(error.kind(), error);
        }
        self.events.emit(SyncEvent::Error(error.clone()));
    }

    /// 查询当前 checksum（一次往返，不重试）
    pub async fn fetch_checksum(&self) -> Result<ChecksumResponse> {
        let started = Instant::now();

        match self
            .request::<ChecksumResponse>(&[("action", "getChecksum")])
            .await
        {
            Ok((response, bytes)) => {
                self.counters.write().checksum_calls += 1;
                let elapsed_ms = self.track_call(call_type::CHECKSUM, started, bytes);

                info!(
                    "✅ Checksum 查询: {}... ({:.0}ms)",
                    preview(&response.checksum),
                    elapsed_ms
                );

                self.events.emit(SyncEvent::ChecksumChecked {
                    checksum: response.checksum.clone(),
                    response_time_ms: elapsed_ms,
                });
                Ok(response)
            }
            Err(e) => {
                self.report_error("Checksum 查询", &e);
                Err(e)
            }
        }
    }

    /// 拉取全量数据，附带当前已知 checksum（未知时为空串）
    pub async fn fetch_full_data(&self) -> Result<FullDataResponse> {
        let started = Instant::now();
        let known = self.state.read().last_checksum.clone().unwrap_or_default();

        match self
            .request::<FullDataResponse>(&[
                ("action", "getFullData"),
                ("checksum", known.as_str()),
            ])
            .await
        {
            Ok((response, bytes)) => {
                self.counters.write().data_calls += 1;
                let elapsed_ms = self.track_call(call_type::FULL_DATA, started, bytes);

                info!(
                    "📦 数据加载: changed={}, size={}bytes ({:.0}ms)",
                    response.changed, bytes, elapsed_ms
                );
                Ok(response)
            }
            Err(e) => {
                self.report_error("数据加载", &e);
                Err(e)
            }
        }
    }

    /// 查询各范围的 checksum
    pub async fn fetch_multi_range_checksums(&self) -> Result<HashMap<String, String>> {
        let started = Instant::now();

        match self
            .request::<MultiChecksumResponse>(&[("action", "getMultiChecksum")])
            .await
        {
            Ok((response, bytes)) => {
                self.track_call(call_type::MULTI_CHECKSUM, started, bytes);
                debug!("📊 多范围 Checksum: {:?}", response.checksums);
                Ok(response.checksums)
            }
            Err(e) => {
                self.report_error("多范围 Checksum 查询", &e);
                Err(e)
            }
        }
    }

    /// 拉取 CSV 行数据原文
    pub async fn fetch_csv(&self) -> Result<String> {
        let started = Instant::now();

        match self.transport.fetch_csv().await {
            Ok(text) => {
                self.track_call(call_type::CSV, started, text.len());
                Ok(text)
            }
            Err(e) => {
                self.report_error("CSV 加载", &e);
                Err(e)
            }
        }
    }

    // ========== 同步周期 ==========

    /// 检查更新，必要时拉取全量数据
    pub async fn check_for_updates(&self) -> Result<UpdateResult> {
        self.run_guarded(false).await
    }

    /// 在周期互斥内执行一次检查；`force` 时先清空已知 checksum
    async fn run_guarded(&self, force: bool) -> Result<UpdateResult> {
        let _cycle = match &self.cycle_guard {
            Some(guard) => Some(guard.lock().await),
            None => None,
        };

        // 必须在拿到互斥之后清空，否则排在前面的周期会把旧 checksum 写回
        if force {
            self.state.write().last_checksum = None;
        }

        let result = self.run_cycle().await;
        if let Err(e) = &result {
            debug!("更新检查失败: {}", e);
        }
        result
    }

    async fn run_cycle(&self) -> Result<UpdateResult> {
        let server = self.fetch_checksum().await?;

        let unchanged =
            self.state.read().last_checksum.as_deref() == Some(server.checksum.as_str());
        if unchanged {
            self.counters.write().cache_hits += 1;
            debug!("✨ Checksum 一致 - 跳过");
            return Ok(UpdateResult::cached());
        }

        info!("🔄 检测到数据变化");
        let full = self.fetch_full_data().await?;

        match full.data {
            Some(data) if full.changed => {
                {
                    let mut state = self.state.write();
                    state.last_checksum = Some(full.checksum.clone());
                    state.last_data = Some(data.clone());
                    state.last_timestamp = full.timestamp.clone();
                }

                self.events.emit(SyncEvent::DataChanged {
                    data: data.clone(),
                    checksum: full.checksum,
                    timestamp: full.timestamp,
                });
                Ok(UpdateResult::updated(data))
            }
            _ => {
                // checksum 粒度比数据粗：服务端确认没有变化，只同步 checksum
                self.state.write().last_checksum = Some(full.checksum);
                self.counters.write().cache_hits += 1;
                debug!("✨ 缓存命中 - 数据未变化");
                Ok(UpdateResult::cached())
            }
        }
    }

    /// 清空已知 checksum 后立即检查，保证至少一次全量拉取
    pub async fn force_refresh(&self) -> Result<UpdateResult> {
        info!("🔄 强制刷新");
        self.run_guarded(true).await
    }

    // ========== 轮询 ==========

    /// 开始轮询；已在轮询时只打印警告
    ///
    /// 立即执行一次检查，之后按间隔重复。每个周期在独立任务中运行，
    /// 因此慢周期不会推迟下一次定时触发。没有 tokio runtime 时不启动。
    pub fn start_polling(self: &Arc<Self>, interval: Option<Duration>) {
        let mut poll = self.poll.lock();
        if poll.is_polling {
            warn!("⚠️ 已经在轮询中");
            return;
        }

        if let Some(interval) = interval {
            poll.interval = interval;
        }
        self.arm_timer(&mut poll, true);
    }

    /// 修改轮询间隔
    ///
    /// 正在轮询时按新间隔重新计时，下一次检查在一个新间隔之后；未轮询时只记录间隔。
    pub fn set_poll_interval(self: &Arc<Self>, interval: Duration) {
        let mut poll = self.poll.lock();
        poll.interval = interval;
        if !poll.is_polling {
            return;
        }

        if let Some(handle) = poll.handle.take() {
            handle.abort();
        }
        poll.is_polling = false;
        self.arm_timer(&mut poll, false);
    }

    fn arm_timer(self: &Arc<Self>, poll: &mut PollState, immediate: bool) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("⚠️ 没有运行中的 tokio runtime，无法启动轮询");
            return;
        };

        let period = poll.interval.max(Duration::from_millis(1));
        let client: Weak<Self> = Arc::downgrade(self);

        poll.handle = Some(runtime.spawn(async move {
            let first = if immediate {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + period
            };
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.poll_ticks.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    // 错误已经通过 error 事件广播
                    let _ = client.check_for_updates().await;
                });
            }
        }));
        poll.is_polling = true;

        info!("🔄 开始轮询 (间隔: {}ms)", period.as_millis());
    }

    /// 停止轮询；已发出的请求仍会完成并更新状态
    pub fn stop_polling(&self) {
        let mut poll = self.poll.lock();
        if !poll.is_polling {
            return;
        }

        if let Some(handle) = poll.handle.take() {
            handle.abort();
        }
        poll.is_polling = false;
        info!("⏹️ 轮询已停止");
    }

    pub fn is_polling(&self) -> bool {
        self.poll.lock().is_polling
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll.lock().interval
    }

    /// 定时器累计触发的周期数
    pub fn poll_count(&self) -> u64 {
        self.poll_ticks.load(Ordering::Relaxed)
    }

    // ========== 查询 ==========

    pub fn get_stats(&self) -> SyncStats {
        let c = self.counters.read();
        let elapsed = c.started.elapsed().as_secs_f64();
        let total_calls = c.checksum_calls + c.data_calls;

        let (cache_hit_rate, api_reduction) = if c.checksum_calls > 0 {
            let checksum_calls = c.checksum_calls as f64;
            (
                c.cache_hits as f64 / checksum_calls * 100.0,
                (1.0 - c.data_calls as f64 / checksum_calls) * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        SyncStats {
            total_calls,
            checksum_calls: c.checksum_calls,
            data_calls: c.data_calls,
            cache_hits: c.cache_hits,
            cache_hit_rate,
            api_reduction,
            running_time_secs: elapsed as u64,
            calls_per_minute: if elapsed > 0.0 {
                total_calls as f64 / elapsed * 60.0
            } else {
                0.0
            },
        }
    }

    pub fn get_status(&self) -> SyncClientStatus {
        let (is_polling, interval) = {
            let poll = self.poll.lock();
            (poll.is_polling, poll.interval)
        };
        let (has_data, last_checksum) = {
            let state = self.state.read();
            (
                state.last_data.is_some(),
                state.last_checksum.as_deref().map(|c| format!("{}...", preview(c))),
            )
        };

        SyncClientStatus {
            state: if is_polling {
                PollingState::Polling
            } else {
                PollingState::Idle
            },
            is_polling,
            poll_interval_ms: interval.as_millis() as u64,
            has_data,
            last_checksum,
            stats: self.get_stats(),
        }
    }

    /// 重置调用统计并重新计时
    pub fn reset_stats(&self) {
        *self.counters.write() = Counters::new();
        info!("📊 统计已重置");
    }

    /// 最后一次同步得到的数据
    pub fn get_data(&self) -> Option<Value> {
        self.state.read().last_data.clone()
    }

    /// 当前已知 checksum
    pub fn get_checksum(&self) -> Option<String> {
        self.state.read().last_checksum.clone()
    }

    pub fn state(&self) -> ChecksumState {
        self.state.read().clone()
    }
}

impl Drop for ChecksumSyncClient {
    fn drop(&mut self) {
        if let Some(handle) = self.poll.get_mut().handle.take() {
            handle.abort();
        }
    }
}

fn preview(checksum: &str) -> String {
    checksum.chars().take(10).collect()
}
