//! 自适应轮询
//!
//! 在 [`ChecksumSyncClient`] 之上按用户活跃度切换轮询间隔：
//!
//! | 状态 | 默认间隔 | 说明 |
//! |------|----------|------|
//! | active | 3 秒 | 正在编辑或高频操作 |
//! | normal | 10 秒 | 一般活动 |
//! | idle | 30 秒 | 30 秒内无任何活动 |
//! | background | 60 秒 | 应用在后台（默认暂停轮询） |
//!
//! 活跃度由宿主上报的交互事件累积成分数，分数按每秒 5% 衰减。
//! 状态变化时按新间隔重新计时，并广播 `activity_state_changed` 与
//! `poll_interval_changed` 事件。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::checksum_client::{ChecksumSyncClient, DEFAULT_POLL_INTERVAL};
use crate::error::{HandlogSDKError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::lifecycle::LifecycleHook;

/// 活跃度分数上限
const MAX_ACTIVITY_SCORE: f64 = 100.0;
/// 分数每秒保留的比例
const ACTIVITY_DECAY_PER_SEC: f64 = 0.95;
/// 超过该分数即视为 active
const ACTIVE_SCORE_THRESHOLD: f64 = 50.0;
/// 一次编辑的分数
const EDITING_WEIGHT: f64 = 5.0;

/// 活跃度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    Normal,
    Idle,
    Background,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Active => "active",
            ActivityState::Normal => "normal",
            ActivityState::Idle => "idle",
            ActivityState::Background => "background",
        }
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 宿主上报的交互类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    PointerDown,
    KeyDown,
    Scroll,
    Click,
    PointerMove,
}

impl ActivityKind {
    fn weight(self) -> f64 {
        match self {
            ActivityKind::PointerDown => 2.0,
            ActivityKind::KeyDown => 3.0,
            ActivityKind::Scroll => 1.0,
            ActivityKind::Click => 2.0,
            ActivityKind::PointerMove => 0.1,
        }
    }
}

/// 自适应轮询配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptivePollingConfig {
    pub active_interval_ms: u64,
    pub normal_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub background_interval_ms: u64,
    /// 进入后台时暂停轮询；为 false 时按 background 间隔继续
    pub pause_in_background: bool,
    /// 最近一次编辑后保持 active 的时长（毫秒）
    pub editing_active_ms: u64,
    /// 无任何活动多久后进入 idle（毫秒）
    pub idle_after_ms: u64,
    /// 活跃度评估周期（毫秒）
    pub evaluate_interval_ms: u64,
}

impl Default for AdaptivePollingConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 3_000,
            normal_interval_ms: 10_000,
            idle_interval_ms: 30_000,
            background_interval_ms: 60_000,
            pause_in_background: true,
            editing_active_ms: 5_000,
            idle_after_ms: 30_000,
            evaluate_interval_ms: 1_000,
        }
    }
}

impl AdaptivePollingConfig {
    /// 某状态下的轮询间隔
    pub fn interval_for(&self, state: ActivityState) -> Duration {
        Duration::from_millis(match state {
            ActivityState::Active => self.active_interval_ms,
            ActivityState::Normal => self.normal_interval_ms,
            ActivityState::Idle => self.idle_interval_ms,
            ActivityState::Background => self.background_interval_ms,
        })
    }

    fn set_interval(&mut self, state: ActivityState, interval: Duration) {
        let ms = interval.as_millis() as u64;
        match state {
            ActivityState::Active => self.active_interval_ms = ms,
            ActivityState::Normal => self.normal_interval_ms = ms,
            ActivityState::Idle => self.idle_interval_ms = ms,
            ActivityState::Background => self.background_interval_ms = ms,
        }
    }

    /// 是否有某个状态的间隔为 0
    pub fn has_zero_interval(&self) -> bool {
        [
            self.active_interval_ms,
            self.normal_interval_ms,
            self.idle_interval_ms,
            self.background_interval_ms,
        ]
        .contains(&0)
    }
}

/// 活跃度追踪：分数随时间连续衰减
#[derive(Debug)]
struct ActivityTracker {
    score: f64,
    last_activity: Instant,
    last_editing: Option<Instant>,
    last_decay: Instant,
}

impl ActivityTracker {
    fn new(now: Instant) -> Self {
        Self {
            score: 0.0,
            last_activity: now,
            last_editing: None,
            last_decay: now,
        }
    }

    fn decay(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_decay).as_secs_f64();
        self.score *= ACTIVITY_DECAY_PER_SEC.powf(elapsed);
        self.last_decay = now;
    }

    fn record(&mut self, weight: f64, now: Instant) {
        self.decay(now);
        self.score = (self.score + weight).min(MAX_ACTIVITY_SCORE);
        self.last_activity = now;
    }

    fn record_editing(&mut self, now: Instant) {
        self.record(EDITING_WEIGHT, now);
        self.last_editing = Some(now);
    }

    /// 计算当前应处的前台状态（不会得出 background）
    fn evaluate(&mut self, now: Instant, config: &AdaptivePollingConfig) -> ActivityState {
        self.decay(now);

        let editing_recently = self.last_editing.is_some_and(|t| {
            now.saturating_duration_since(t) < Duration::from_millis(config.editing_active_ms)
        });
        if editing_recently || self.score > ACTIVE_SCORE_THRESHOLD {
            return ActivityState::Active;
        }

        if now.saturating_duration_since(self.last_activity)
            < Duration::from_millis(config.idle_after_ms)
        {
            ActivityState::Normal
        } else {
            ActivityState::Idle
        }
    }
}

/// 自适应轮询统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptivePollingStats {
    pub current_state: ActivityState,
    pub current_interval_ms: u64,
    /// 启动以来定时器触发的周期数
    pub total_polls: u64,
    pub state_changes: u64,
    /// 相对固定 10 秒轮询少发出的周期数
    pub saved_polls: u64,
    /// 节省比例（百分比）
    pub efficiency: f64,
    pub running_time_secs: u64,
    pub activity_score: f64,
}

struct AdaptiveInner {
    config: AdaptivePollingConfig,
    state: ActivityState,
    tracker: ActivityTracker,
    running: bool,
    state_changes: u64,
    started: Instant,
    polls_at_start: u64,
}

/// 自适应轮询管理器
pub struct AdaptivePoller {
    client: Arc<ChecksumSyncClient>,
    events: Arc<EventManager>,
    inner: Mutex<AdaptiveInner>,
    evaluator: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptivePoller {
    pub fn new(client: Arc<ChecksumSyncClient>, config: AdaptivePollingConfig) -> Self {
        let now = Instant::now();
        let events = client.events().clone();
        let polls_at_start = client.poll_count();

        info!("🎯 AdaptivePoller 初始化完成");
        Self {
            client,
            events,
            inner: Mutex::new(AdaptiveInner {
                config,
                state: ActivityState::Normal,
                tracker: ActivityTracker::new(now),
                running: false,
                state_changes: 0,
                started: now,
                polls_at_start,
            }),
            evaluator: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ActivityState {
        self.inner.lock().state
    }

    /// 当前状态对应的轮询间隔
    pub fn current_interval(&self) -> Duration {
        let inner = self.inner.lock();
        inner.config.interval_for(inner.state)
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// 按当前状态开始轮询，并启动活跃度评估任务
    pub fn start(self: &Arc<Self>) {
        let (state, interval, evaluate_every) = {
            let mut inner = self.inner.lock();
            if inner.running {
                warn!("⚠️ 自适应轮询已在运行");
                return;
            }
            inner.running = true;
            (
                inner.state,
                inner.config.interval_for(inner.state),
                Duration::from_millis(inner.config.evaluate_interval_ms.max(1)),
            )
        };

        self.apply_interval(state, interval);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("⚠️ 没有运行中的 tokio runtime，活跃度评估任务未启动");
            return;
        };
        let poller: Weak<Self> = Arc::downgrade(self);
        *self.evaluator.lock() = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(evaluate_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(poller) = poller.upgrade() else {
                    break;
                };
                poller.refresh_activity();
            }
        }));

        info!("🚀 自适应轮询启动: {} 模式, {}ms", state, interval.as_millis());
    }

    /// 停止轮询与评估任务
    pub fn stop(&self) {
        self.inner.lock().running = false;
        if let Some(handle) = self.evaluator.lock().take() {
            handle.abort();
        }
        self.client.stop_polling();
        info!("⏹️ 自适应轮询已停止");
    }

    pub fn record_activity(&self, kind: ActivityKind) {
        self.record_activity_at(kind, Instant::now());
    }

    pub fn record_activity_at(&self, kind: ActivityKind, now: Instant) {
        self.inner.lock().tracker.record(kind.weight(), now);
    }

    /// 记录一次编辑（权重高于普通交互，并在短时间内保持 active）
    pub fn record_editing(&self) {
        self.record_editing_at(Instant::now());
    }

    pub fn record_editing_at(&self, now: Instant) {
        self.inner.lock().tracker.record_editing(now);
        debug!("✏️ 编辑活动");
    }

    /// 重新评估活跃度；后台状态下保持不变
    pub fn refresh_activity(&self) -> ActivityState {
        self.refresh_activity_at(Instant::now())
    }

    pub fn refresh_activity_at(&self, now: Instant) -> ActivityState {
        let next = {
            let mut inner = self.inner.lock();
            if inner.state == ActivityState::Background {
                return ActivityState::Background;
            }
            let AdaptiveInner { tracker, config, .. } = &mut *inner;
            tracker.evaluate(now, config)
        };
        self.set_state(next);
        next
    }

    /// 切换状态；状态未变时返回 false
    ///
    /// 运行中会按新状态的间隔重新计时，然后广播状态与间隔变化事件。
    pub fn set_state(&self, new_state: ActivityState) -> bool {
        let (old_state, old_interval, new_interval, running) = {
            let mut inner = self.inner.lock();
            if inner.state == new_state {
                return false;
            }
            let old_state = inner.state;
            inner.state = new_state;
            inner.state_changes += 1;
            (
                old_state,
                inner.config.interval_for(old_state),
                inner.config.interval_for(new_state),
                inner.running,
            )
        };

        info!(
            "🔄 状态变更: {} → {} ({}ms → {}ms)",
            old_state,
            new_state,
            old_interval.as_millis(),
            new_interval.as_millis()
        );

        if running {
            self.apply_interval(new_state, new_interval);
        }

        self.events.emit(SyncEvent::ActivityStateChanged {
            old_state,
            new_state,
            old_interval_ms: old_interval.as_millis() as u64,
            new_interval_ms: new_interval.as_millis() as u64,
        });
        self.events.emit(SyncEvent::PollIntervalChanged {
            interval_ms: new_interval.as_millis() as u64,
            state: new_state,
        });
        true
    }

    /// 修改某状态的轮询间隔；正是当前状态且运行中时立即生效
    pub fn set_polling_interval(&self, state: ActivityState, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(HandlogSDKError::InvalidArgument(format!(
                "{} 模式的轮询间隔必须大于 0",
                state
            )));
        }

        let apply = {
            let mut inner = self.inner.lock();
            inner.config.set_interval(state, interval);
            inner.running && inner.state == state
        };
        if apply {
            self.apply_interval(state, interval);
        }

        info!("✅ {} 模式轮询间隔变更: {}ms", state, interval.as_millis());
        Ok(())
    }

    fn apply_interval(&self, state: ActivityState, interval: Duration) {
        let pause = state == ActivityState::Background && self.inner.lock().config.pause_in_background;
        if pause {
            if self.client.is_polling() {
                info!("⏸️ 后台模式，暂停轮询");
                self.client.stop_polling();
            }
            return;
        }

        if self.client.is_polling() {
            self.client.set_poll_interval(interval);
        } else {
            self.client.start_polling(Some(interval));
        }
    }

    pub fn get_stats(&self) -> AdaptivePollingStats {
        self.get_stats_at(Instant::now())
    }

    pub fn get_stats_at(&self, now: Instant) -> AdaptivePollingStats {
        let mut inner = self.inner.lock();
        inner.tracker.decay(now);

        let runtime = now.saturating_duration_since(inner.started);
        let total_polls = self.client.poll_count().saturating_sub(inner.polls_at_start);
        let baseline = runtime.as_secs() / DEFAULT_POLL_INTERVAL.as_secs();
        let saved_polls = baseline.saturating_sub(total_polls);

        AdaptivePollingStats {
            current_state: inner.state,
            current_interval_ms: inner.config.interval_for(inner.state).as_millis() as u64,
            total_polls,
            state_changes: inner.state_changes,
            saved_polls,
            efficiency: if baseline > 0 {
                saved_polls as f64 / baseline as f64 * 100.0
            } else {
                0.0
            },
            running_time_secs: runtime.as_secs(),
            activity_score: inner.tracker.score,
        }
    }
}

impl Drop for AdaptivePoller {
    fn drop(&mut self) {
        if let Some(handle) = self.evaluator.get_mut().take() {
            handle.abort();
        }
    }
}

/// 后台 → background 状态；回到前台时按当前活跃度恢复
#[async_trait]
impl LifecycleHook for AdaptivePoller {
    async fn on_background(&self) -> Result<()> {
        info!("[Adaptive Hook] App 切换到后台");
        self.set_state(ActivityState::Background);
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        let next = {
            let mut inner = self.inner.lock();
            let AdaptiveInner { tracker, config, .. } = &mut *inner;
            tracker.evaluate(Instant::now(), config)
        };
        info!("[Adaptive Hook] App 回到前台: {}", next);
        self.set_state(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::http_client::SheetTransport;

    struct StaticSheet;

    #[async_trait]
    impl SheetTransport for StaticSheet {
        async fn get(&self, _query: &[(&str, &str)]) -> Result<String> {
            Ok(r#"{"checksum": "c1", "changed": false}"#.to_string())
        }

        async fn fetch_csv(&self) -> Result<String> {
            Ok(String::new())
        }
    }

    fn poller() -> Arc<AdaptivePoller> {
        let client = Arc::new(ChecksumSyncClient::new(
            Arc::new(StaticSheet),
            Arc::new(EventManager::default()),
            DEFAULT_POLL_INTERVAL,
        ));
        Arc::new(AdaptivePoller::new(client, AdaptivePollingConfig::default()))
    }

    #[test]
    fn test_config_defaults_and_json() {
        let config = AdaptivePollingConfig::default();
        assert_eq!(config.interval_for(ActivityState::Active), Duration::from_secs(3));
        assert_eq!(config.interval_for(ActivityState::Normal), Duration::from_secs(10));
        assert_eq!(config.interval_for(ActivityState::Idle), Duration::from_secs(30));
        assert_eq!(config.interval_for(ActivityState::Background), Duration::from_secs(60));
        assert!(config.pause_in_background);
        assert!(!config.has_zero_interval());

        let config: AdaptivePollingConfig =
            serde_json::from_str(r#"{"idle_interval_ms": 0}"#).unwrap();
        assert_eq!(config.active_interval_ms, 3_000);
        assert!(config.has_zero_interval());
    }

    #[test]
    fn test_activity_tracker_transitions() {
        let config = AdaptivePollingConfig::default();
        let start = Instant::now();
        let mut tracker = ActivityTracker::new(start);

        assert_eq!(tracker.evaluate(start, &config), ActivityState::Normal);
        assert_eq!(
            tracker.evaluate(start + Duration::from_secs(31), &config),
            ActivityState::Idle
        );

        // 编辑后 5 秒内保持 active，之后回到 normal
        let edit = start + Duration::from_secs(40);
        tracker.record_editing(edit);
        assert_eq!(tracker.evaluate(edit + Duration::from_secs(1), &config), ActivityState::Active);
        assert_eq!(tracker.evaluate(edit + Duration::from_secs(6), &config), ActivityState::Normal);

        // 连续高频交互把分数推过阈值
        let burst = edit + Duration::from_secs(10);
        for _ in 0..40 {
            tracker.record(ActivityKind::KeyDown.weight(), burst);
        }
        assert_eq!(tracker.score, MAX_ACTIVITY_SCORE);
        assert_eq!(tracker.evaluate(burst, &config), ActivityState::Active);

        // 分数按秒衰减：100 * 0.95^20 ≈ 35.8
        let later = burst + Duration::from_secs(20);
        assert_eq!(tracker.evaluate(later, &config), ActivityState::Normal);
        assert!((tracker.score - 35.85).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_state_change_rearms_client_and_emits_events() {
        let poller = poller();
        let client = poller.client.clone();
        let mut events = poller.events.subscribe_filtered(
            EventFilter::new().with_event_types(["activity_state_changed", "poll_interval_changed"]),
        );

        poller.start();
        assert!(poller.is_running());
        assert!(client.is_polling());
        assert_eq!(client.poll_interval(), Duration::from_secs(10));

        assert!(poller.set_state(ActivityState::Active));
        assert!(client.is_polling());
        assert_eq!(client.poll_interval(), Duration::from_secs(3));

        match events.try_recv().unwrap() {
            SyncEvent::ActivityStateChanged {
                old_state,
                new_state,
                old_interval_ms,
                new_interval_ms,
            } => {
                assert_eq!((old_state, new_state), (ActivityState::Normal, ActivityState::Active));
                assert_eq!((old_interval_ms, new_interval_ms), (10_000, 3_000));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.try_recv().unwrap() {
            SyncEvent::PollIntervalChanged { interval_ms, state } => {
                assert_eq!(interval_ms, 3_000);
                assert_eq!(state, ActivityState::Active);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // 同一状态不重复触发
        assert!(!poller.set_state(ActivityState::Active));
        assert!(events.try_recv().is_err());

        poller.set_state(ActivityState::Background);
        assert!(!client.is_polling());

        poller.set_state(ActivityState::Idle);
        assert!(client.is_polling());
        assert_eq!(client.poll_interval(), Duration::from_secs(30));

        let stats = poller.get_stats();
        assert_eq!(stats.state_changes, 3);
        assert_eq!(stats.current_state, ActivityState::Idle);
        assert_eq!(stats.current_interval_ms, 30_000);

        poller.stop();
        assert!(!poller.is_running());
        assert!(!client.is_polling());
    }

    #[tokio::test]
    async fn test_background_without_pause_keeps_polling() {
        let client = Arc::new(ChecksumSyncClient::new(
            Arc::new(StaticSheet),
            Arc::new(EventManager::default()),
            DEFAULT_POLL_INTERVAL,
        ));
        let poller = Arc::new(AdaptivePoller::new(
            client.clone(),
            AdaptivePollingConfig {
                pause_in_background: false,
                ..AdaptivePollingConfig::default()
            },
        ));

        poller.start();
        poller.set_state(ActivityState::Background);
        assert!(client.is_polling());
        assert_eq!(client.poll_interval(), Duration::from_secs(60));
        poller.stop();
    }

    #[tokio::test]
    async fn test_set_polling_interval_applies_to_current_state() {
        let poller = poller();
        let client = poller.client.clone();
        poller.start();

        poller
            .set_polling_interval(ActivityState::Normal, Duration::from_secs(15))
            .unwrap();
        assert_eq!(client.poll_interval(), Duration::from_secs(15));
        assert_eq!(poller.current_interval(), Duration::from_secs(15));

        // 非当前状态只改配置
        poller
            .set_polling_interval(ActivityState::Idle, Duration::from_secs(45))
            .unwrap();
        assert_eq!(client.poll_interval(), Duration::from_secs(15));
        poller.set_state(ActivityState::Idle);
        assert_eq!(client.poll_interval(), Duration::from_secs(45));

        let err = poller
            .set_polling_interval(ActivityState::Active, Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        poller.stop();
    }

    #[tokio::test]
    async fn test_refresh_activity_follows_tracker() {
        let poller = poller();
        let client = poller.client.clone();
        poller.start();

        let now = Instant::now();
        poller.record_editing_at(now);
        assert_eq!(poller.refresh_activity_at(now), ActivityState::Active);
        assert_eq!(client.poll_interval(), Duration::from_secs(3));

        assert_eq!(
            poller.refresh_activity_at(now + Duration::from_secs(60)),
            ActivityState::Idle
        );
        assert_eq!(client.poll_interval(), Duration::from_secs(30));

        // 后台状态不被活跃度评估覆盖
        poller.set_state(ActivityState::Background);
        poller.record_editing_at(now + Duration::from_secs(61));
        assert_eq!(
            poller.refresh_activity_at(now + Duration::from_secs(61)),
            ActivityState::Background
        );
        poller.stop();
    }

    #[tokio::test]
    async fn test_lifecycle_hook_pauses_and_resumes() {
        let poller = poller();
        let client = poller.client.clone();
        poller.start();

        poller.on_background().await.unwrap();
        assert_eq!(poller.state(), ActivityState::Background);
        assert!(!client.is_polling());

        poller.on_foreground().await.unwrap();
        assert_eq!(poller.state(), ActivityState::Normal);
        assert!(client.is_polling());
        assert_eq!(client.poll_interval(), Duration::from_secs(10));
        poller.stop();
    }

    #[test]
    fn test_stats_saved_polls_against_fixed_baseline() {
        let poller = poller();
        let started = poller.inner.lock().started;

        let stats = poller.get_stats_at(started + Duration::from_secs(65));
        assert_eq!(stats.total_polls, 0);
        assert_eq!(stats.saved_polls, 6);
        assert_eq!(stats.efficiency, 100.0);
        assert_eq!(stats.running_time_secs, 65);

        let stats = poller.get_stats_at(started);
        assert_eq!(stats.saved_polls, 0);
        assert_eq!(stats.efficiency, 0.0);
    }
}
