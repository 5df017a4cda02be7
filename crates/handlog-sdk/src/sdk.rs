//! 统一 SDK 接口 - HandlogSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! HandlogSDK (门面)
//!   ├── ChecksumSyncClient (checksum 轮询 / 全量拉取)
//!   ├── AdaptivePoller (可选，按活跃度调整轮询间隔)
//!   ├── RowCache (行缓存 + 时间索引 + 牌局编号索引)
//!   ├── EventManager (事件系统)
//!   ├── PerformanceMonitor (调用统计)
//!   └── LifecycleManager (前后台切换)
//! ```
//!
//! 每次 `data_changed` 事件都会整体重建行缓存：负载里带行数据时直接使用，
//! 否则从 CSV 接口重新拉取。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{HandlogSDKError, Result};
use crate::events::{EventManager, Subscription, SyncEvent};
use crate::http_client::{HttpSheetTransport, SheetTransport};
use crate::lifecycle::{LifecycleManager, PollingLifecycleHook};
use crate::performance::{MonitorConfig, PerformanceMonitor, PerformanceReport};
use crate::sheet::{
    parse_rows, rows_from_json, CacheAnalysis, CacheStats, ColumnLayout, MatchStrategy,
    ParsedRow, RebuildSummary, RowCache, RowCacheConfig, RowRecord,
};
use crate::sync::{
    ActivityKind, AdaptivePoller, AdaptivePollingConfig, ChecksumSyncClient, SyncClientStatus,
    SyncStats, UpdateResult,
};
use crate::utils::TimezoneConfig;
use crate::version;

/// HTTP 客户端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 行缓存配置
pub type CacheConfig = RowCacheConfig;

/// 配置构建错误
#[derive(Debug, Error)]
pub enum ConfigBuildError {
    #[error("endpoint_url 不能为空")]
    MissingEndpoint,
    #[error("不支持的 URL: {0}（需要 http:// 或 https://）")]
    InvalidUrl(String),
    #[error("轮询间隔必须大于 0")]
    ZeroPollInterval,
    #[error("事件通道容量必须大于 0")]
    ZeroEventCapacity,
    #[error("时区偏移无效: {0} 秒")]
    InvalidTimezone(i32),
    #[error("配置解析失败: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigBuildError> for HandlogSDKError {
    fn from(error: ConfigBuildError) -> Self {
        HandlogSDKError::Config(error.to_string())
    }
}

/// Handlog SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlogConfig {
    /// checksum / 全量数据 JSON 接口
    pub endpoint_url: String,
    /// CSV 行数据接口
    pub csv_url: Option<String>,
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    pub http: HttpClientConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    /// 事件广播通道容量
    pub event_capacity: usize,
    /// 是否串行化同步周期（重叠的检查排队执行）
    pub serialize_cycles: bool,
    /// 自适应轮询；None 时按 `poll_interval_ms` 固定间隔轮询
    pub adaptive_polling: Option<AdaptivePollingConfig>,
}

impl Default for HandlogConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            csv_url: None,
            poll_interval_ms: 10_000,
            http: HttpClientConfig::default(),
            cache: CacheConfig::default(),
            monitor: MonitorConfig::default(),
            event_capacity: 100,
            serialize_cycles: false,
            adaptive_polling: None,
        }
    }
}

impl HandlogConfig {
    pub fn builder() -> HandlogConfigBuilder {
        HandlogConfigBuilder::new()
    }

    /// 从 JSON 文本加载并校验
    pub fn from_json_str(json: &str) -> std::result::Result<Self, ConfigBuildError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigBuildError> {
        if self.endpoint_url.trim().is_empty() {
            return Err(ConfigBuildError::MissingEndpoint);
        }
        check_url(&self.endpoint_url)?;
        if let Some(csv_url) = &self.csv_url {
            check_url(csv_url)?;
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigBuildError::ZeroPollInterval);
        }
        if self
            .adaptive_polling
            .as_ref()
            .is_some_and(AdaptivePollingConfig::has_zero_interval)
        {
            return Err(ConfigBuildError::ZeroPollInterval);
        }
        if self.event_capacity == 0 {
            return Err(ConfigBuildError::ZeroEventCapacity);
        }
        if let Some(tz) = self.cache.timezone {
            if tz.to_fixed_offset().is_none() {
                return Err(ConfigBuildError::InvalidTimezone(tz.offset_seconds));
            }
        }
        Ok(())
    }
}

fn check_url(url: &str) -> std::result::Result<(), ConfigBuildError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigBuildError::InvalidUrl(url.to_string()))
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct HandlogConfigBuilder {
    config: HandlogConfig,
}

impl HandlogConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.endpoint_url = url.into();
        self
    }

    pub fn csv_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.csv_url = Some(url.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http.connect_timeout_secs = Some(secs);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http.request_timeout_secs = Some(secs);
        self
    }

    pub fn columns(mut self, columns: ColumnLayout) -> Self {
        self.config.cache.columns = columns;
        self
    }

    pub fn match_tolerance_minutes(mut self, minutes: u32) -> Self {
        self.config.cache.match_tolerance_minutes = minutes;
        self
    }

    pub fn match_strategy(mut self, strategy: MatchStrategy) -> Self {
        self.config.cache.match_strategy = strategy;
        self
    }

    /// 设置时刻字符串所在时区（默认系统本地时区）
    pub fn timezone(mut self, timezone: TimezoneConfig) -> Self {
        self.config.cache.timezone = Some(timezone);
        self
    }

    pub fn epoch_threshold(mut self, threshold: i64) -> Self {
        self.config.cache.epoch_threshold = threshold;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    pub fn disable_monitor(mut self) -> Self {
        self.config.monitor.enabled = false;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn serialize_cycles(mut self, enabled: bool) -> Self {
        self.config.serialize_cycles = enabled;
        self
    }

    /// 启用自适应轮询
    pub fn adaptive_polling(mut self, adaptive: AdaptivePollingConfig) -> Self {
        self.config.adaptive_polling = Some(adaptive);
        self
    }

    pub fn build(self) -> std::result::Result<HandlogConfig, ConfigBuildError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Handlog SDK 主入口
pub struct HandlogSDK {
    config: HandlogConfig,
    client: Arc<ChecksumSyncClient>,
    adaptive: Option<Arc<AdaptivePoller>>,
    cache: Arc<RwLock<RowCache>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    event_manager: Arc<EventManager>,
    lifecycle_manager: tokio::sync::RwLock<LifecycleManager>,
    data_subscription: Subscription,
}

impl HandlogSDK {
    /// 使用 HTTP 传输初始化
    pub async fn initialize(config: HandlogConfig) -> Result<Arc<Self>> {
        let transport = HttpSheetTransport::new(
            &config.http,
            config.endpoint_url.clone(),
            config.csv_url.clone(),
        )?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// 使用自定义传输初始化
    pub async fn with_transport(
        config: HandlogConfig,
        transport: Arc<dyn SheetTransport>,
    ) -> Result<Arc<Self>> {
        info!(
            "正在初始化 HandlogSDK {} (build {})...",
            version::SDK_VERSION,
            version::BUILD_TIME
        );
        config.validate()?;

        // === 第1层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_capacity));

        // === 第2层：性能监控 ===
        let monitor = config
            .monitor
            .enabled
            .then(|| Arc::new(PerformanceMonitor::new(config.monitor.clone())));

        // === 第3层：同步客户端 ===
        let mut client =
            ChecksumSyncClient::new(transport, event_manager.clone(), config.poll_interval())
                .with_serialized_cycles(config.serialize_cycles);
        if let Some(monitor) = &monitor {
            client = client.with_monitor(monitor.clone());
        }
        let client = Arc::new(client);

        // === 第4层：行缓存 ===
        let cache = Arc::new(RwLock::new(RowCache::new(config.cache.clone())?));
        info!("行缓存初始化完成");

        // === 第5层：数据变化 → 重建缓存 ===
        let data_subscription = event_manager.add_listener(
            "data_changed",
            cache_rebuild_listener(&cache, &event_manager, &client),
        );

        // === 第6层：自适应轮询 ===
        let adaptive = config
            .adaptive_polling
            .clone()
            .map(|adaptive| Arc::new(AdaptivePoller::new(client.clone(), adaptive)));

        // === 第7层：生命周期管理器 ===
        let mut lifecycle = LifecycleManager::new();
        match &adaptive {
            Some(adaptive) => lifecycle.register_hook(adaptive.clone()),
            None => lifecycle.register_hook(Arc::new(PollingLifecycleHook::new(client.clone()))),
        }

        info!("✅ HandlogSDK 初始化完成 (endpoint: {})", config.endpoint_url);

        Ok(Arc::new(Self {
            config,
            client,
            adaptive,
            cache,
            monitor,
            event_manager,
            lifecycle_manager: tokio::sync::RwLock::new(lifecycle),
            data_subscription,
        }))
    }

    pub fn config(&self) -> &HandlogConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<ChecksumSyncClient> {
        &self.client
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    pub fn monitor(&self) -> Option<&Arc<PerformanceMonitor>> {
        self.monitor.as_ref()
    }

    pub fn adaptive(&self) -> Option<&Arc<AdaptivePoller>> {
        self.adaptive.as_ref()
    }

    // ========== 同步 ==========

    /// 开始轮询并启动性能报告；配置了自适应轮询时由 [`AdaptivePoller`] 决定间隔
    pub fn start(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.start_reporting();
        }
        match &self.adaptive {
            Some(adaptive) => adaptive.start(),
            None => self.client.start_polling(None),
        }
    }

    /// 以固定间隔开始轮询
    pub fn start_polling(&self, interval: Option<Duration>) {
        self.client.start_polling(interval);
    }

    pub fn stop_polling(&self) {
        match &self.adaptive {
            Some(adaptive) => adaptive.stop(),
            None => self.client.stop_polling(),
        }
    }

    /// 上报一次用户交互（仅自适应轮询时生效）
    pub fn record_activity(&self, kind: ActivityKind) {
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_activity(kind);
        }
    }

    /// 上报一次编辑（仅自适应轮询时生效）
    pub fn record_editing(&self) {
        if let Some(adaptive) = &self.adaptive {
            adaptive.record_editing();
        }
    }

    pub async fn check_for_updates(&self) -> Result<UpdateResult> {
        self.client.check_for_updates().await
    }

    pub async fn force_refresh(&self) -> Result<UpdateResult> {
        self.client.force_refresh().await
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.client.get_stats()
    }

    pub fn sync_status(&self) -> SyncClientStatus {
        self.client.get_status()
    }

    pub fn performance_report(&self) -> Option<PerformanceReport> {
        self.monitor.as_ref().map(|m| m.generate_report())
    }

    // ========== 行缓存 ==========

    /// 从 CSV 接口拉取并重建行缓存
    pub async fn refresh_cache(&self) -> Result<RebuildSummary> {
        let text = self.client.fetch_csv().await?;
        let checksum = self.client.get_checksum();
        Ok(apply_rows(&self.cache, &self.event_manager, parse_rows(&text), checksum))
    }

    /// 用 CSV 文本重建行缓存
    pub fn rebuild_from_text(&self, text: &str) -> RebuildSummary {
        apply_rows(&self.cache, &self.event_manager, parse_rows(text), None)
    }

    pub fn get_row(&self, row_number: usize) -> Option<RowRecord> {
        self.cache.read().get_row(row_number).cloned()
    }

    pub fn find_exact(&self, time: &str) -> Option<RowRecord> {
        self.cache.read().find_exact(time).cloned()
    }

    pub fn find_closest(&self, target_timestamp: i64) -> Option<RowRecord> {
        self.cache.read().find_closest(target_timestamp).cloned()
    }

    pub fn find_closest_with(
        &self,
        target_timestamp: i64,
        strategy: MatchStrategy,
    ) -> Option<RowRecord> {
        self.cache
            .read()
            .find_closest_with(target_timestamp, strategy)
            .cloned()
    }

    /// 先把时间 token 规范化，再做最近时间查找
    pub fn find_closest_to(&self, time: &str) -> Option<RowRecord> {
        let cache = self.cache.read();
        let target = cache.normalizer().normalize(time)?;
        cache.find_closest(target).cloned()
    }

    pub fn lookup_hand(&self, hand_number: u64) -> Option<RowRecord> {
        self.cache.read().lookup_hand(hand_number).cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.read().stats()
    }

    pub fn analyze_cache(&self) -> CacheAnalysis {
        self.cache.read().analyze()
    }

    // ========== 生命周期 ==========

    pub async fn enter_background(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_background().await
    }

    pub async fn enter_foreground(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_foreground().await
    }

    /// 停止轮询和性能报告，解除缓存重建订阅
    pub fn shutdown(&self) {
        info!("正在关闭 HandlogSDK...");
        self.stop_polling();
        if let Some(monitor) = &self.monitor {
            monitor.stop_reporting();
        }
        self.data_subscription.unsubscribe();
        info!("✅ HandlogSDK 已关闭");
    }
}

fn apply_rows<I>(
    cache: &RwLock<RowCache>,
    events: &EventManager,
    rows: I,
    checksum: Option<String>,
) -> RebuildSummary
where
    I: IntoIterator<Item = ParsedRow>,
{
    let summary = cache.write().rebuild(rows);
    events.emit(SyncEvent::CacheRebuilt {
        cached: summary.cached,
        dropped: summary.dropped,
        checksum,
    });
    summary
}

/// `data_changed` 监听器：负载里有行数据就直接重建，否则后台拉取 CSV
///
/// 监听器只持有事件管理器和客户端的弱引用，避免引用环。
fn cache_rebuild_listener(
    cache: &Arc<RwLock<RowCache>>,
    events: &Arc<EventManager>,
    client: &Arc<ChecksumSyncClient>,
) -> impl Fn(&SyncEvent) + Send + Sync + 'static {
    let cache = cache.clone();
    let events: Weak<EventManager> = Arc::downgrade(events);
    let client: Weak<ChecksumSyncClient> = Arc::downgrade(client);

    move |event| {
        let SyncEvent::DataChanged { data, checksum, .. } = event else {
            return;
        };
        let Some(events) = events.upgrade() else {
            return;
        };

        if let Some(rows) = rows_from_json(data) {
            debug!("使用 data_changed 负载中的 {} 行重建缓存", rows.len());
            apply_rows(&cache, &events, rows, Some(checksum.clone()));
            return;
        }

        let Some(client) = client.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("⚠️ 没有运行中的 tokio runtime，跳过 CSV 重建");
            return;
        };

        let cache = cache.clone();
        let checksum = checksum.clone();
        runtime.spawn(async move {
            match client.fetch_csv().await {
                Ok(text) => {
                    apply_rows(&cache, &events, parse_rows(&text), Some(checksum));
                }
                Err(e) => error!("❌ CSV 重建失败: {}", e),
            }
        });
    }
}
