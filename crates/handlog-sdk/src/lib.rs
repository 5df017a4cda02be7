//! Handlog SDK - 扑克牌局日志表格的本地镜像
//!
//! 本 SDK 把远端表格（每行一手牌）镜像到内存中，并尽量少地访问远端：
//! - 🔍 轻量 checksum 轮询：只有 checksum 变化时才拉取全量数据
//! - 🎯 自适应轮询：按用户活跃度在 3s / 10s / 30s 间切换，后台暂停
//! - 📄 保守的 CSV 解析，行号与表格物理行一一对应
//! - 🕐 时刻字符串规范化（`HH:MM[:SS]` / epoch 秒）
//! - 🗂️ 行缓存：按行号、分钟、牌局编号查找，支持容差内最近时间匹配
//! - ⚙️ 事件系统：数据变化 / checksum 检查 / 错误
//! - 📊 性能监控：调用量、延迟、流量、错误率
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use handlog_sdk::{HandlogConfig, HandlogSDK, SyncEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HandlogConfig::builder()
//!         .endpoint_url("https://script.example.com/macros/s/xxx/exec")
//!         .csv_url("https://docs.example.com/sheet.csv")
//!         .build()?;
//!
//!     let sdk = HandlogSDK::initialize(config).await?;
//!
//!     sdk.events().on(|event| {
//!         if let SyncEvent::DataChanged { checksum, .. } = event {
//!             println!("数据已更新: {}", checksum);
//!         }
//!     });
//!
//!     sdk.force_refresh().await?;
//!     if let Some(row) = sdk.find_closest_to("10:17") {
//!         println!("最近的一手: row {} hand {:?}", row.row_number, row.hand_number);
//!     }
//!
//!     sdk.shutdown();
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod utils;
pub mod sheet;
pub mod events;
pub mod http_client;
pub mod performance;
pub mod sync;
pub mod lifecycle;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{HandlogSDKError, Result};
pub use events::{EventFilter, EventManager, EventStats, Subscription, SyncEvent};
pub use http_client::{
    ChecksumResponse, FullDataResponse, HttpSheetTransport, MultiChecksumResponse, SheetTransport,
};
pub use lifecycle::{LifecycleHook, LifecycleManager, PollingLifecycleHook};
pub use performance::{MonitorConfig, PerformanceMonitor, PerformanceReport};
pub use sdk::{
    CacheConfig, ConfigBuildError, HandlogConfig, HandlogConfigBuilder, HandlogSDK,
    HttpClientConfig,
};
pub use sheet::{
    parse_rows, CacheAnalysis, CacheStats, ColumnLayout, MatchStrategy, ParsedRow, RawRow,
    RebuildSummary, RowCache, RowCacheConfig, RowRecord,
};
pub use sync::{
    ActivityKind, ActivityState, AdaptivePoller, AdaptivePollingConfig, AdaptivePollingStats,
    ChecksumState, ChecksumSyncClient, PollingState, SyncClientStatus, SyncStats, UpdateResult,
};
pub use utils::{normalize_time, TimeNormalizer, TimezoneConfig};
pub use version::SDK_VERSION;
