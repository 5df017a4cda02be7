/// Checksum 同步模块
///
/// 职责：
/// - 轻量 checksum 查询，只有 checksum 变化时才拉取全量数据
/// - 定时轮询与强制刷新
/// - 调用统计（缓存命中率、API 节省率）
/// - 按用户活跃度自适应调整轮询间隔

pub mod adaptive;
pub mod checksum_client;

pub use adaptive::{
    ActivityKind, ActivityState, AdaptivePoller, AdaptivePollingConfig, AdaptivePollingStats,
};
pub use checksum_client::{
    ChecksumState, ChecksumSyncClient, SyncClientStatus, SyncStats, UpdateResult,
};

/// 轮询状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingState {
    /// 已创建或已停止
    Idle,
    /// 定时器运行中
    Polling,
}
