//! 事件系统模块 - 同步客户端向下游（UI、分析器）广播的进程内事件
//!
//! 功能包括：
//! - 数据变更事件（dataChanged）
//! - checksum 检查事件（checksumChecked）
//! - 错误事件（error）
//! - 行缓存重建事件
//! - 自适应轮询的活跃度状态 / 轮询间隔变化
//! - 事件广播（broadcast channel）和回调订阅两种消费方式
//!
//! 回调按注册顺序同步执行；单个回调 panic 会被捕获并记录，不影响其它回调。

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::HandlogSDKError;
use crate::sync::ActivityState;

/// 通配事件类型，匹配所有事件
pub const ALL_EVENTS: &str = "*";

/// 同步事件
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// 服务端数据已变化，新数据已取回
    DataChanged {
        data: Value,
        checksum: String,
        /// 服务端给出的数据时间（原样透传）
        timestamp: Option<String>,
    },
    /// 完成一次 checksum 查询
    ChecksumChecked {
        checksum: String,
        response_time_ms: f64,
    },
    /// 请求失败（传输错误或响应解析错误）
    Error(HandlogSDKError),
    /// 行缓存已按新数据重建
    CacheRebuilt {
        cached: usize,
        dropped: usize,
        checksum: Option<String>,
    },
    /// 自适应轮询的活跃度状态切换
    ActivityStateChanged {
        old_state: ActivityState,
        new_state: ActivityState,
        old_interval_ms: u64,
        new_interval_ms: u64,
    },
    /// 自适应轮询的生效间隔变化
    PollIntervalChanged {
        interval_ms: u64,
        state: ActivityState,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::DataChanged { .. } => "data_changed",
            SyncEvent::ChecksumChecked { .. } => "checksum_checked",
            SyncEvent::Error(_) => "error",
            SyncEvent::CacheRebuilt { .. } => "cache_rebuilt",
            SyncEvent::ActivityStateChanged { .. } => "activity_state_changed",
            SyncEvent::PollIntervalChanged { .. } => "poll_interval_changed",
        }
    }

    /// 事件携带的 checksum（如果有）
    pub fn checksum(&self) -> Option<&str> {
        match self {
            SyncEvent::DataChanged { checksum, .. } => Some(checksum),
            SyncEvent::ChecksumChecked { checksum, .. } => Some(checksum),
            SyncEvent::CacheRebuilt { checksum, .. } => checksum.as_deref(),
            SyncEvent::Error(_)
            | SyncEvent::ActivityStateChanged { .. }
            | SyncEvent::PollIntervalChanged { .. } => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤器，None 表示全部
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        match &self.event_types {
            Some(types) => types.iter().any(|t| t == event.event_type()),
            None => true,
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct ListenerEntry {
    id: Uuid,
    event_type: String,
    listener: EventListener,
}

type ListenerTable = RwLock<Vec<ListenerEntry>>;

/// 回调订阅句柄
///
/// 丢弃句柄**不会**自动取消订阅；需要取消时调用 [`Subscription::unsubscribe`]。
#[derive(Clone)]
pub struct Subscription {
    id: Uuid,
    listeners: Weak<ListenerTable>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 取消订阅；返回是否确实移除了监听器
    pub fn unsubscribe(&self) -> bool {
        let Some(listeners) = self.listeners.upgrade() else {
            return false;
        };
        let mut listeners = listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != self.id);
        before != listeners.len()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 回调 panic 次数
    pub listener_panics: u64,
    /// 最后事件时间（UTC 毫秒）
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 回调监听器（按注册顺序）
    listeners: Arc<ListenerTable>,
    /// 事件统计
    stats: RwLock<EventStats>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(RwLock::new(Vec::new())),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(chrono::Utc::now().timestamp_millis());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的客户端），仅打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 先快照再调用，回调里可以安全地订阅/取消订阅
        let targets: Vec<EventListener> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.event_type == ALL_EVENTS || entry.event_type == event.event_type())
            .map(|entry| entry.listener.clone())
            .collect();

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Event listener error ({}): listener panicked", event.event_type());
                self.stats.write().listener_panics += 1;
            }
        }
    }

    /// 订阅广播通道
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`event_type` 为 [`ALL_EVENTS`] 时接收所有事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let count = {
            let mut listeners = self.listeners.write();
            listeners.push(ListenerEntry {
                id,
                event_type: event_type.to_string(),
                listener: Arc::new(listener),
            });
            listeners.len()
        };
        self.stats.write().listener_count = count;

        info!("Added listener for event type: {}", event_type);

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// 订阅所有事件
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.add_listener(ALL_EVENTS, listener)
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    /// 当前回调监听器数量
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// 获取事件统计
    pub fn get_stats(&self) -> EventStats {
        let mut stats = self.stats.read().clone();
        stats.listener_count = self.listener_count();
        stats
    }

    /// 获取活跃的广播订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(100)
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn checked(checksum: &str) -> SyncEvent {
        SyncEvent::ChecksumChecked {
            checksum: checksum.to_string(),
            response_time_ms: 12.0,
        }
    }

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);
        let mut receiver = manager.subscribe();

        manager.emit(checked("abc"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "checksum_checked");
        assert_eq!(received.checksum(), Some("abc"));

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("checksum_checked"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(100);
        let mut filtered =
            manager.subscribe_filtered(EventFilter::new().with_event_types(["data_changed"]));

        manager.emit(checked("abc"));
        manager.emit(SyncEvent::DataChanged {
            data: serde_json::json!({"rows": []}),
            checksum: "def".to_string(),
            timestamp: None,
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.event_type(), "data_changed");
        assert!(filtered.try_recv().is_err());
    }

    #[test]
    fn test_listeners_by_type_and_wildcard() {
        let manager = EventManager::new(100);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed.clone();
        manager.add_listener("error", move |_| {
            typed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let all_clone = all.clone();
        manager.on(move |_| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.emit(checked("a"));
        manager.emit(SyncEvent::Error(HandlogSDKError::Transport("down".to_string())));

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let manager = EventManager::new(100);
        let counter = Arc::new(AtomicUsize::new(0));

        manager.on(|_| panic!("listener failure"));
        let counter_clone = counter.clone();
        manager.on(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.emit(checked("a"));
        manager.emit(checked("b"));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get_stats().listener_panics, 2);
    }

    #[test]
    fn test_unsubscribe() {
        let manager = EventManager::new(100);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let subscription = manager.on(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.emit(checked("a"));
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        manager.emit(checked("b"));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = EventManager::new(100);
        let mut receiver1 = manager.subscribe();
        let mut receiver2 = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 2);

        manager.emit(checked("x"));

        assert_eq!(receiver1.recv().await.unwrap().event_type(), "checksum_checked");
        assert_eq!(receiver2.recv().await.unwrap().event_type(), "checksum_checked");
    }
}
