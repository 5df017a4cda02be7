//! SDK 生命周期管理
//!
//! 管理 App 前后台切换等一级生命周期事件，统一触发各模块的状态切换。

use crate::error::Result;
use crate::sync::ChecksumSyncClient;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// 获取已注册的 Hook 数量
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败时记录错误并继续执行其他 Hook，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到后台");

        let mut first_error = None;
        let mut failed = 0;

        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            warn!("⚠️ {} 个模块后台切换失败，但所有模块都已尝试执行", failed);
            return Err(e);
        }

        info!("✅ 所有模块后台切换完成");
        Ok(())
    }

    /// 通知所有 Hook：App 切换到前台
    ///
    /// 按注册顺序执行，某个 Hook 失败时记录错误并继续执行其他 Hook，最后返回第一个错误
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到前台");

        let mut first_error = None;
        let mut failed = 0;

        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            warn!("⚠️ {} 个模块前台切换失败，但所有模块都已尝试执行", failed);
            return Err(e);
        }

        info!("✅ 所有模块前台切换完成");
        Ok(())
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 轮询生命周期 Hook
///
/// 切到后台时停止轮询；回到前台时，如果之前在轮询则恢复（恢复时立即检查一次）。
pub struct PollingLifecycleHook {
    client: Arc<ChecksumSyncClient>,
    resume_on_foreground: AtomicBool,
}

impl PollingLifecycleHook {
    pub fn new(client: Arc<ChecksumSyncClient>) -> Self {
        Self {
            client,
            resume_on_foreground: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LifecycleHook for PollingLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        let was_polling = self.client.is_polling();
        self.resume_on_foreground.store(was_polling, Ordering::SeqCst);

        if was_polling {
            info!("[Polling Hook] App 切换到后台，暂停轮询");
            self.client.stop_polling();
        }
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        if self.resume_on_foreground.swap(false, Ordering::SeqCst) {
            info!("[Polling Hook] App 回到前台，恢复轮询");
            self.client.start_polling(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlogSDKError;
    use crate::events::EventManager;
    use crate::http_client::SheetTransport;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHook {
        background: AtomicUsize,
        foreground: AtomicUsize,
        fail: bool,
    }

    impl CountingHook {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                background: AtomicUsize::new(0),
                foreground: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.background.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HandlogSDKError::Other("background failed".to_string()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

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

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let failing = CountingHook::new(true);
        let healthy = CountingHook::new(false);

        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());
        assert_eq!(manager.hook_count(), 2);

        let err = manager.notify_background().await.unwrap_err();
        assert_eq!(err.kind(), "other");
        assert_eq!(healthy.background.load(Ordering::SeqCst), 1);

        manager.notify_foreground().await.unwrap();
        assert_eq!(failing.foreground.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_polling_hook_pauses_and_resumes() {
        let client = Arc::new(ChecksumSyncClient::new(
            Arc::new(StaticSheet),
            Arc::new(EventManager::default()),
            Duration::from_secs(60),
        ));
        let hook = PollingLifecycleHook::new(client.clone());

        client.start_polling(None);
        hook.on_background().await.unwrap();
        assert!(!client.is_polling());

        hook.on_foreground().await.unwrap();
        assert!(client.is_polling());
        client.stop_polling();

        // 后台前未轮询则前台不自动开启
        hook.on_background().await.unwrap();
        hook.on_foreground().await.unwrap();
        assert!(!client.is_polling());
    }
}
