//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs（vergen）

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = env!("VERGEN_BUILD_TIMESTAMP");

/// 用于日志与 User-Agent 的版本串，例如 `handlog-sdk/0.1.0`
pub fn user_agent() -> String {
    format!("handlog-sdk/{}", SDK_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_version() {
        let ua = user_agent();
        assert!(ua.starts_with("handlog-sdk/"));
        assert!(ua.ends_with(SDK_VERSION));
        assert!(!BUILD_TIME.is_empty());
    }
}
