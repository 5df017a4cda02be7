//! 轮询示例
//!
//! 设置 `HANDLOG_ENDPOINT`（可选 `HANDLOG_CSV_URL`）时连接真实接口；
//! 否则使用内存中的模拟表格，每隔几秒追加一手牌。
//!
//! ```text
//! cargo run --example polling_demo
//! ```

use async_trait::async_trait;
use handlog_sdk::{HandlogConfig, HandlogSDK, Result, SheetTransport, SyncEvent};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// 模拟表格：`rows` 变化时 checksum 随之变化
struct SimulatedSheet {
    rows: Mutex<Vec<Vec<String>>>,
}

impl SimulatedSheet {
    fn new() -> Self {
        Self {
            rows: Mutex::new(vec![vec![
                String::new(),
                "#".to_string(),
                "Time".to_string(),
                String::new(),
                "Status".to_string(),
            ]]),
        }
    }

    fn append_hand(&self, hand: u64, time: &str) {
        self.rows.lock().push(vec![
            String::new(),
            hand.to_string(),
            time.to_string(),
            String::new(),
            "pending".to_string(),
        ]);
    }

    fn checksum(&self) -> String {
        format!("sim-{:04}", self.rows.lock().len())
    }
}

#[async_trait]
impl SheetTransport for SimulatedSheet {
    async fn get(&self, query: &[(&str, &str)]) -> Result<String> {
        let action = query.iter().find(|(k, _)| *k == "action").map(|(_, v)| *v);
        let known = query.iter().find(|(k, _)| *k == "checksum").map(|(_, v)| *v);
        let checksum = self.checksum();

        let body = match action {
            Some("getChecksum") => json!({ "checksum": checksum }),
            Some("getFullData") if known == Some(checksum.as_str()) => {
                json!({ "changed": false, "checksum": checksum })
            }
            Some("getFullData") => {
                let rows = self.rows.lock().clone();
                json!({
                    "changed": true,
                    "checksum": checksum,
                    "data": { "rows": rows },
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })
            }
            _ => json!({ "checksums": { "A1:E": checksum } }),
        };
        Ok(body.to_string())
    }

    async fn fetch_csv(&self) -> Result<String> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .map(|r| r.join(","))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Handlog SDK 轮询示例 ===\n");

    let endpoint = std::env::var("HANDLOG_ENDPOINT").ok();
    let mut builder = HandlogConfig::builder()
        .endpoint_url(
            endpoint
                .clone()
                .unwrap_or_else(|| "https://sheet.invalid/exec".to_string()),
        )
        .poll_interval(Duration::from_secs(2));
    if let Ok(csv_url) = std::env::var("HANDLOG_CSV_URL") {
        builder = builder.csv_url(csv_url);
    }
    let config = builder.build()?;

    let simulated = Arc::new(SimulatedSheet::new());
    let sdk = match endpoint {
        Some(_) => HandlogSDK::initialize(config).await?,
        None => {
            println!("📋 未设置 HANDLOG_ENDPOINT，使用模拟表格\n");
            HandlogSDK::with_transport(config, simulated.clone()).await?
        }
    };

    sdk.events().on(|event| match event {
        SyncEvent::DataChanged { checksum, timestamp, .. } => {
            println!("📢 数据变化: checksum={} timestamp={:?}", checksum, timestamp)
        }
        SyncEvent::CacheRebuilt { cached, dropped, .. } => {
            println!("🗂️ 缓存重建: {} 行, 丢弃 {} 行", cached, dropped)
        }
        SyncEvent::Error(e) => println!("❌ 同步错误: {}", e),
        SyncEvent::ActivityStateChanged { old_state, new_state, new_interval_ms, .. } => {
            println!("🎯 活跃度: {} → {} ({}ms)", old_state, new_state, new_interval_ms)
        }
        SyncEvent::ChecksumChecked { .. } | SyncEvent::PollIntervalChanged { .. } => {}
    });

    sdk.start();

    let now = chrono::Local::now();
    for (i, hand) in (138..142).enumerate() {
        let time = (now - chrono::Duration::minutes(4 * (4 - i as i64))).format("%H:%M");
        simulated.append_hand(hand, &time.to_string());
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    println!("\n📊 缓存统计: {:?}", sdk.cache_stats());
    let target = (now - chrono::Duration::minutes(5)).format("%H:%M").to_string();
    match sdk.find_closest_to(&target) {
        Some(row) => println!("🔍 {} 最近的一手: row {} hand {:?}", target, row.row_number, row.hand_number),
        None => println!("🔍 {} 附近没有记录", target),
    }
    println!("📈 同步统计: {}", serde_json::to_string_pretty(&sdk.sync_stats())?);

    sdk.shutdown();
    Ok(())
}
