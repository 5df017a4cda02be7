//! 编译期生成 BUILD_TIMESTAMP 等元信息（供 version.rs 使用）

use vergen::EmitBuilder;

fn main() {
    // 失败时 vergen 会输出占位值，不阻断编译
    let _ = EmitBuilder::builder().build_timestamp().emit();
}
