use std::fmt;

/// SDK 统一错误类型
///
/// 所有变体只携带字符串/数值，因此可以 `Clone`：同一个错误既返回给调用方，
/// 也广播到 `error` 事件。
#[derive(Debug, Clone, PartialEq)]
pub enum HandlogSDKError {
    /// 网络层错误（连接失败、请求中断等）
    Transport(String),
    /// 非 2xx HTTP 状态码
    HttpStatus {
        status: u16,
        url: String,
    },
    /// 响应体不是合法 JSON / 结构不符
    JsonError(String),
    InvalidData(String),
    InvalidArgument(String),
    Config(String),
    Timeout(String),
    Other(String),
}

impl fmt::Display for HandlogSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlogSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            HandlogSDKError::HttpStatus { status, url } => {
                write!(f, "HTTP error! status: {} ({})", status, url)
            }
            HandlogSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            HandlogSDKError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            HandlogSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            HandlogSDKError::Config(e) => write!(f, "Config error: {}", e),
            HandlogSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            HandlogSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for HandlogSDKError {}

impl From<serde_json::Error> for HandlogSDKError {
    fn from(error: serde_json::Error) -> Self {
        HandlogSDKError::JsonError(error.to_string())
    }
}

impl From<reqwest::Error> for HandlogSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            HandlogSDKError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            HandlogSDKError::HttpStatus {
                status: status.as_u16(),
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if error.is_decode() {
            HandlogSDKError::JsonError(error.to_string())
        } else {
            HandlogSDKError::Transport(error.to_string())
        }
    }
}

impl HandlogSDKError {
    /// 错误类别名（用作性能监控里的错误类型 key）
    pub fn kind(&self) -> &'static str {
        match self {
            HandlogSDKError::Transport(_) => "transport",
            HandlogSDKError::HttpStatus { .. } => "http_status",
            HandlogSDKError::JsonError(_) => "parse",
            HandlogSDKError::InvalidData(_) => "invalid_data",
            HandlogSDKError::InvalidArgument(_) => "invalid_argument",
            HandlogSDKError::Config(_) => "config",
            HandlogSDKError::Timeout(_) => "timeout",
            HandlogSDKError::Other(_) => "other",
        }
    }

    /// 判断是否属于传输类错误（网络失败、HTTP 状态、超时、响应解析失败）
    ///
    /// 这些错误在同步层都不会自动重试，由调用方决定退避策略。
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            HandlogSDKError::Transport(_)
                | HandlogSDKError::HttpStatus { .. }
                | HandlogSDKError::Timeout(_)
                | HandlogSDKError::JsonError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HandlogSDKError>;
