//! 有界重试
//!
//! with_retry 对「调用模型」与「执行未受审批限制的工具」两类步骤使用同一套逻辑：
//! 只有 retry_on 判定为瞬时的错误才会重试，最多 max_attempts 次；耗尽后原样返回最后一次错误。
//! 工具副作用的幂等性由工具自身负责，这里不做去重。

use std::future::Future;
use std::time::Duration;

use crate::config::RetrySection;

/// 被视为瞬时错误的文本特征（限流 / 超时 / 连接失败 / 网关 5xx）
const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection",
    "temporarily unavailable",
    "overloaded",
    "502",
    "503",
    "504",
];

/// 按错误文本判断是否为瞬时错误
pub fn looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// 重试预算：总尝试次数与指数退避参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }

    /// 不等待的策略（测试或本地调用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::new(max_attempts)
        }
    }

    /// 模型调用预算
    pub fn for_model(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.model_max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// 工具调用预算（通常更少）
    pub fn for_tools(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.tool_max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// 第 attempt 次失败后的等待时间：base * 2^(attempt-1)，不超过 max_delay
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// 执行 op，瞬时错误按策略重试
pub async fn with_retry<T, E, F, Fut, R>(policy: &RetryPolicy, retry_on: R, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retry_on(&e) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
