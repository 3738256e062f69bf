//! 재시작 정책 — 서브프로세스 슈퍼바이저의 결정 함수
//!
//! `<policy>[/<backoff>]` 형식이며 policy는 `always`, `on-success`,
//! `once` 중 하나입니다. 슈퍼바이저 루프는 스크립트가 종료될 때마다
//! [`RestartPolicy::next`]를 호출하고, true면 재시작합니다.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyKind {
    /// 중단될 때까지 항상 재시작
    Always,
    /// 직전 실행이 성공했을 때만 재시작
    OnSuccess,
    /// 첫 종료 후 한 번만 재시작
    Once,
}

/// 서브프로세스 재시작 정책
///
/// 백오프는 첫 재시작 전에는 생략되고 이후 재시작마다 적용됩니다.
/// [`RestartPolicy::stop`] 이후의 `next`는 항상 false입니다.
#[derive(Debug)]
pub struct RestartPolicy {
    raw: String,
    kind: PolicyKind,
    backoff: Option<Duration>,
    started: AtomicBool,
    remaining: AtomicU32,
    backoff_armed: AtomicBool,
}

impl RestartPolicy {
    /// 재시작 여부를 결정합니다. true를 반환하기 전에 백오프를 잡니다.
    ///
    /// `failed`는 직전 실행이 에러로 끝났는지 여부입니다.
    pub async fn next(&self, failed: bool) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        match self.kind {
            PolicyKind::Always => {
                self.wait().await;
                true
            }
            PolicyKind::OnSuccess => {
                if failed {
                    false
                } else {
                    self.wait().await;
                    true
                }
            }
            PolicyKind::Once => {
                if self
                    .remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok()
                {
                    self.wait().await;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// 이후의 모든 `next` 호출이 false를 반환하게 합니다.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    /// 첫 호출은 백오프를 생략하고, 이후 호출부터 잡니다.
    async fn wait(&self) {
        if let Some(backoff) = self.backoff {
            if self.backoff_armed.swap(true, Ordering::AcqRel) {
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (policy, backoff) = match s.split_once('/') {
            Some((p, b)) => {
                let d = humantime::parse_duration(b.trim()).map_err(|e| {
                    ConfigError::BadBackoff {
                        spec: s.to_owned(),
                        reason: e.to_string(),
                    }
                })?;
                (p, Some(d))
            }
            None => (s, None),
        };
        let kind = match policy.trim() {
            "always" => PolicyKind::Always,
            "on-success" => PolicyKind::OnSuccess,
            "once" => PolicyKind::Once,
            _ => return Err(ConfigError::BadPolicy(s.to_owned())),
        };
        Ok(Self {
            raw: s.to_owned(),
            kind,
            backoff,
            started: AtomicBool::new(true),
            remaining: AtomicU32::new(u32::from(kind == PolicyKind::Once)),
            backoff_armed: AtomicBool::new(false),
        })
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for RestartPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
