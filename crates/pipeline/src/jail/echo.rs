//! echo / log jail — 관측용 싱크
//!
//! echo는 판정을 stdout에 출력하고, log는 info 로그를 남깁니다.
//! 둘 다 항상 성공합니다. 테스트 모드의 엔진은 디서플린의 jail을
//! 내장 echo jail 하나로 바꿉니다.

use serde::Deserialize;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::types::Verdict;

use super::{Jail, MaybeMailer};
use crate::error::PipelineError;

#[derive(Debug, Deserialize)]
pub struct EchoJailConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default)]
    pub background: bool,
}

/// stdout 싱크
pub struct EchoJail {
    id: String,
    success: Counter,
}

impl EchoJail {
    pub fn new(cfg: EchoJailConfig) -> Self {
        Self {
            success: Counters::global().register("jail", &cfg.id, "success"),
            id: cfg.id,
        }
    }
}

impl Jail for EchoJail {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arrest(&self, verdict: &Verdict) -> Result<(), PipelineError> {
        println!("{} {}", verdict.ip, verdict.line);
        self.success.incr();
        Ok(())
    }

    async fn close(&self) {}
}

impl MaybeMailer for EchoJail {}

/// 로그 싱크
pub struct LogJail {
    id: String,
    success: Counter,
}

impl LogJail {
    pub fn new(cfg: EchoJailConfig) -> Self {
        Self {
            success: Counters::global().register("jail", &cfg.id, "success"),
            id: cfg.id,
        }
    }
}

impl Jail for LogJail {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arrest(&self, verdict: &Verdict) -> Result<(), PipelineError> {
        tracing::info!(
            jail = %self.id,
            ip = %verdict.ip,
            groups = %verdict.extend,
            "arrest"
        );
        self.success.incr();
        Ok(())
    }

    async fn close(&self) {}
}

impl MaybeMailer for LogJail {}

#[cfg(test)]
mod tests {
    use super::*;
    use go2jail_core::types::Line;

    fn verdict() -> Verdict {
        let line = Line::new("w", "1.1.1.1 probe");
        Verdict::new(&line, "d", "1.1.1.1".parse().unwrap(), Default::default())
    }

    #[tokio::test]
    async fn echo_always_succeeds() {
        let jail = EchoJail::new(EchoJailConfig {
            id: "echo-t".to_owned(),
            type_tag: "echo".to_owned(),
            background: false,
        });
        jail.arrest(&verdict()).await.unwrap();
        jail.arrest(&verdict()).await.unwrap();
        assert_eq!(jail.success.value(), 2);
    }

    #[tokio::test]
    async fn log_always_succeeds() {
        let jail = LogJail::new(EchoJailConfig {
            id: "log-t".to_owned(),
            type_tag: "log".to_owned(),
            background: false,
        });
        jail.arrest(&verdict()).await.unwrap();
        assert_eq!(jail.success.value(), 1);
    }
}
