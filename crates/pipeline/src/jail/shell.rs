//! shell jail — 판정마다 스크립트를 실행합니다.
//!
//! 스크립트는 위치 인자 `[addr, line]`과 판정의 환경 변수
//! (`GO2JAIL_<group>`, `GO2JAIL_IP_LOCATION`)를 받습니다.

use serde::Deserialize;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::types::Verdict;

use super::{Jail, MaybeMailer};
use crate::error::PipelineError;
use crate::script::{self, ScriptConfig, ScriptTimeout};

/// shell jail 설정
#[derive(Debug, Deserialize)]
pub struct ShellJailConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default)]
    pub background: bool,
    /// 실행할 스크립트 본문
    pub run: String,
    #[serde(default)]
    pub timeout: ScriptTimeout,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub shell_options: Option<Vec<String>>,
    #[serde(default)]
    pub shell_output: Option<String>,
    #[serde(default)]
    pub run_user: Option<String>,
    #[serde(default)]
    pub run_group: Option<String>,
}

/// 스크립트 실행 jail
pub struct ShellJail {
    id: String,
    run: String,
    script: ScriptConfig,
    success: Counter,
    fail: Counter,
}

impl ShellJail {
    /// 설정으로 jail을 만듭니다. 셸 해석 실패는 설정 에러입니다.
    pub fn new(cfg: ShellJailConfig) -> Result<Self, PipelineError> {
        let script = ScriptConfig {
            timeout: cfg.timeout,
            shell: cfg.shell,
            shell_options: cfg.shell_options,
            shell_output: cfg.shell_output,
            run_user: cfg.run_user,
            run_group: cfg.run_group,
        };
        script::resolve_shell(&script).map_err(|e| PipelineError::Descriptor {
            kind: "jail",
            id: cfg.id.clone(),
            reason: format!("setup shell fail: {e}"),
        })?;
        let counters = Counters::global();
        Ok(Self {
            success: counters.register("jail", &cfg.id, "success"),
            fail: counters.register("jail", &cfg.id, "fail"),
            id: cfg.id,
            run: cfg.run,
            script,
        })
    }
}

impl Jail for ShellJail {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arrest(&self, verdict: &Verdict) -> Result<(), PipelineError> {
        let args = vec![verdict.ip.to_string(), verdict.line.clone()];
        match script::run_script(&self.run, &self.script, &verdict.as_env(), &args).await {
            Ok(_) => {
                self.success.incr();
                Ok(())
            }
            Err(e) => {
                self.fail.incr();
                Err(PipelineError::Jail {
                    id: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn close(&self) {}
}

impl MaybeMailer for ShellJail {}
