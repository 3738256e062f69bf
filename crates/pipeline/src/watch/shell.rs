//! shell 와처 — 감독되는 장기 실행 스크립트
//!
//! 스크립트의 stdout+stderr가 라인 채널을 거쳐 [`Line`]이 됩니다.
//! 슈퍼바이저 태스크가 종료마다 재시작 정책을 묻고, 라인 펌프
//! 태스크가 내부 채널을 외부 채널로 옮깁니다. 테스트 모드는 첫 실행
//! 후 정책을 멈추고 10초 상한과 `GO2JAIL_TEST=true`를 적용합니다.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::restart::RestartPolicy;
use go2jail_core::types::{Line, ENV_TEST};

use super::{Watch, WatchMode, LINE_CHANNEL_CAPACITY};
use crate::error::PipelineError;
use crate::script::{self, ScriptConfig, ScriptTimeout, TEST_TIMEOUT};

/// shell 와처 설정
#[derive(Debug, Deserialize)]
pub struct ShellWatchConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    /// 실행할 스크립트 본문
    pub run: String,
    #[serde(default)]
    pub timeout: ScriptTimeout,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub shell_options: Option<Vec<String>>,
    #[serde(default)]
    pub run_user: Option<String>,
    #[serde(default)]
    pub run_group: Option<String>,
    pub restart_policy: RestartPolicy,
}

impl ShellWatchConfig {
    fn script_config(&self) -> ScriptConfig {
        ScriptConfig {
            timeout: self.timeout,
            shell: self.shell.clone(),
            shell_options: self.shell_options.clone(),
            // 출력은 항상 라인 채널로 간다
            shell_output: None,
            run_user: self.run_user.clone(),
            run_group: self.run_group.clone(),
        }
    }
}

/// 재시작 정책으로 감독되는 스크립트 와처
pub struct ShellWatch {
    id: String,
    run: String,
    script: ScriptConfig,
    policy: Arc<RestartPolicy>,
    lines_counter: Counter,
    restart_counter: Counter,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ShellWatch {
    /// 설정으로 와처를 만듭니다. 셸 해석 실패는 설정 에러입니다.
    pub fn new(cfg: ShellWatchConfig) -> Result<Self, PipelineError> {
        let script = cfg.script_config();
        script::resolve_shell(&script).map_err(|e| PipelineError::Watch {
            id: cfg.id.clone(),
            reason: format!("setup shell fail: {e}"),
        })?;
        let counters = Counters::global();
        Ok(Self {
            lines_counter: counters.register("watch", &cfg.id, "lines"),
            restart_counter: counters.register("watch", &cfg.id, "restart"),
            id: cfg.id,
            run: cfg.run,
            script,
            policy: Arc::new(cfg.restart_policy),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }
}

impl Watch for ShellWatch {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, mode: WatchMode) -> Result<mpsc::Receiver<Line>, PipelineError> {
        tracing::info!(watch = %self.id, "watch starting");

        let (raw_tx, mut raw_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        let (line_tx, line_rx) = mpsc::channel::<Line>(LINE_CHANNEL_CAPACITY);

        let mut env = Vec::new();
        let timeout = if mode.is_test() {
            env.push((ENV_TEST.to_owned(), "true".to_owned()));
            Some(TEST_TIMEOUT)
        } else {
            // 라이브 와처는 명시된 한도만 따른다 (기본 무제한)
            self.script.timeout.resolve(None)
        };

        let first = script::spawn_lines(
            &self.run,
            &self.script,
            &env,
            std::slice::from_ref(&self.id),
            raw_tx.clone(),
        )
        .map_err(|e| PipelineError::Watch {
            id: self.id.clone(),
            reason: format!("start script fail: {e}"),
        })?;

        if mode.is_test() {
            self.policy.stop();
        }

        // 슈퍼바이저: 종료마다 정책을 묻고 재시작한다
        {
            let id = self.id.clone();
            let run = self.run.clone();
            let script_cfg = self.script.clone();
            let env = env.clone();
            let policy = Arc::clone(&self.policy);
            let restart_counter = self.restart_counter.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                let mut running = first;
                loop {
                    let failed = match running.wait(timeout, Some(&cancel)).await {
                        Ok(_) => false,
                        Err(e) => {
                            tracing::debug!(watch = %id, error = %e, "exec exit with error");
                            true
                        }
                    };
                    if cancel.is_cancelled() {
                        tracing::info!(watch = %id, "exec exit by cancellation");
                        break;
                    }
                    if !policy.next(failed).await {
                        tracing::info!(watch = %id, failed, "exec exit by restart_policy");
                        break;
                    }
                    restart_counter.incr();
                    tracing::debug!(watch = %id, "exec restart");
                    match script::spawn_lines(
                        &run,
                        &script_cfg,
                        &env,
                        std::slice::from_ref(&id),
                        raw_tx.clone(),
                    ) {
                        Ok(r) => running = r,
                        Err(e) => {
                            tracing::error!(watch = %id, error = %e, "restart script fail");
                            break;
                        }
                    }
                }
                // raw_tx가 여기서 떨어지면서 펌프가 자연 종료된다
            });
        }

        // 펌프: 내부 라인 채널 -> Line 채널
        {
            let id = self.id.clone();
            let lines_counter = self.lines_counter.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        text = raw_rx.recv() => match text {
                            None => break,
                            Some(text) => {
                                if text.is_empty() {
                                    continue;
                                }
                                tracing::debug!(watch = %id, line = %text, "get line");
                                if line_tx.send(Line::new(id.clone(), text)).await.is_err() {
                                    break;
                                }
                                lines_counter.incr();
                            }
                        }
                    }
                }
                tracing::info!(watch = %id, "watch channel closed");
            });
        }

        self.tracker.close();
        tracing::info!(watch = %self.id, "watch started");
        Ok(line_rx)
    }

    async fn close(&self) {
        self.policy.stop();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
