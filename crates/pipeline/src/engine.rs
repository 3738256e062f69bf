//! 엔진 — 와처/디서플린/jail 배선과 생명주기
//!
//! 와처마다 디스패치 태스크 하나가 라인 채널을 소비하며 연결된
//! 디서플린을 순서대로 호출합니다. 판정이 나오면 jail 목록을
//! 포그라운드는 순서대로, 백그라운드는 독립 태스크로 실행합니다.
//!
//! 시작은 전부 아니면 전무입니다: 와처 하나라도 시작에 실패하면 이미
//! 시작한 와처를 닫고 드레인한 뒤 에러를 돌려줍니다. 종료는 등록의
//! 역순입니다 (stats 서버, 와처, 디서플린, jail).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use go2jail_core::allow::AllowList;
use go2jail_core::counters::{Counter, Counters};
use go2jail_core::types::{Line, Verdict};

use crate::config::Config;
use crate::discipline::Discipline;
use crate::error::PipelineError;
use crate::jail::echo::{EchoJail, EchoJailConfig};
use crate::jail::DynJail;
use crate::location::LocationLookup;
use crate::watch::{DynWatch, WatchMode};

/// 테스트 모드에서 jail을 대신하는 내장 echo jail의 id
const TEST_JAIL_ID: &str = "test";

/// 엔진 시작 옵션
#[derive(Debug, Default)]
pub struct EngineOptions {
    /// 지정되면 해당 디서플린만 테스트 모드로 돌립니다.
    /// jail은 내장 echo jail로 대체됩니다.
    pub test_discipline: Option<String>,
    /// stats HTTP 수신 주소 (예: `127.0.0.1:8080`)
    pub stats_listen: Option<String>,
}

#[derive(Clone)]
struct JailRef {
    id: String,
    background: bool,
    jail: Arc<dyn DynJail>,
}

type Callbacks = Vec<(Arc<dyn Discipline>, Vec<JailRef>)>;

/// 실행 중인 엔진 핸들
pub struct Engine {
    cancel: CancellationToken,
    tracker: TaskTracker,
    watches: Vec<Arc<dyn DynWatch>>,
    disciplines: Vec<Arc<dyn Discipline>>,
    jails: Vec<Arc<dyn DynJail>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("watches", &self.watches.len())
            .field("disciplines", &self.disciplines.len())
            .field("jails", &self.jails.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    /// 설정을 배선하고 엔진을 시작합니다.
    pub async fn start(config: Config, opts: EngineOptions) -> Result<Self, PipelineError> {
        let test_mode = opts.test_discipline.is_some();
        let mode = if test_mode {
            WatchMode::Test
        } else {
            WatchMode::Live
        };

        // 활성 디서플린 결정
        let active: Vec<&crate::config::DisciplineEntry> = match &opts.test_discipline {
            Some(id) => {
                let entry = config
                    .discipline(id)
                    .ok_or_else(|| PipelineError::Engine(format!("discipline not found: {id}")))?;
                vec![entry]
            }
            None => config.disciplines.iter().collect(),
        };

        // watch id -> 콜백 목록
        let test_jail: Arc<dyn DynJail> = Arc::new(EchoJail::new(EchoJailConfig {
            id: TEST_JAIL_ID.to_owned(),
            type_tag: "echo".to_owned(),
            background: false,
        }));
        let mut callbacks: HashMap<String, Callbacks> = HashMap::new();
        let mut close_jails: Vec<Arc<dyn DynJail>> = Vec::new();
        let mut seen_jail_ids = Vec::new();
        for entry in &active {
            let jails: Vec<JailRef> = if test_mode {
                vec![JailRef {
                    id: TEST_JAIL_ID.to_owned(),
                    background: false,
                    jail: Arc::clone(&test_jail),
                }]
            } else {
                let mut refs = Vec::new();
                for id in &entry.jails {
                    let jail = config.jail(id).ok_or_else(|| {
                        PipelineError::DanglingReference {
                            discipline: entry.id.clone(),
                            kind: "jail",
                            id: id.clone(),
                        }
                    })?;
                    refs.push(JailRef {
                        id: jail.id.clone(),
                        background: jail.background,
                        jail: Arc::clone(&jail.jail),
                    });
                }
                refs
            };
            for jail in &jails {
                if !seen_jail_ids.contains(&jail.id) {
                    seen_jail_ids.push(jail.id.clone());
                    close_jails.push(Arc::clone(&jail.jail));
                }
            }
            for watch_id in &entry.watches {
                callbacks
                    .entry(watch_id.clone())
                    .or_default()
                    .push((Arc::clone(&entry.discipline), jails.clone()));
            }
        }
        if callbacks.is_empty() {
            return Err(PipelineError::Engine("no watches configured".to_owned()));
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        // stats HTTP 서버
        if let Some(addr) = &opts.stats_listen {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                PipelineError::Engine(format!("http stats listen {addr}: {e}"))
            })?;
            tracing::info!(listen = %addr, "http stats started");
            tracker.spawn(serve_stats(listener, cancel.clone()));
        }

        let counters = Counters::global();
        let arrest_success = counters.register("engine", "total", "arrest_success");
        let arrest_fail = counters.register("engine", "total", "arrest_fail");

        // 와처 시작 (전부 아니면 전무). 설정 순서를 유지한다.
        let mut started: Vec<(Arc<dyn DynWatch>, mpsc::Receiver<Line>, Callbacks)> = Vec::new();
        for entry in &config.watches {
            let Some(cbs) = callbacks.remove(&entry.id) else {
                tracing::debug!(watch = %entry.id, "watch not referenced, skipped");
                continue;
            };
            match entry.watch.start(mode).await {
                Ok(rx) => started.push((Arc::clone(&entry.watch), rx, cbs)),
                Err(e) => {
                    tracing::error!(watch = %entry.id, error = %e, "watch start fail, rolling back");
                    for (watch, _, _) in &started {
                        watch.close().await;
                    }
                    cancel.cancel();
                    tracker.close();
                    tracker.wait().await;
                    return Err(e);
                }
            }
        }

        let allow = config.allows.clone();
        let locations: Arc<dyn LocationLookup> = Arc::clone(&config.locations) as Arc<dyn LocationLookup>;
        let mut watch_handles = Vec::new();
        for (watch, rx, cbs) in started {
            watch_handles.push(Arc::clone(&watch));
            let ctx = DispatchContext {
                allow: allow.clone(),
                locations: Arc::clone(&locations),
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                arrest_success: arrest_success.clone(),
                arrest_fail: arrest_fail.clone(),
            };
            tracker.spawn(dispatch(rx, cbs, ctx));
        }
        tracker.close();

        let disciplines = active
            .iter()
            .map(|d| Arc::clone(&d.discipline))
            .collect();
        tracing::info!(test = test_mode, "engine started");
        Ok(Self {
            cancel,
            tracker,
            watches: watch_handles,
            disciplines,
            jails: close_jails,
            stopped: AtomicBool::new(false),
        })
    }

    /// 종료를 시작합니다. 등록의 역순으로 자원을 정리합니다.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("engine stopping");
        // stats 서버와 디스패치 루프 먼저
        self.cancel.cancel();
        for watch in self.watches.iter().rev() {
            watch.close().await;
        }
        for discipline in self.disciplines.iter().rev() {
            discipline.close();
        }
        for jail in self.jails.iter().rev() {
            jail.close().await;
        }
    }

    /// 엔진이 시작한 모든 태스크가 끝날 때까지 기다립니다.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// `stop` 후 `wait`.
    pub async fn stop_and_wait(&self) {
        self.stop().await;
        self.wait().await;
        tracing::info!("engine stopped");
    }
}

struct DispatchContext {
    allow: AllowList,
    locations: Arc<dyn LocationLookup>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    arrest_success: Counter,
    arrest_fail: Counter,
}

/// 한 와처의 라인을 소비해 콜백을 순서대로 호출합니다.
async fn dispatch(mut rx: mpsc::Receiver<Line>, callbacks: Callbacks, ctx: DispatchContext) {
    loop {
        let line = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            line = rx.recv() => match line {
                None => break,
                Some(line) => line,
            },
        };
        for (discipline, jails) in &callbacks {
            let Some(mut verdict) = discipline.judge(&line, &ctx.allow) else {
                continue;
            };
            verdict.ip_location = ctx.locations.locate(&verdict.ip).await;
            for jail in jails {
                if jail.background {
                    let jail = jail.clone();
                    let verdict = verdict.clone();
                    let success = ctx.arrest_success.clone();
                    let fail = ctx.arrest_fail.clone();
                    ctx.tracker.spawn(async move {
                        arrest(&jail, &verdict, &success, &fail).await;
                    });
                } else {
                    arrest(jail, &verdict, &ctx.arrest_success, &ctx.arrest_fail).await;
                }
            }
        }
    }
}

async fn arrest(jail: &JailRef, verdict: &Verdict, success: &Counter, fail: &Counter) {
    tracing::debug!(jail = %jail.id, ip = %verdict.ip, "start arrest");
    match jail.jail.arrest(verdict).await {
        Ok(()) => {
            tracing::info!(jail = %jail.id, ip = %verdict.ip, "arrest success");
            success.incr();
        }
        Err(e) => {
            tracing::error!(jail = %jail.id, ip = %verdict.ip, error = %e, "arrest fail");
            fail.incr();
        }
    }
}

/// stats HTTP 서버: `GET /`만 카운터 JSON을 돌려주고 나머지는 404.
async fn serve_stats(listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_stats(stream));
                }
                Err(e) => {
                    tracing::error!(error = %e, "http stats accept fail");
                    break;
                }
            },
        }
    }
    tracing::debug!("http stats closed");
}

async fn handle_stats(mut stream: TcpStream) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                head.extend_from_slice(&chunk[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() > 8192 {
                    break;
                }
            }
        }
    }

    let request_line = String::from_utf8_lossy(&head);
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    let (status, content_type, body) = if method == "GET" && path == "/" {
        let body = serde_json::to_string(&Counters::global().snapshot())
            .unwrap_or_else(|_| "{}".to_owned());
        ("200 OK", "application/json", body)
    } else {
        ("404 Not Found", "text/plain", "404 page not found\n".to_owned())
    };
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
