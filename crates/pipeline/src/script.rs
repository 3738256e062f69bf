//! 스크립트 실행 — shell 와처와 shell jail이 공유하는 서브프로세스 머신
//!
//! 스크립트 본문은 최초 사용 시 SHA-1 키의 임시 파일로 저장되고, 셸
//! (`bash` 우선, `sh` 폴백) 아래에서 실행됩니다. 출력 정책은
//! `/dev/null`, 파일 append, 링 버퍼 캡처, 라인 채널 중 하나입니다.
//!
//! 부모 환경은 차단되며 [`INHERIT_ENV`] 목록의 변수만 명시적으로
//! 덮어쓰지 않는 한 통과합니다.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use go2jail_core::linechan::LineWriter;
use go2jail_core::ringbuf::RingBuffer;

use crate::error::PipelineError;

/// 명시적으로 덮어쓰지 않는 한 부모에서 상속되는 환경 변수
pub const INHERIT_ENV: [&str; 11] = [
    "TZ",
    "PATH",
    "HOME",
    "LANG",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_MONETARY",
    "LC_MESSAGES",
    "LC_NUMERIC",
    "LC_TIME",
    "LC_ALL",
];

/// 단발 스크립트의 기본 타임아웃
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// 테스트 모드 타임아웃 상한
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 스크립트 타임아웃 설정 값
///
/// YAML에서 humantime 문자열(`"90s"`), 초 단위 정수, 또는 음수
/// (무제한)를 받습니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScriptTimeout {
    /// 미지정. 호출 측이 기본값을 정합니다.
    #[default]
    Unset,
    /// 무제한
    Unlimited,
    /// 지정된 시간
    After(Duration),
}

impl ScriptTimeout {
    /// 미지정일 때 `default`를 적용해 실제 한도를 계산합니다.
    pub fn resolve(&self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Unset => default,
            Self::Unlimited => None,
            Self::After(d) => Some(*d),
        }
    }
}

impl<'de> Deserialize<'de> for ScriptTimeout {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = ScriptTimeout;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a duration string, seconds, or a negative number for unlimited")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    Ok(ScriptTimeout::Unlimited)
                } else {
                    Ok(ScriptTimeout::After(Duration::from_secs(v as u64)))
                }
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ScriptTimeout::After(Duration::from_secs(v)))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                humantime::parse_duration(v)
                    .map(ScriptTimeout::After)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// 스크립트 실행 옵션
///
/// shell 와처와 shell jail 설정의 공통 부분입니다.
#[derive(Debug, Clone, Default)]
pub struct ScriptConfig {
    pub timeout: ScriptTimeout,
    pub shell: Option<String>,
    pub shell_options: Option<Vec<String>>,
    pub shell_output: Option<String>,
    pub run_user: Option<String>,
    pub run_group: Option<String>,
}

/// PATH 조회가 끝난 셸
#[derive(Debug, Clone)]
pub struct ResolvedShell {
    pub program: PathBuf,
    pub options: Vec<String>,
}

/// 설정의 셸을 실행 파일 경로로 해석합니다.
///
/// 셸이 비어 있으면 `bash`를 찾고 없으면 `sh`로 폴백하며, 이때 옵션은
/// `-e`입니다. `bash`/`sh`를 지정하고 옵션을 생략해도 `-e`가 붙습니다.
pub fn resolve_shell(cfg: &ScriptConfig) -> Result<ResolvedShell, PipelineError> {
    let default_options = || vec!["-e".to_owned()];
    match cfg.shell.as_deref() {
        None | Some("") => {
            let program = lookup_path("bash")
                .or_else(|| lookup_path("sh"))
                .ok_or_else(|| {
                    PipelineError::Script {
                        reason: "can not find shell: bash or sh".to_owned(),
                        output: String::new(),
                    }
                })?;
            Ok(ResolvedShell {
                program,
                options: default_options(),
            })
        }
        Some(name) => {
            let program = lookup_path(name).ok_or_else(|| PipelineError::Script {
                reason: format!("can not find shell: {name}"),
                output: String::new(),
            })?;
            let options = match &cfg.shell_options {
                Some(opts) => opts.clone(),
                None if matches!(name, "bash" | "sh") => default_options(),
                None => Vec::new(),
            };
            Ok(ResolvedShell { program, options })
        }
    }
}

/// PATH에서 실행 파일을 찾습니다. 경로 구분자가 있으면 직접 검사합니다.
pub fn lookup_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// 스크립트 임시 디렉토리 `<tmpdir>/<uid>(<user>)`
///
/// 프로세스당 한 번 계산됩니다. 경로가 `-`로 시작하면 거부합니다.
fn script_temp_dir() -> Result<&'static Path, PipelineError> {
    static DIR: OnceLock<Result<PathBuf, String>> = OnceLock::new();
    let result = DIR.get_or_init(|| {
        let (uid, user) = current_user();
        let dir = std::env::temp_dir().join(format!("{uid}({user})"));
        if dir.to_string_lossy().starts_with('-') {
            return Err(format!("invalid script temp directory: {}", dir.display()));
        }
        std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755));
        }
        Ok(dir)
    });
    match result {
        Ok(dir) => Ok(dir),
        Err(e) => Err(PipelineError::Script {
            reason: e.clone(),
            output: String::new(),
        }),
    }
}

#[cfg(unix)]
fn current_user() -> (u32, String) {
    let uid = nix::unistd::geteuid();
    let name = nix::unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());
    (uid.as_raw(), name)
}

#[cfg(not(unix))]
fn current_user() -> (u32, String) {
    (0, "unknown".to_owned())
}

/// 스크립트 본문을 SHA-1 키의 임시 파일로 저장하고 경로를 돌려줍니다.
///
/// 같은 본문은 같은 파일을 재사용합니다. 파일 모드는 0750입니다.
fn script_file(script: &str) -> Result<PathBuf, PipelineError> {
    use sha1::{Digest, Sha1};

    let dir = script_temp_dir()?;
    let digest = Sha1::digest(script.as_bytes());
    let path = dir.join(hex::encode(digest));
    if !path.is_file() {
        std::fs::write(&path, script).map_err(|e| PipelineError::Script {
            reason: format!("write tmp script file {}: {e}", path.display()),
            output: String::new(),
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o750));
        }
    }
    Ok(path)
}

/// 스폰 시점에 정해지는 출력 목적지
enum ScriptOutput {
    /// 링 버퍼 캡처 (진단용, 마지막 4KiB)
    Capture(Arc<RingBuffer>),
    /// 버림
    Null,
    /// 파일에 append
    Append(PathBuf),
    /// 라인 채널로 스트리밍
    Lines(mpsc::Sender<String>),
}

/// 실행 중인 스크립트 핸들
pub struct RunningScript {
    child: Child,
    io_tasks: Vec<tokio::task::JoinHandle<()>>,
    capture: Option<Arc<RingBuffer>>,
}

impl RunningScript {
    /// 종료를 기다립니다. 타임아웃이나 취소 시 프로세스를 죽이고
    /// 캡처된 출력을 에러에 실어 보냅니다.
    pub async fn wait(
        mut self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, PipelineError> {
        let status = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = sleep_opt(timeout) => None,
            _ = cancelled_opt(cancel) => None,
        };

        let status = match status {
            Some(status) => status,
            None => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                let output = self.drain_output().await;
                let cancelled = cancel.is_some_and(|c| c.is_cancelled());
                return Err(PipelineError::Script {
                    reason: if cancelled {
                        "cancelled".to_owned()
                    } else {
                        "timed out".to_owned()
                    },
                    output,
                });
            }
        };

        let output = self.drain_output().await;
        match status {
            Ok(st) if st.success() => Ok(output),
            Ok(st) => Err(PipelineError::Script {
                reason: st.to_string(),
                output,
            }),
            Err(e) => Err(PipelineError::Script {
                reason: e.to_string(),
                output,
            }),
        }
    }

    async fn drain_output(&mut self) -> String {
        for task in self.io_tasks.drain(..) {
            let _ = task.await;
        }
        self.capture
            .as_ref()
            .map(|b| b.to_string_lossy())
            .unwrap_or_default()
    }
}

async fn sleep_opt(d: Option<Duration>) {
    match d {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn cancelled_opt(c: Option<&CancellationToken>) {
    match c {
        Some(c) => c.cancelled().await,
        None => std::future::pending().await,
    }
}

/// 스크립트를 스폰합니다.
fn spawn(
    script: &str,
    cfg: &ScriptConfig,
    env: &[(String, String)],
    args: &[String],
    output: ScriptOutput,
) -> Result<RunningScript, PipelineError> {
    let shell = resolve_shell(cfg)?;
    let file = script_file(script)?;

    let mut cmd = Command::new(&shell.program);
    cmd.args(&shell.options)
        .arg(&file)
        .args(args)
        .current_dir(std::env::temp_dir())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    cmd.env_clear();
    for (k, v) in env {
        cmd.env(k, v);
    }
    for name in INHERIT_ENV {
        if env.iter().any(|(k, _)| k == name) {
            continue;
        }
        if let Ok(v) = std::env::var(name) {
            cmd.env(name, v);
        }
    }

    if let Some(user) = cfg.run_user.as_deref() {
        apply_credentials(&mut cmd, user, cfg.run_group.as_deref())?;
    }

    let mut capture = None;
    match &output {
        ScriptOutput::Capture(_) | ScriptOutput::Lines(_) => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        ScriptOutput::Null => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        ScriptOutput::Append(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| PipelineError::Script {
                    reason: format!("open shell output file {}: {e}", path.display()),
                    output: String::new(),
                })?;
            let clone = file.try_clone().map_err(PipelineError::Io)?;
            cmd.stdout(Stdio::from(file)).stderr(Stdio::from(clone));
        }
    }

    let mut child = cmd.spawn().map_err(|e| PipelineError::Script {
        reason: format!("start script {}: {e}", file.display()),
        output: String::new(),
    })?;

    let mut io_tasks = Vec::new();
    match output {
        ScriptOutput::Capture(buffer) => {
            capture = Some(Arc::clone(&buffer));
            if let Some(stdout) = child.stdout.take() {
                io_tasks.push(pump_capture(stdout, Arc::clone(&buffer)));
            }
            if let Some(stderr) = child.stderr.take() {
                io_tasks.push(pump_capture(stderr, buffer));
            }
        }
        ScriptOutput::Lines(tx) => {
            if let Some(stdout) = child.stdout.take() {
                io_tasks.push(pump_lines(stdout, tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                io_tasks.push(pump_lines(stderr, tx));
            }
        }
        ScriptOutput::Null | ScriptOutput::Append(_) => {}
    }

    Ok(RunningScript {
        child,
        io_tasks,
        capture,
    })
}

fn pump_capture<R>(mut reader: R, buffer: Arc<RingBuffer>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buffer.write(&chunk[..n]);
                }
            }
        }
    })
}

fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<String>) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = LineWriter::new(tx);
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write(&chunk[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = writer.close().await;
    })
}

#[cfg(unix)]
fn apply_credentials(
    cmd: &mut Command,
    user: &str,
    group: Option<&str>,
) -> Result<(), PipelineError> {
    let resolved = nix::unistd::User::from_name(user)
        .map_err(|e| PipelineError::Script {
            reason: format!("lookup user {user}: {e}"),
            output: String::new(),
        })?
        .ok_or_else(|| PipelineError::Script {
            reason: format!("unknown run_user: {user}"),
            output: String::new(),
        })?;
    let mut gid = resolved.gid.as_raw();
    if let Some(group) = group {
        gid = nix::unistd::Group::from_name(group)
            .map_err(|e| PipelineError::Script {
                reason: format!("lookup group {group}: {e}"),
                output: String::new(),
            })?
            .ok_or_else(|| PipelineError::Script {
                reason: format!("unknown run_group: {group}"),
                output: String::new(),
            })?
            .gid
            .as_raw();
    }
    cmd.uid(resolved.uid.as_raw()).gid(gid);
    Ok(())
}

#[cfg(not(unix))]
fn apply_credentials(
    _cmd: &mut Command,
    _user: &str,
    _group: Option<&str>,
) -> Result<(), PipelineError> {
    Err(PipelineError::Script {
        reason: "run_user is not supported on this platform".to_owned(),
        output: String::new(),
    })
}

/// 스크립트를 한 번 실행하고 캡처된 출력을 돌려줍니다.
///
/// 출력 정책은 설정을 따르며, 미지정이면 마지막 4KiB를 캡처합니다.
/// 타임아웃 기본값은 60초입니다.
pub async fn run_script(
    script: &str,
    cfg: &ScriptConfig,
    env: &[(String, String)],
    args: &[String],
) -> Result<String, PipelineError> {
    let output = match cfg.shell_output.as_deref() {
        None | Some("") => ScriptOutput::Capture(Arc::new(RingBuffer::default())),
        Some("/dev/null") => ScriptOutput::Null,
        Some(path) => ScriptOutput::Append(PathBuf::from(path)),
    };
    let running = spawn(script, cfg, env, args, output)?;
    let timeout = cfg.timeout.resolve(Some(DEFAULT_TIMEOUT));
    running.wait(timeout, None).await
}

/// 스크립트 출력(stdout+stderr)을 라인 채널로 흘리며 스폰합니다.
///
/// 종료 대기는 호출 측이 [`RunningScript::wait`]로 수행합니다.
pub fn spawn_lines(
    script: &str,
    cfg: &ScriptConfig,
    env: &[(String, String)],
    args: &[String],
    tx: mpsc::Sender<String>,
) -> Result<RunningScript, PipelineError> {
    spawn(script, cfg, env, args, ScriptOutput::Lines(tx))
}
