//! 엔진 종단 시나리오 테스트
//!
//! nft 스텁 스크립트가 받은 인자를 로그 파일에 기록하고, 테스트는
//! 그 내용으로 파이프라인 전체(와처 -> 디서플린 -> jail)를 검증합니다.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use go2jail_core::counters::Counters;
use go2jail_pipeline::config::{Config, Registry};
use go2jail_pipeline::engine::{Engine, EngineOptions};

struct TestBed {
    dir: tempfile::TempDir,
    nft_log: PathBuf,
    watch_file: PathBuf,
}

impl TestBed {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let nft_log = dir.path().join("nft.log");
        let stub = dir.path().join("nft");
        let mut f = std::fs::File::create(&stub).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "echo \"$@\" >> {}", nft_log.display()).unwrap();
        drop(f);
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let watch_file = dir.path().join("test.log");
        std::fs::write(&watch_file, b"").unwrap();
        Self {
            dir,
            nft_log,
            watch_file,
        }
    }

    fn nft_stub(&self) -> String {
        self.dir.path().join("nft").display().to_string()
    }

    fn append(&self, lines: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.watch_file)
            .unwrap();
        f.write_all(lines.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    fn nft_config(&self, name: &str, discipline_extra: &str) -> String {
        format!(
            r#"
jails:
  - id: '{name}'
    type: nftset
    sudo: false
    nft_executable: {nft}
    rule: inet
    table: filter
    ipv4_set: ipv4_block_set
    ipv6_set: ipv6_block_set
watches:
  - id: '{name}'
    type: file
    files: [{file}]
disciplines:
  - id: '{name}'
    jails: ['{name}']
    watches: ['{name}']
    matches: '%(ip)'
{discipline_extra}
"#,
            nft = self.nft_stub(),
            file = self.watch_file.display(),
        )
    }
}

async fn start_engine(doc: &str) -> Engine {
    let config = Config::load_documents(&Registry::builtin(), &[("test.yaml", doc)], true)
        .expect("config should load");
    Engine::start(config, EngineOptions::default())
        .await
        .expect("engine should start")
}

/// 카운터가 기대값에 도달할 때까지 폴링합니다.
async fn wait_counter(group: &str, id: &str, metric: &str, expect: i64) {
    for _ in 0..100 {
        let snap = Counters::global().snapshot();
        if snap[group][id][metric] == expect {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "counter {group}/{id}/{metric} never reached {expect}: {}",
        Counters::global().snapshot()
    );
}

fn read_log(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test]
async fn file_watch_to_nftset_rate_1s() {
    let bed = TestBed::new();
    let engine = start_engine(&bed.nft_config("ban-basic", "    rate: 1/1s")).await;

    bed.append("1.1.1.1\n2.2.2.2\n");
    wait_counter("jail", "ban-basic", "success", 2).await;
    engine.stop_and_wait().await;

    assert_eq!(
        read_log(&bed.nft_log),
        "add element inet filter ipv4_block_set { 1.1.1.1 }\n\
         add element inet filter ipv4_block_set { 2.2.2.2 }\n"
    );
}

#[tokio::test]
async fn rate_two_per_minute_gates_first_occurrence() {
    let bed = TestBed::new();
    let engine = start_engine(&bed.nft_config("ban-rate", "    rate: 2/m")).await;

    bed.append("1.1.1.1\n1.1.1.1\n2.2.2.2\n");
    wait_counter("discipline", "ban-rate", "tail_lines", 3).await;
    engine.stop_and_wait().await;

    // 1.1.1.1은 두 번째 발생에서 fire, 2.2.2.2는 한 번뿐이라 감시만
    assert_eq!(
        read_log(&bed.nft_log),
        "add element inet filter ipv4_block_set { 1.1.1.1 }\n"
    );
}

#[tokio::test]
async fn ignore_pattern_drops_matching_lines() {
    let bed = TestBed::new();
    let engine = start_engine(&bed.nft_config(
        "ban-ignore",
        "    ignores: '^1\\.'\n    rate: 1/1s",
    ))
    .await;

    bed.append("1.1.1.1\n1.1.1.1\n2.2.2.2\n");
    wait_counter("discipline", "ban-ignore", "tail_lines", 3).await;
    engine.stop_and_wait().await;

    assert_eq!(
        read_log(&bed.nft_log),
        "add element inet filter ipv4_block_set { 2.2.2.2 }\n"
    );
}

#[tokio::test]
async fn shell_jail_receives_args_and_group_environment() {
    let bed = TestBed::new();
    let out = bed.dir.path().join("shell-jail.log");
    let doc = format!(
        r#"
jails:
  - id: sj
    type: shell
    run: |
      echo "$1 ip=$GO2JAIL_ip user=$GO2JAIL_user loc=$GO2JAIL_IP_LOCATION" >> {out}
watches:
  - id: sj
    type: file
    files: [{file}]
disciplines:
  - id: sj
    jails: [sj]
    watches: [sj]
    matches: '%(ip) (?P<user>.+)'
    rate: 1/s
"#,
        out = out.display(),
        file = bed.watch_file.display(),
    );
    let engine = start_engine(&doc).await;

    bed.append("1.1.1.1 user1\n2.2.2.2 user2\n");
    wait_counter("jail", "sj", "success", 2).await;
    engine.stop_and_wait().await;

    assert_eq!(
        read_log(&out),
        "1.1.1.1 ip=1.1.1.1 user=user1 loc=-\n\
         2.2.2.2 ip=2.2.2.2 user=user2 loc=-\n"
    );
}

#[tokio::test]
async fn shell_watch_feeds_disciplines_without_restart() {
    let bed = TestBed::new();
    let doc = format!(
        r#"
jails:
  - id: sw
    type: nftset
    nft_executable: {nft}
    rule: inet
    table: filter
    ipv4_set: ipv4_block_set
    ipv6_set: ipv6_block_set
watches:
  - id: sw
    type: shell
    run: |
      echo 3.3.3.3
      echo 3.3.3.4
      echo 3.3.3.5
      echo 3.3.3.6
      exit 1
    restart_policy: 'on-success/10s'
disciplines:
  - id: sw
    jails: [sw]
    watches: [sw]
    matches: '%(ip)'
    rate: 1/s
"#,
        nft = bed.nft_stub(),
    );
    let engine = start_engine(&doc).await;

    wait_counter("jail", "sw", "success", 4).await;
    engine.stop_and_wait().await;

    assert_eq!(
        read_log(&bed.nft_log),
        "add element inet filter ipv4_block_set { 3.3.3.3 }\n\
         add element inet filter ipv4_block_set { 3.3.3.4 }\n\
         add element inet filter ipv4_block_set { 3.3.3.5 }\n\
         add element inet filter ipv4_block_set { 3.3.3.6 }\n"
    );
    // exit 1 + on-success 정책이므로 재시작은 없어야 한다
    let snap = Counters::global().snapshot();
    assert_eq!(snap["watch"]["sw"]["restart"], 0);
}

#[tokio::test]
async fn counters_reflect_the_full_run() {
    let bed = TestBed::new();
    let engine = start_engine(&bed.nft_config("ban-counted", "    rate: 1/1s")).await;

    bed.append("1.1.1.1\n0.0.0.0\n2.2.2.2\n");
    wait_counter("jail", "ban-counted", "success", 2).await;
    engine.stop_and_wait().await;

    let snap = Counters::global().snapshot();
    assert_eq!(snap["watch"]["ban-counted"]["lines"], 3);
    assert_eq!(snap["discipline"]["ban-counted"]["tail_lines"], 3);
    assert_eq!(snap["discipline"]["ban-counted"]["match_lines"], 3);
    assert_eq!(snap["discipline"]["ban-counted"]["bad_ip"], 0);
    assert_eq!(snap["discipline"]["ban-counted"]["allow_ip"], 1);
    assert_eq!(snap["discipline"]["ban-counted"]["watch_ip"], 0);
    assert_eq!(snap["discipline"]["ban-counted"]["arrest_ip"], 2);
    assert_eq!(snap["jail"]["ban-counted"]["success"], 2);
    assert_eq!(snap["jail"]["ban-counted"]["fail"], 0);

    assert_eq!(
        read_log(&bed.nft_log),
        "add element inet filter ipv4_block_set { 1.1.1.1 }\n\
         add element inet filter ipv4_block_set { 2.2.2.2 }\n"
    );
}

#[tokio::test]
async fn test_mode_runs_one_discipline_with_echo_jail() {
    let bed = TestBed::new();
    std::fs::write(&bed.watch_file, "1.1.1.1\n2.2.2.2\n").unwrap();
    let doc = bed.nft_config("ban-testmode", "    rate: 1/s");

    let config =
        Config::load_documents(&Registry::builtin(), &[("test.yaml", &doc)], true).unwrap();
    let engine = Engine::start(
        config,
        EngineOptions {
            test_discipline: Some("ban-testmode".to_owned()),
            stats_listen: None,
        },
    )
    .await
    .unwrap();

    // 테스트 모드는 파일 끝에서 와처가 스스로 끝난다
    tokio::time::timeout(Duration::from_secs(10), engine.wait())
        .await
        .expect("test mode should finish on its own");
    engine.stop_and_wait().await;

    let snap = Counters::global().snapshot();
    assert_eq!(snap["discipline"]["ban-testmode"]["arrest_ip"], 2);
    // 진짜 jail은 호출되지 않는다
    assert_eq!(read_log(&bed.nft_log), "");
}

#[tokio::test]
async fn background_jail_completes_before_wait_returns() {
    let bed = TestBed::new();
    let out = bed.dir.path().join("bg.log");
    let doc = format!(
        r#"
jails:
  - id: bg
    type: shell
    background: true
    run: |
      sleep 0.3
      echo "$1" >> {out}
watches:
  - id: bg
    type: file
    files: [{file}]
disciplines:
  - id: bg
    jails: [bg]
    watches: [bg]
    matches: '%(ip)'
    rate: 1/1s
"#,
        out = out.display(),
        file = bed.watch_file.display(),
    );
    let engine = start_engine(&doc).await;

    bed.append("7.7.7.7\n");
    wait_counter("discipline", "bg", "arrest_ip", 1).await;
    engine.stop_and_wait().await;

    // stop_and_wait가 돌아온 시점에는 백그라운드 체포도 끝나 있다
    assert_eq!(read_log(&out), "7.7.7.7\n");
}

#[tokio::test]
async fn stats_endpoint_serves_counters_and_404s_elsewhere() {
    let bed = TestBed::new();

    // 사용 가능한 포트를 예약했다가 돌려준다
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let doc = bed.nft_config("ban-stats", "    rate: 1/1s");
    let config =
        Config::load_documents(&Registry::builtin(), &[("test.yaml", &doc)], true).unwrap();
    let engine = Engine::start(
        config,
        EngineOptions {
            test_discipline: None,
            stats_listen: Some(addr.clone()),
        },
    )
    .await
    .unwrap();

    bed.append("5.5.5.5\n");
    wait_counter("jail", "ban-stats", "success", 1).await;

    let client = reqwest::Client::new();
    let text = client
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["jail"]["ban-stats"]["success"], 1);

    let resp = client
        .get(format!("http://{addr}/other"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client
        .post(format!("http://{addr}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    engine.stop_and_wait().await;
}

#[tokio::test]
async fn stop_and_wait_drains_everything() {
    let bed = TestBed::new();
    let engine = start_engine(&bed.nft_config("ban-drain", "    rate: 1/1s")).await;
    bed.append("6.6.6.6\n");
    wait_counter("jail", "ban-drain", "success", 1).await;

    tokio::time::timeout(Duration::from_secs(10), engine.stop_and_wait())
        .await
        .expect("stop_and_wait should drain within the timeout");
}
