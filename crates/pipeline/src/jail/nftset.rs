//! nftset jail — `nft add element`로 주소를 차단 set에 넣습니다.
//!
//! 주소 패밀리에 따라 IPv4/IPv6 set을 고르고, 선택적으로 `sudo`를
//! 앞에 붙입니다. 실행은 5초 안에 끝나야 하며 실패 메시지에는 출력의
//! 마지막 4KiB가 실립니다.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::ringbuf::RingBuffer;
use go2jail_core::types::Verdict;

use super::{Jail, MaybeMailer};
use crate::error::PipelineError;
use crate::script::lookup_path;

/// nft 실행 제한 시간
const NFT_TIMEOUT: Duration = Duration::from_secs(5);

/// nftset jail 설정
#[derive(Debug, Deserialize)]
pub struct NftJailConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub nft_executable: Option<String>,
    pub rule: String,
    pub table: String,
    pub ipv4_set: String,
    pub ipv6_set: String,
}

/// nft set 기반 차단 jail
#[derive(Debug)]
pub struct NftJail {
    id: String,
    sudo: bool,
    nft: PathBuf,
    rule: String,
    table: String,
    ipv4_set: String,
    ipv6_set: String,
    success: Counter,
    fail: Counter,
}

impl NftJail {
    /// 설정으로 jail을 만듭니다. nft 실행 파일이 없으면 설정 에러입니다.
    pub fn new(cfg: NftJailConfig) -> Result<Self, PipelineError> {
        let name = cfg.nft_executable.as_deref().unwrap_or("nft");
        let nft = lookup_path(name).ok_or_else(|| PipelineError::Descriptor {
            kind: "jail",
            id: cfg.id.clone(),
            reason: format!("can not find nft executable: {name}"),
        })?;
        let counters = Counters::global();
        Ok(Self {
            success: counters.register("jail", &cfg.id, "success"),
            fail: counters.register("jail", &cfg.id, "fail"),
            id: cfg.id,
            sudo: cfg.sudo,
            nft,
            rule: cfg.rule,
            table: cfg.table,
            ipv4_set: cfg.ipv4_set,
            ipv6_set: cfg.ipv6_set,
        })
    }

    fn program(&self, ip: &IpAddr) -> Vec<String> {
        let (addr, set) = match ip {
            IpAddr::V4(v4) => (v4.to_string(), &self.ipv4_set),
            IpAddr::V6(v6) => (v6.to_string(), &self.ipv6_set),
        };
        let mut program = Vec::new();
        if self.sudo {
            program.push("sudo".to_owned());
        }
        program.push(self.nft.to_string_lossy().into_owned());
        for part in ["add", "element"] {
            program.push(part.to_owned());
        }
        program.push(self.rule.clone());
        program.push(self.table.clone());
        program.push(set.clone());
        program.push("{".to_owned());
        program.push(addr);
        program.push("}".to_owned());
        program
    }
}

impl Jail for NftJail {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arrest(&self, verdict: &Verdict) -> Result<(), PipelineError> {
        let program = self.program(&verdict.ip);

        let mut cmd = tokio::process::Command::new(&program[0]);
        cmd.args(&program[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let result = tokio::time::timeout(NFT_TIMEOUT, cmd.output()).await;
        let outcome = match result {
            Err(_) => Err("timed out".to_owned()),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let tail = RingBuffer::default();
                tail.write(&output.stdout);
                tail.write(&output.stderr);
                Err(format!(
                    "{}, args={:?}, output={}",
                    output.status,
                    program,
                    tail.to_string_lossy(),
                ))
            }
        };

        match outcome {
            Ok(()) => {
                self.success.incr();
                Ok(())
            }
            Err(reason) => {
                self.fail.incr();
                Err(PipelineError::Jail {
                    id: self.id.clone(),
                    reason,
                })
            }
        }
    }

    async fn close(&self) {}
}

impl MaybeMailer for NftJail {}
