//! 디서플린 — 라인 분류기
//!
//! [`RegexDiscipline`]은 라인을 매칭/무시/허용/레이트 판정 파이프라인에
//! 통과시켜 [`Verdict`]를 생산합니다. 판정 순서:
//!
//! 1. 빈 라인은 버린다
//! 2. `matches` 매칭 실패는 버린다
//! 3. `ignores`가 전체 매칭 부분에 걸리면 버린다
//! 4. `ip` 그룹이 주소로 파싱되지 않으면 버린다 (`bad_ip`)
//! 5. 전역/로컬 허용 목록에 있으면 버린다 (`allow_ip`)
//! 6. 레이트 리미터가 fire하면 판정을 만든다 (`arrest_ip`)

use serde::Deserialize;

use go2jail_core::allow::AllowList;
use go2jail_core::counters::{Counter, Counters};
use go2jail_core::matcher::Matcher;
use go2jail_core::rate::{RateLimiter, RateSpec};
use go2jail_core::types::{Line, StringList, Verdict};

use crate::error::PipelineError;

/// 라인 분류기 trait
///
/// `judge`는 판정이 내려졌을 때만 `Some`을 반환합니다. 반환된 판정의
/// 주소는 전역/로컬 허용 목록을 이미 통과한 것입니다.
pub trait Discipline: Send + Sync {
    /// 디서플린 id
    fn id(&self) -> &str;

    /// 라인을 분류합니다.
    fn judge(&self, line: &Line, global_allow: &AllowList) -> Option<Verdict>;

    /// 레이트 리미터 등 배경 자원을 정리합니다.
    fn close(&self);
}

/// regex 디서플린 설정
#[derive(Debug, Deserialize)]
pub struct RegexDisciplineConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default)]
    pub watches: StringList,
    #[serde(default)]
    pub jails: StringList,
    pub matches: Matcher,
    #[serde(default)]
    pub ignores: Option<Matcher>,
    #[serde(default)]
    pub rate: Option<RateSpec>,
    /// 디서플린 로컬 허용 목록
    #[serde(default)]
    pub allows: Option<AllowList>,
}

/// 정규식 기반 라인 분류기
pub struct RegexDiscipline {
    id: String,
    matches: Matcher,
    ignores: Option<Matcher>,
    rate: RateLimiter,
    allows: AllowList,

    tail_lines: Counter,
    match_lines: Counter,
    bad_ip: Counter,
    allow_ip: Counter,
    watch_ip: Counter,
    arrest_ip: Counter,
}

impl RegexDiscipline {
    /// 설정으로 디서플린을 만듭니다.
    ///
    /// `matches`는 `ip` 네임드 그룹을 반드시 정의해야 합니다.
    pub fn new(cfg: RegexDisciplineConfig) -> Result<Self, PipelineError> {
        if cfg.matches.is_empty() {
            return Err(PipelineError::Descriptor {
                kind: "discipline",
                id: cfg.id.clone(),
                reason: "matches is empty".to_owned(),
            });
        }
        cfg.matches
            .expect_groups(&["ip"])
            .map_err(|e| PipelineError::Descriptor {
                kind: "discipline",
                id: cfg.id.clone(),
                reason: format!("bad matches: {e}, {:?}", cfg.matches.pattern_strings()),
            })?;

        let counters = Counters::global();
        Ok(Self {
            tail_lines: counters.register("discipline", &cfg.id, "tail_lines"),
            match_lines: counters.register("discipline", &cfg.id, "match_lines"),
            bad_ip: counters.register("discipline", &cfg.id, "bad_ip"),
            allow_ip: counters.register("discipline", &cfg.id, "allow_ip"),
            watch_ip: counters.register("discipline", &cfg.id, "watch_ip"),
            arrest_ip: counters.register("discipline", &cfg.id, "arrest_ip"),
            id: cfg.id,
            matches: cfg.matches,
            ignores: cfg.ignores,
            rate: RateLimiter::new(cfg.rate.unwrap_or_default()),
            allows: cfg.allows.unwrap_or_default(),
        })
    }
}

impl Discipline for RegexDiscipline {
    fn id(&self) -> &str {
        &self.id
    }

    fn judge(&self, line: &Line, global_allow: &AllowList) -> Option<Verdict> {
        self.tail_lines.incr();
        if line.text.is_empty() {
            return None;
        }

        let Some(groups) = self.matches.capture(&line.text) else {
            tracing::debug!(
                discipline = %self.id,
                length = line.text.len(),
                "regex not match"
            );
            return None;
        };

        if let Some(ignores) = &self.ignores {
            let full = groups.get("").unwrap_or_default();
            if ignores.test(full) {
                tracing::debug!(
                    discipline = %self.id,
                    length = line.text.len(),
                    "regex ignore"
                );
                return None;
            }
        }
        self.match_lines.incr();

        let ip: std::net::IpAddr = match groups.get("ip").unwrap_or_default().parse() {
            Ok(ip) => ip,
            Err(_) => {
                self.bad_ip.incr();
                return None;
            }
        };

        if global_allow.contains(&ip) || self.allows.contains(&ip) {
            self.allow_ip.incr();
            tracing::debug!(discipline = %self.id, ip = %ip, "ip is in allow list");
            return None;
        }

        let (desc, fire) = self.rate.add(&ip.to_string());
        if !fire {
            self.watch_ip.incr();
            tracing::info!(
                discipline = %self.id,
                ip = %ip,
                usage = %desc,
                line = %line.text,
                "watch-on"
            );
            return None;
        }
        self.arrest_ip.incr();
        tracing::info!(
            discipline = %self.id,
            ip = %ip,
            usage = %desc,
            line = %line.text,
            "arrest"
        );
        Some(Verdict::new(line, self.id.clone(), ip, groups))
    }

    fn close(&self) {
        self.rate.stop();
    }
}
