//! 패턴 매처 — 순서 있는 정규식 목록과 별칭 전개
//!
//! 컴파일 전에 패턴 안의 `%(ip)` 토큰이 IPv4/IPv6 리터럴을 받는
//! 표준 네임드 캡처 `(?P<ip>...)`로 치환됩니다. 패턴은 설정 로딩 시
//! 한 번만 컴파일됩니다.

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::Extend;

/// 패턴 안에서 전개되는 주소 별칭 토큰
pub const IP_ALIAS: &str = "%(ip)";

/// `%(ip)` 별칭이 전개되는 표준 캡처 패턴
const IP_CAPTURE: &str =
    r"(?P<ip>(([0-9a-fA-F]{0,4}:){1,7}[0-9a-fA-F]{0,4})|([0-9]{1,3}(\.[0-9]{1,3}){3}))";

/// 순서 있는 컴파일된 패턴 집합
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    patterns: Vec<Regex>,
}

impl Matcher {
    /// 패턴 목록을 별칭 전개 후 컴파일합니다.
    pub fn compile<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for p in patterns {
            let raw = p.as_ref();
            let expanded = raw.replace(IP_ALIAS, IP_CAPTURE);
            let regex = Regex::new(&expanded).map_err(|e| ConfigError::BadPattern {
                pattern: raw.to_owned(),
                reason: e.to_string(),
            })?;
            compiled.push(regex);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// 원본 패턴 문자열 목록 (에러 메시지용)
    pub fn pattern_strings(&self) -> Vec<String> {
        self.patterns.iter().map(|r| r.to_string()).collect()
    }

    /// 패턴 중 하나라도 매칭되는지 검사합니다.
    pub fn test(&self, s: &str) -> bool {
        self.patterns.iter().any(|r| r.is_match(s))
    }

    /// 첫 번째로 매칭되는 패턴의 결과를 키-값 목록으로 반환합니다.
    ///
    /// 첫 엔트리는 (빈 키, 전체 매칭), 이후 네임드 그룹이 정의 순서대로
    /// 이어집니다. 매칭이 없으면 `None`입니다.
    pub fn capture(&self, s: &str) -> Option<Extend> {
        for regex in &self.patterns {
            if let Some(caps) = regex.captures(s) {
                let mut extend = Extend::new();
                extend.push("", caps.get(0).map(|m| m.as_str()).unwrap_or_default());
                for name in regex.capture_names().flatten() {
                    let value = caps.name(name).map(|m| m.as_str()).unwrap_or_default();
                    extend.push(name, value);
                }
                return Some(extend);
            }
        }
        None
    }

    /// 모든 패턴이 주어진 네임드 그룹을 갖는지 검증합니다.
    pub fn expect_groups(&self, groups: &[&str]) -> Result<(), ConfigError> {
        for group in groups {
            for regex in &self.patterns {
                if !regex.capture_names().flatten().any(|n| n == *group) {
                    return Err(ConfigError::MissingGroup {
                        group: (*group).to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for Matcher {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        let patterns = match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        };
        Self::compile(patterns).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_alias_matches_v4_literal() {
        let m = Matcher::compile(["%(ip)"]).unwrap();
        assert!(m.test("failed login from 192.168.1.100 port 22"));

        let ext = m.capture("192.168.1.100").unwrap();
        assert_eq!(ext.get(""), Some("192.168.1.100"));
        assert_eq!(ext.get("ip"), Some("192.168.1.100"));
        let ip: std::net::IpAddr = ext.get("ip").unwrap().parse().unwrap();
        assert!(ip.is_ipv4());
    }

    #[test]
    fn ip_alias_matches_v6_literal() {
        let m = Matcher::compile(["%(ip)"]).unwrap();
        let ext = m.capture("probe from 2001:db8::dead:beef done").unwrap();
        let ip: std::net::IpAddr = ext.get("ip").unwrap().parse().unwrap();
        assert!(ip.is_ipv6());
    }

    #[test]
    fn full_match_is_substring_of_input() {
        let m = Matcher::compile([r"%(ip) (?P<user>\S+)"]).unwrap();
        let input = "1.1.1.1 root extra";
        let ext = m.capture(input).unwrap();
        assert!(input.contains(ext.get("").unwrap()));
    }

    #[test]
    fn named_groups_in_definition_order() {
        let m = Matcher::compile([r"(?P<b>b+) (?P<a>a+)"]).unwrap();
        let ext = m.capture("bb aa").unwrap();
        let keys: Vec<&str> = ext.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["", "b", "a"]);
    }

    #[test]
    fn first_pattern_wins() {
        let m = Matcher::compile([r"(?P<x>first)", r"(?P<x>f\w+)"]).unwrap();
        let ext = m.capture("first").unwrap();
        assert_eq!(ext.get("x"), Some("first"));
    }

    #[test]
    fn no_match_returns_none() {
        let m = Matcher::compile(["%(ip)"]).unwrap();
        assert!(m.capture("no address here").is_none());
        assert!(!m.test("no address here"));
    }

    #[test]
    fn unmatched_optional_group_is_empty() {
        let m = Matcher::compile([r"a(?P<opt>b)?"]).unwrap();
        let ext = m.capture("a").unwrap();
        assert_eq!(ext.get("opt"), Some(""));
    }

    #[test]
    fn expect_groups_accepts_present_group() {
        let m = Matcher::compile(["%(ip)"]).unwrap();
        m.expect_groups(&["ip"]).unwrap();
    }

    #[test]
    fn expect_groups_rejects_missing_group() {
        let m = Matcher::compile([r"\d+"]).unwrap();
        assert!(m.expect_groups(&["ip"]).is_err());
    }

    #[test]
    fn expect_groups_checks_every_pattern() {
        let m = Matcher::compile(["%(ip)", r"\d+"]).unwrap();
        assert!(m.expect_groups(&["ip"]).is_err());
    }

    #[test]
    fn bad_pattern_fails_compilation() {
        assert!(Matcher::compile(["[unclosed"]).is_err());
    }

    #[test]
    fn deserializes_scalar_and_sequence() {
        let one: Matcher = serde_yaml::from_str("'%(ip)'").unwrap();
        assert_eq!(one.len(), 1);

        let many: Matcher = serde_yaml::from_str("['%(ip)', 'other']").unwrap();
        assert_eq!(many.len(), 2);
    }
}
