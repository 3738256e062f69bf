//! 도메인 타입 — 시스템 전역에서 사용되는 공통 타입
//!
//! 와처가 생산하는 [`Line`], 디서플린이 추출하는 [`Extend`],
//! 그리고 체포 판정 레코드인 [`Verdict`]를 정의합니다.

use std::fmt;
use std::net::IpAddr;

use serde::Deserialize;

/// 서브프로세스 환경 변수 접두어
pub const ENV_PREFIX: &str = "GO2JAIL_";

/// IP 위치 정보 환경 변수 이름
pub const ENV_IP_LOCATION: &str = "GO2JAIL_IP_LOCATION";

/// 테스트 모드 표시 환경 변수 이름
pub const ENV_TEST: &str = "GO2JAIL_TEST";

/// 와처가 생산하는 한 줄의 로그 레코드
///
/// 와처를 떠난 뒤에는 변경되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 생산한 와처의 id
    pub watch_id: String,
    /// 라인 텍스트 (개행 제거됨)
    pub text: String,
}

impl Line {
    /// 새 라인 레코드를 생성합니다.
    pub fn new(watch_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            watch_id: watch_id.into(),
            text: text.into(),
        }
    }
}

/// 키-값 쌍
///
/// 정규식 네임드 그룹 추출 결과와 http jail의 args/headers 설정에
/// 쓰입니다.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 순서 있는 키-값 목록
///
/// 정규식 매칭에서 추출된 그룹들을 정의 순서대로 보관합니다.
/// 첫 엔트리는 빈 키와 전체 매칭 문자열입니다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extend(Vec<KeyValue>);

impl Extend {
    /// 빈 목록을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 엔트리를 뒤에 추가합니다.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(KeyValue::new(key, value));
    }

    /// 키로 값을 조회합니다. 같은 키가 여러 개면 첫 번째가 이깁니다.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// `GO2JAIL_<sanitized-key>=<value>` 형태의 환경 변수 쌍으로
    /// 렌더링합니다.
    ///
    /// 키에서 `[A-Za-z0-9_]` 밖의 문자 연속은 `_` 하나로 치환됩니다.
    pub fn as_env(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|kv| {
                (
                    format!("{}{}", ENV_PREFIX, sanitize_env_key(&kv.key)),
                    kv.value.clone(),
                )
            })
            .collect()
    }

    /// `${name}` 템플릿을 이 목록에 대해 전개합니다.
    ///
    /// 없는 이름은 빈 문자열로 전개됩니다.
    pub fn expand(&self, template: &str) -> String {
        expand(template, |name| {
            self.get(name).unwrap_or_default().to_owned()
        })
    }
}

impl FromIterator<KeyValue> for Extend {
    fn from_iter<T: IntoIterator<Item = KeyValue>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Extend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kv) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\t")?;
            }
            write!(f, "{}={}", kv.key, kv.value)?;
        }
        Ok(())
    }
}

/// 환경 변수 키를 정규화합니다. 유효하지 않은 문자의 연속은 `_` 하나가 됩니다.
fn sanitize_env_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut in_run = false;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// `${name}` 플레이스홀더를 `mapping`의 결과로 치환합니다.
///
/// 닫히지 않은 `${`는 그대로 복사됩니다.
pub fn expand(template: &str, mapping: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&mapping(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// 체포 판정 레코드
///
/// 디서플린이 레이트 임계값을 넘긴 라인에 대해 생성합니다.
/// `ip`는 전역/로컬 허용 목록을 이미 통과한 주소입니다.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// 원본 라인 텍스트
    pub line: String,
    /// 라인을 생산한 와처의 id
    pub watch_id: String,
    /// 판정을 내린 디서플린의 id
    pub discipline_id: String,
    /// 가해 주소
    pub ip: IpAddr,
    /// 정규식 그룹 추출 결과
    pub extend: Extend,
    /// IP 위치 문자열. 엔진이 jail 호출 전에 채웁니다.
    pub ip_location: String,
}

impl Verdict {
    /// 라인과 추출 결과로 판정 레코드를 생성합니다.
    pub fn new(line: &Line, discipline_id: impl Into<String>, ip: IpAddr, extend: Extend) -> Self {
        Self {
            line: line.text.clone(),
            watch_id: line.watch_id.clone(),
            discipline_id: discipline_id.into(),
            ip,
            extend,
            ip_location: String::new(),
        }
    }

    /// `${name}` 전개에 쓰이는 이름 해석.
    ///
    /// `ip`와 `ip_location`은 합성 이름이며, 나머지는 extend 목록에서
    /// 찾습니다.
    pub fn mapping(&self, name: &str) -> String {
        match name {
            "ip" => self.ip.to_string(),
            "ip_location" => self.ip_location.clone(),
            _ => self.extend.get(name).unwrap_or_default().to_owned(),
        }
    }

    /// 템플릿을 이 판정에 대해 전개합니다.
    pub fn expand(&self, template: &str) -> String {
        expand(template, |name| self.mapping(name))
    }

    /// 서브프로세스 환경 변수 목록을 만듭니다.
    ///
    /// extend의 환경 변수에 `GO2JAIL_IP_LOCATION`이 더해집니다.
    pub fn as_env(&self) -> Vec<(String, String)> {
        let mut env = self.extend.as_env();
        env.push((ENV_IP_LOCATION.to_owned(), self.ip_location.clone()));
        env
    }
}

/// 문자열 하나 또는 문자열 목록을 모두 받는 목록 타입
///
/// 설정의 `files`, `watches`, `jails` 필드는 단일 문자열과 시퀀스를
/// 모두 허용합니다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'de> Deserialize<'de> for StringList {
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

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => Self(vec![s]),
            OneOrMany::Many(v) => Self(v),
        })
    }
}
