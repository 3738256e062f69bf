//! 설정 로더 — 타입 태그 레지스트리와 2단계 디코딩
//!
//! 각 디스크립터는 공통 헤더(`id`, `type`)를 먼저 읽고, 같은 문서
//! 조각을 타입별 빌더에 [`Decoder`]로 넘겨 다시 파싱합니다. 여러
//! 문서는 로드 순서대로 병합되며 같은 id는 나중 문서가 이깁니다.
//! 로드가 끝나면 디서플린이 참조하는 watch/jail id를 검증합니다.
//!
//! 빌더 테이블은 [`Registry`] 값이 소유합니다. 전역 상태가 아니므로
//! 테스트는 각자 레지스트리를 만들어 씁니다.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::Value;

use go2jail_core::allow::AllowList;
use go2jail_core::types::StringList;

use crate::discipline::{Discipline, RegexDiscipline};
use crate::error::PipelineError;
use crate::jail::{DynJail, EchoJail, HttpJail, LogJail, MailJail, NftJail, ShellJail};
use crate::location::{HttpLocationSource, LocateSource, LocationSources};
use crate::watch::{DynWatch, FileWatch, ShellWatch};

/// 디스크립터 종류 이름 (에러 메시지용)
const KIND_WATCH: &str = "watch";
const KIND_DISCIPLINE: &str = "discipline";
const KIND_JAIL: &str = "jail";
const KIND_LOCATION: &str = "ip_location_source";

/// 원본 문서 조각에 묶인 디코더
///
/// 빌더는 이 디코더로 자신의 옵션 구조체를 파싱합니다. strict 모드면
/// 알 수 없는 필드가 에러가 됩니다.
pub struct Decoder<'a> {
    kind: &'static str,
    id: &'a str,
    value: &'a Value,
    strict: bool,
}

impl Decoder<'_> {
    /// 문서 조각을 `T`로 디코딩합니다.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        if self.strict {
            let mut unknown = Vec::new();
            let parsed: T =
                serde_ignored::deserialize(self.value.clone(), |path| {
                    unknown.push(path.to_string());
                })
                .map_err(|e: serde_yaml::Error| self.error(e.to_string()))?;
            if !unknown.is_empty() {
                return Err(self.error(format!("unknown fields: {}", unknown.join(", "))));
            }
            Ok(parsed)
        } else {
            serde_yaml::from_value(self.value.clone()).map_err(|e| self.error(e.to_string()))
        }
    }

    fn error(&self, reason: String) -> PipelineError {
        PipelineError::Descriptor {
            kind: self.kind,
            id: self.id.to_owned(),
            reason,
        }
    }
}

/// 타입 태그 → 빌더
pub type WatchBuilder = fn(&Decoder<'_>) -> Result<Arc<dyn DynWatch>, PipelineError>;
pub type DisciplineBuilder = fn(&Decoder<'_>) -> Result<Arc<dyn Discipline>, PipelineError>;
pub type JailBuilder = fn(&Decoder<'_>) -> Result<Arc<dyn DynJail>, PipelineError>;
pub type LocationBuilder = fn(&Decoder<'_>) -> Result<Arc<dyn LocateSource>, PipelineError>;

/// 네 종류의 빌더 테이블을 소유하는 레지스트리
pub struct Registry {
    watches: HashMap<String, WatchBuilder>,
    disciplines: HashMap<String, DisciplineBuilder>,
    jails: HashMap<String, JailBuilder>,
    locations: HashMap<String, LocationBuilder>,
}

impl Registry {
    /// 빈 레지스트리
    pub fn new() -> Self {
        Self {
            watches: HashMap::new(),
            disciplines: HashMap::new(),
            jails: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    /// 내장 타입이 모두 등록된 레지스트리
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_watch("file", |dec| Ok(Arc::new(FileWatch::new(dec.decode()?)?)));
        registry.register_watch("shell", |dec| Ok(Arc::new(ShellWatch::new(dec.decode()?)?)));
        registry.register_discipline("regex", |dec| {
            Ok(Arc::new(RegexDiscipline::new(dec.decode()?)?))
        });
        registry.register_jail("nftset", |dec| Ok(Arc::new(NftJail::new(dec.decode()?)?)));
        registry.register_jail("shell", |dec| Ok(Arc::new(ShellJail::new(dec.decode()?)?)));
        registry.register_jail("http", |dec| Ok(Arc::new(HttpJail::new(dec.decode()?)?)));
        registry.register_jail("mail", |dec| Ok(Arc::new(MailJail::new(dec.decode()?)?)));
        registry.register_jail("echo", |dec| Ok(Arc::new(EchoJail::new(dec.decode()?))));
        registry.register_jail("log", |dec| Ok(Arc::new(LogJail::new(dec.decode()?))));
        registry.register_location("http", |dec| {
            Ok(Arc::new(HttpLocationSource::new(dec.decode()?)?))
        });
        registry
    }

    pub fn register_watch(&mut self, name: impl Into<String>, builder: WatchBuilder) {
        self.watches.insert(name.into(), builder);
    }

    pub fn register_discipline(&mut self, name: impl Into<String>, builder: DisciplineBuilder) {
        self.disciplines.insert(name.into(), builder);
    }

    pub fn register_jail(&mut self, name: impl Into<String>, builder: JailBuilder) {
        self.jails.insert(name.into(), builder);
    }

    pub fn register_location(&mut self, name: impl Into<String>, builder: LocationBuilder) {
        self.locations.insert(name.into(), builder);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// 구성된 와처 엔트리
pub struct WatchEntry {
    pub id: String,
    pub type_tag: String,
    pub watch: Arc<dyn DynWatch>,
}

/// 구성된 jail 엔트리. `background`는 엔진이 읽습니다.
pub struct JailEntry {
    pub id: String,
    pub type_tag: String,
    pub background: bool,
    pub jail: Arc<dyn DynJail>,
}

/// 구성된 디서플린 엔트리와 참조 목록
pub struct DisciplineEntry {
    pub id: String,
    pub type_tag: String,
    pub watches: Vec<String>,
    pub jails: Vec<String>,
    pub discipline: Arc<dyn Discipline>,
}

/// 로드가 끝난 전체 설정
pub struct Config {
    pub watches: Vec<WatchEntry>,
    pub disciplines: Vec<DisciplineEntry>,
    pub jails: Vec<JailEntry>,
    pub allows: AllowList,
    pub locations: Arc<LocationSources>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("watches", &self.watches.iter().map(|w| &w.id).collect::<Vec<_>>())
            .field("disciplines", &self.disciplines.iter().map(|d| &d.id).collect::<Vec<_>>())
            .field("jails", &self.jails.iter().map(|j| &j.id).collect::<Vec<_>>())
            .finish()
    }
}

impl Config {
    /// YAML 파일들을 로드 순서대로 병합해 설정을 만듭니다.
    pub fn load_files<P: AsRef<Path>>(
        registry: &Registry,
        paths: &[P],
        strict: bool,
    ) -> Result<Self, PipelineError> {
        let mut docs = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let content =
                std::fs::read_to_string(path).map_err(|e| PipelineError::Parse {
                    source_name: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            docs.push((path.display().to_string(), content));
        }
        let borrowed: Vec<(&str, &str)> = docs
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_str()))
            .collect();
        Self::load_documents(registry, &borrowed, strict)
    }

    /// 문서 문자열들을 병합해 설정을 만듭니다. 테스트가 주로 씁니다.
    pub fn load_documents(
        registry: &Registry,
        docs: &[(&str, &str)],
        strict: bool,
    ) -> Result<Self, PipelineError> {
        let mut raw_watches: Vec<(String, Value)> = Vec::new();
        let mut raw_disciplines: Vec<(String, Value)> = Vec::new();
        let mut raw_jails: Vec<(String, Value)> = Vec::new();
        let mut raw_locations: Vec<(String, Value)> = Vec::new();
        let mut allows = AllowList::default();

        for (name, content) in docs {
            let mut value: Value =
                serde_yaml::from_str(content).map_err(|e| PipelineError::Parse {
                    source_name: (*name).to_owned(),
                    reason: e.to_string(),
                })?;
            value.apply_merge().map_err(|e| PipelineError::Parse {
                source_name: (*name).to_owned(),
                reason: e.to_string(),
            })?;

            let doc: RawDocument = if strict {
                let mut unknown = Vec::new();
                let parsed = serde_ignored::deserialize(value, |path| {
                    unknown.push(path.to_string())
                })
                .map_err(|e: serde_yaml::Error| PipelineError::Parse {
                    source_name: (*name).to_owned(),
                    reason: e.to_string(),
                })?;
                if !unknown.is_empty() {
                    return Err(PipelineError::Parse {
                        source_name: (*name).to_owned(),
                        reason: format!("unknown fields: {}", unknown.join(", ")),
                    });
                }
                parsed
            } else {
                serde_yaml::from_value(value).map_err(|e| PipelineError::Parse {
                    source_name: (*name).to_owned(),
                    reason: e.to_string(),
                })?
            };

            merge_section(&mut raw_watches, doc.watches, KIND_WATCH)?;
            merge_section(&mut raw_disciplines, doc.disciplines, KIND_DISCIPLINE)?;
            merge_section(&mut raw_jails, doc.jails, KIND_JAIL)?;
            merge_location_section(&mut raw_locations, doc.ip_location_sources)?;
            allows.merge(&AllowList::from_cidrs(&doc.allows)?);
        }

        let mut watches = Vec::new();
        for (id, value) in &raw_watches {
            let header: TypedHeader = decode_header(KIND_WATCH, id, value)?;
            let builder = registry.watches.get(&header.type_tag).ok_or_else(|| {
                PipelineError::UnknownType {
                    kind: KIND_WATCH,
                    type_tag: header.type_tag.clone(),
                }
            })?;
            let decoder = Decoder {
                kind: KIND_WATCH,
                id,
                value,
                strict,
            };
            watches.push(WatchEntry {
                id: id.clone(),
                type_tag: header.type_tag,
                watch: builder(&decoder)?,
            });
        }

        let mut jails = Vec::new();
        for (id, value) in &raw_jails {
            let header: JailHeader = decode_header(KIND_JAIL, id, value)?;
            let builder = registry.jails.get(&header.type_tag).ok_or_else(|| {
                PipelineError::UnknownType {
                    kind: KIND_JAIL,
                    type_tag: header.type_tag.clone(),
                }
            })?;
            let decoder = Decoder {
                kind: KIND_JAIL,
                id,
                value,
                strict,
            };
            jails.push(JailEntry {
                id: id.clone(),
                type_tag: header.type_tag,
                background: header.background,
                jail: builder(&decoder)?,
            });
        }

        let mut disciplines = Vec::new();
        for (id, value) in &raw_disciplines {
            let mut header: DisciplineHeader = decode_header(KIND_DISCIPLINE, id, value)?;
            if header.type_tag.is_empty() {
                header.type_tag = "regex".to_owned();
            }
            let builder = registry.disciplines.get(&header.type_tag).ok_or_else(|| {
                PipelineError::UnknownType {
                    kind: KIND_DISCIPLINE,
                    type_tag: header.type_tag.clone(),
                }
            })?;
            let decoder = Decoder {
                kind: KIND_DISCIPLINE,
                id,
                value,
                strict,
            };
            disciplines.push(DisciplineEntry {
                id: id.clone(),
                type_tag: header.type_tag,
                watches: header.watches.iter().map(str::to_owned).collect(),
                jails: header.jails.iter().map(str::to_owned).collect(),
                discipline: builder(&decoder)?,
            });
        }

        let mut locations = Vec::new();
        for (id, value) in &raw_locations {
            let mut header: TypedHeader = decode_header(KIND_LOCATION, id, value)?;
            if header.type_tag.is_empty() {
                header.type_tag = "http".to_owned();
            }
            let builder = registry.locations.get(&header.type_tag).ok_or_else(|| {
                PipelineError::UnknownType {
                    kind: KIND_LOCATION,
                    type_tag: header.type_tag.clone(),
                }
            })?;
            let decoder = Decoder {
                kind: KIND_LOCATION,
                id,
                value,
                strict,
            };
            locations.push(builder(&decoder)?);
        }

        let config = Self {
            watches,
            disciplines,
            jails,
            allows,
            locations: Arc::new(LocationSources::new(locations)),
        };
        config.validate_references()?;
        Ok(config)
    }

    /// 디서플린이 참조하는 watch/jail id가 모두 존재하는지 검증합니다.
    fn validate_references(&self) -> Result<(), PipelineError> {
        for discipline in &self.disciplines {
            for id in &discipline.watches {
                if self.watch(id).is_none() {
                    return Err(PipelineError::DanglingReference {
                        discipline: discipline.id.clone(),
                        kind: KIND_WATCH,
                        id: id.clone(),
                    });
                }
            }
            for id in &discipline.jails {
                if self.jail(id).is_none() {
                    return Err(PipelineError::DanglingReference {
                        discipline: discipline.id.clone(),
                        kind: KIND_JAIL,
                        id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn watch(&self, id: &str) -> Option<&WatchEntry> {
        self.watches.iter().find(|w| w.id == id)
    }

    pub fn jail(&self, id: &str) -> Option<&JailEntry> {
        self.jails.iter().find(|j| j.id == id)
    }

    pub fn discipline(&self, id: &str) -> Option<&DisciplineEntry> {
        self.disciplines.iter().find(|d| d.id == id)
    }
}

/// YAML 문서의 최상위 구조
#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    jails: Vec<Value>,
    #[serde(default)]
    watches: Vec<Value>,
    #[serde(default)]
    disciplines: Vec<Value>,
    #[serde(default)]
    allows: Vec<String>,
    #[serde(default)]
    ip_location_sources: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TypedHeader {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    type_tag: String,
}

#[derive(Debug, Deserialize)]
struct JailHeader {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    type_tag: String,
    #[serde(default)]
    background: bool,
}

#[derive(Debug, Deserialize)]
struct DisciplineHeader {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    type_tag: String,
    #[serde(default)]
    watches: StringList,
    #[serde(default)]
    jails: StringList,
}

fn decode_header<T: DeserializeOwned>(
    kind: &'static str,
    id: &str,
    value: &Value,
) -> Result<T, PipelineError> {
    serde_yaml::from_value(value.clone()).map_err(|e| PipelineError::Descriptor {
        kind,
        id: id.to_owned(),
        reason: format!("bad header: {e}"),
    })
}

/// 섹션을 id 기준으로 병합합니다. 같은 id는 나중 문서가 이깁니다.
fn merge_section(
    dst: &mut Vec<(String, Value)>,
    src: Vec<Value>,
    kind: &'static str,
) -> Result<(), PipelineError> {
    for value in src {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if id.is_empty() {
            return Err(PipelineError::Descriptor {
                kind,
                id: "(empty)".to_owned(),
                reason: "id is empty".to_owned(),
            });
        }
        match dst.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = value,
            None => dst.push((id, value)),
        }
    }
    Ok(())
}

/// 위치 소스는 id가 선택 사항이므로 없는 것끼리는 병합하지 않습니다.
fn merge_location_section(
    dst: &mut Vec<(String, Value)>,
    src: Vec<Value>,
) -> Result<(), PipelineError> {
    for value in src {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        match dst
            .iter_mut()
            .find(|(existing, _)| !existing.is_empty() && *existing == id)
        {
            Some(entry) => entry.1 = value,
            None => dst.push((id, value)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(doc: &str) -> Result<Config, PipelineError> {
        Config::load_documents(&Registry::builtin(), &[("test.yaml", doc)], false)
    }

    const BASE: &str = r#"
jails:
  - id: j1
    type: echo
watches:
  - id: w1
    type: file
    files: [/var/log/test.log]
    skip_when_file_not_exists: true
disciplines:
  - id: d1
    watches: [w1]
    jails: [j1]
    matches: '%(ip)'
    rate: 1/1s
allows:
  - 10.0.0.0/8
"#;

    #[test]
    fn loads_full_document() {
        let config = load(BASE).unwrap();
        assert_eq!(config.watches.len(), 1);
        assert_eq!(config.jails.len(), 1);
        assert_eq!(config.disciplines.len(), 1);
        assert_eq!(config.allows.len(), 1);
        assert!(config.locations.is_empty());
        assert_eq!(config.watches[0].type_tag, "file");
        // type을 생략한 디서플린은 regex가 된다
        assert_eq!(config.disciplines[0].type_tag, "regex");
    }

    #[test]
    fn unknown_watch_type_fails() {
        let err = load(
            r#"
watches:
  - id: w1
    type: carrier-pigeon
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown watch type"));
    }

    #[test]
    fn empty_id_fails() {
        let err = load(
            r#"
jails:
  - type: echo
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("id is empty"));
    }

    #[test]
    fn dangling_watch_reference_fails() {
        let err = load(
            r#"
jails:
  - id: j1
    type: echo
disciplines:
  - id: d1
    watches: [nope]
    jails: [j1]
    matches: '%(ip)'
"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "[discipline-d1] watch nope not found");
    }

    #[test]
    fn dangling_jail_reference_fails() {
        let err = load(
            r#"
watches:
  - id: w1
    type: file
    files: [/tmp/x.log]
    skip_when_file_not_exists: true
disciplines:
  - id: d1
    watches: [w1]
    jails: [ghost]
    matches: '%(ip)'
"#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "[discipline-d1] jail ghost not found");
    }

    #[test]
    fn later_document_overrides_by_id() {
        let second = r#"
jails:
  - id: j1
    type: log
"#;
        let config = Config::load_documents(
            &Registry::builtin(),
            &[("a.yaml", BASE), ("b.yaml", second)],
            false,
        )
        .unwrap();
        assert_eq!(config.jails.len(), 1);
        assert_eq!(config.jails[0].type_tag, "log");
    }

    #[test]
    fn merge_keeps_descriptors_from_both_documents() {
        let second = r#"
jails:
  - id: j2
    type: echo
    background: true
"#;
        let config = Config::load_documents(
            &Registry::builtin(),
            &[("a.yaml", BASE), ("b.yaml", second)],
            false,
        )
        .unwrap();
        assert_eq!(config.jails.len(), 2);
        assert!(config.jail("j2").unwrap().background);
        assert!(!config.jail("j1").unwrap().background);
    }

    #[test]
    fn strict_mode_rejects_unknown_descriptor_fields() {
        let doc = r#"
jails:
  - id: j1
    type: echo
    backgruond: true
"#;
        let err =
            Config::load_documents(&Registry::builtin(), &[("t.yaml", doc)], true).unwrap_err();
        assert!(err.to_string().contains("backgruond"), "{err}");

        // 관대 모드에서는 통과한다
        Config::load_documents(&Registry::builtin(), &[("t.yaml", doc)], false).unwrap();
    }

    #[test]
    fn strict_mode_rejects_unknown_top_level_keys() {
        let doc = "watchs: []\n";
        let err =
            Config::load_documents(&Registry::builtin(), &[("t.yaml", doc)], true).unwrap_err();
        assert!(err.to_string().contains("watchs"));
    }

    #[test]
    fn discipline_requires_ip_group() {
        let err = load(
            r#"
watches:
  - id: w1
    type: file
    files: [/tmp/x.log]
    skip_when_file_not_exists: true
disciplines:
  - id: d1
    watches: [w1]
    matches: 'no-group'
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ip"));
    }

    #[test]
    fn bad_rate_names_the_descriptor() {
        let err = load(
            r#"
disciplines:
  - id: d1
    matches: '%(ip)'
    rate: banana
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("discipline"), "{msg}");
        assert!(msg.contains("d1"), "{msg}");
    }

    #[test]
    fn bad_cidr_fails() {
        assert!(load("allows: ['not-a-cidr']").is_err());
    }

    #[test]
    fn scalar_and_sequence_fields_both_parse() {
        let config = load(
            r#"
jails:
  - id: j1
    type: echo
watches:
  - id: w1
    type: file
    files: /tmp/one.log
    skip_when_file_not_exists: true
disciplines:
  - id: d1
    watches: w1
    jails: j1
    matches: ['%(ip)', 'other %(ip) pattern']
"#,
        )
        .unwrap();
        assert_eq!(config.disciplines[0].watches, vec!["w1"]);
    }

    #[test]
    fn location_sources_are_loaded() {
        let config = load(
            r#"
ip_location_sources:
  - id: geo
    url: 'http://geo.example.com/${ip}'
    country_pointer: /country
"#,
        )
        .unwrap();
        assert_eq!(config.locations.len(), 1);
    }

    #[test]
    fn load_files_reads_lexicographic_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.yaml");
        std::fs::write(&a, BASE).unwrap();
        let config = Config::load_files(&Registry::builtin(), &[&a], false).unwrap();
        assert_eq!(config.watches.len(), 1);
    }

    #[test]
    fn missing_file_is_parse_error() {
        let err = Config::load_files(
            &Registry::builtin(),
            &[Path::new("/does/not/exist.yaml")],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }
}
