//! IP 위치 조회 — HTTP 소스와 바운디드 캐시
//!
//! 위치 조회는 절대 시끄럽게 실패하지 않습니다. 예약 주소 클래스는
//! 상수 레이블로, 실패는 `-`로 강등되며 판정을 막지 않습니다.
//!
//! 모든 소스를 동시에 조회해 필드 단위로 병합(첫 비어 있지 않은 값
//! 우선)하고, 결과는 16바이트 키의 캐시에 저장합니다.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use lru::LruCache;
use reqwest::{Client, Method};
use serde::Deserialize;

use go2jail_core::allow::{fixed_key, AddressClass};

use crate::error::PipelineError;
use crate::httpreq::{HttpRequest, HttpRequestConfig};
use crate::BoxFuture;

/// 위치 캐시 용량
const CACHE_CAPACITY: usize = 1024;

/// 조회 결과가 없을 때의 레이블
const UNKNOWN_LOCATION: &str = "-";

/// 위치 조회 포트
///
/// 엔진은 이 trait을 통해서만 위치를 묻습니다.
pub trait LocationLookup: Send + Sync {
    fn locate<'a>(&'a self, ip: &'a IpAddr) -> BoxFuture<'a, String>;
}

/// 단일 소스의 조회 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub country: String,
    pub region: String,
    pub city: String,
}

impl Location {
    fn is_empty(&self) -> bool {
        self.country.is_empty() && self.region.is_empty() && self.city.is_empty()
    }

    /// 비어 있는 필드만 다른 결과로 채웁니다.
    fn merge_from(&mut self, other: Location) {
        if self.country.is_empty() {
            self.country = other.country;
        }
        if self.region.is_empty() {
            self.region = other.region;
        }
        if self.city.is_empty() {
            self.city = other.city;
        }
    }

    /// `국가-지역-도시` 레이블. 공백류는 제거됩니다.
    fn label(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("{}-{}-{}", self.country, self.region, self.city)
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | '\n' | '\r'))
            .collect()
    }
}

/// 위치 소스 trait. 조회 실패는 빈 결과입니다.
pub trait LocateSource: Send + Sync {
    fn id(&self) -> &str;
    fn fetch<'a>(&'a self, client: &'a Client, ip: &'a str) -> BoxFuture<'a, Location>;
}

/// HTTP 위치 소스 설정
#[derive(Debug, Deserialize)]
pub struct HttpLocationSourceConfig {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub args: Vec<go2jail_core::types::KeyValue>,
    #[serde(default)]
    pub headers: Vec<go2jail_core::types::KeyValue>,
    #[serde(default)]
    pub body: String,
    #[serde(default, deserialize_with = "crate::httpreq::de_opt_duration")]
    pub timeout: Option<std::time::Duration>,
    /// RFC 6901 JSON 포인터 (예: `/location/country`)
    #[serde(default)]
    pub country_pointer: String,
    #[serde(default)]
    pub region_pointer: String,
    #[serde(default)]
    pub city_pointer: String,
}

/// JSON 응답에서 포인터로 필드를 뽑는 HTTP 소스
pub struct HttpLocationSource {
    id: String,
    request: HttpRequest,
    country_pointer: String,
    region_pointer: String,
    city_pointer: String,
}

impl HttpLocationSource {
    pub fn new(mut cfg: HttpLocationSourceConfig) -> Result<Self, PipelineError> {
        if cfg.id.is_empty() {
            cfg.id = random_id();
        }
        for pointer in [
            &cfg.country_pointer,
            &cfg.region_pointer,
            &cfg.city_pointer,
        ] {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(PipelineError::Descriptor {
                    kind: "ip_location_source",
                    id: cfg.id.clone(),
                    reason: format!("bad json pointer: {pointer}"),
                });
            }
        }
        let request = HttpRequest::new(
            HttpRequestConfig {
                url: cfg.url,
                method: cfg.method,
                args: cfg.args,
                headers: cfg.headers,
                body: cfg.body,
                timeout: cfg.timeout,
            },
            Method::GET,
        )
        .map_err(|e| PipelineError::Descriptor {
            kind: "ip_location_source",
            id: cfg.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: cfg.id,
            request,
            country_pointer: cfg.country_pointer,
            region_pointer: cfg.region_pointer,
            city_pointer: cfg.city_pointer,
        })
    }
}

fn random_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_owned()
}

fn pointer_str(value: &serde_json::Value, pointer: &str) -> String {
    if pointer.is_empty() {
        return String::new();
    }
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned()
}

impl LocateSource for HttpLocationSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch<'a>(&'a self, client: &'a Client, ip: &'a str) -> BoxFuture<'a, Location> {
        Box::pin(async move {
            let mapping = |name: &str| {
                if name == "ip" {
                    ip.to_owned()
                } else {
                    String::new()
                }
            };
            let body = match self.request.execute(client, &mapping, true).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(source = %self.id, ip, error = %e, "ip location request fail");
                    return Location::default();
                }
            };
            let value: serde_json::Value = match serde_json::from_slice(&body) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(source = %self.id, ip, error = %e, "ip location bad json");
                    return Location::default();
                }
            };
            Location {
                country: pointer_str(&value, &self.country_pointer),
                region: pointer_str(&value, &self.region_pointer),
                city: pointer_str(&value, &self.city_pointer),
            }
        })
    }
}

/// 16바이트 키의 바운디드 위치 캐시
///
/// 읽기는 `peek`라 recency를 건드리지 않으며, 용량 초과 시 가장
/// 오래전에 기록된 엔트리가 밀려납니다.
pub struct LocationCache {
    inner: RwLock<LruCache<[u8; 16], String>>,
}

impl LocationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// 캐시 조회. 미스는 빈 문자열입니다.
    pub fn get(&self, ip: &IpAddr) -> String {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peek(&fixed_key(ip))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, ip: &IpAddr, value: String) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(fixed_key(ip), value);
    }
}

/// 구성된 위치 소스들의 집합
pub struct LocationSources {
    sources: Vec<Arc<dyn LocateSource>>,
    client: Client,
    cache: LocationCache,
}

impl LocationSources {
    pub fn new(sources: Vec<Arc<dyn LocateSource>>) -> Self {
        Self {
            sources,
            client: Client::new(),
            cache: LocationCache::new(CACHE_CAPACITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// 주소의 위치 레이블을 계산합니다.
    ///
    /// 소스가 없으면 `-`, 예약 클래스는 상수, 그 외에는 캐시/조회
    /// 순입니다. 조회가 모두 비면 `-`로 강등됩니다.
    pub async fn locate(&self, ip: &IpAddr) -> String {
        if self.sources.is_empty() {
            return UNKNOWN_LOCATION.to_owned();
        }
        if let Some(class) = AddressClass::of(ip) {
            return class.location_label().to_owned();
        }
        let cached = self.cache.get(ip);
        if !cached.is_empty() {
            return cached;
        }

        let sip = ip.to_string();
        let results =
            futures::future::join_all(self.sources.iter().map(|s| s.fetch(&self.client, &sip)))
                .await;
        let mut merged = Location::default();
        for result in results {
            merged.merge_from(result);
        }
        let label = merged.label();
        if label.is_empty() {
            return UNKNOWN_LOCATION.to_owned();
        }
        self.cache.set(ip, label.clone());
        label
    }
}

impl Default for LocationSources {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LocationLookup for LocationSources {
    fn locate<'a>(&'a self, ip: &'a IpAddr) -> BoxFuture<'a, String> {
        Box::pin(LocationSources::locate(self, ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct FixedSource(Location);

    impl LocateSource for FixedSource {
        fn id(&self) -> &str {
            "fixed"
        }

        fn fetch<'a>(&'a self, _client: &'a Client, _ip: &'a str) -> BoxFuture<'a, Location> {
            let loc = self.0.clone();
            Box::pin(async move { loc })
        }
    }

    fn sources(list: Vec<Location>) -> LocationSources {
        LocationSources::new(
            list.into_iter()
                .map(|l| Arc::new(FixedSource(l)) as Arc<dyn LocateSource>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn no_sources_degrades_to_dash() {
        let s = LocationSources::default();
        assert_eq!(s.locate(&ip("8.8.8.8")).await, "-");
        assert_eq!(s.locate(&ip("127.0.0.1")).await, "-");
    }

    #[tokio::test]
    async fn reserved_classes_short_circuit() {
        let s = sources(vec![Location::default()]);
        assert_eq!(s.locate(&ip("127.0.0.1")).await, "localhost");
        assert_eq!(s.locate(&ip("10.0.0.1")).await, "private");
        assert_eq!(s.locate(&ip("fe80::1")).await, "link-local-unicast");
        assert_eq!(s.locate(&ip("0.0.0.0")).await, "unspecified");
        assert_eq!(s.locate(&ip("255.255.255.255")).await, "broadcast");
    }

    #[tokio::test]
    async fn merges_sources_field_wise() {
        let s = sources(vec![
            Location {
                country: "KR".to_owned(),
                region: String::new(),
                city: String::new(),
            },
            Location {
                country: "JP".to_owned(),
                region: "Seoul Metro".to_owned(),
                city: "Seoul".to_owned(),
            },
        ]);
        // 첫 소스의 country가 이기고, 빈 필드는 다음 소스가 채운다
        assert_eq!(s.locate(&ip("8.8.8.8")).await, "KR-SeoulMetro-Seoul");
    }

    #[tokio::test]
    async fn empty_results_degrade_to_dash() {
        let s = sources(vec![Location::default()]);
        assert_eq!(s.locate(&ip("8.8.8.8")).await, "-");
    }

    #[test]
    fn cache_get_miss_is_empty() {
        let cache = LocationCache::new(4);
        assert_eq!(cache.get(&ip("8.8.8.8")), "");
    }

    #[test]
    fn cache_stores_and_evicts_bounded() {
        let cache = LocationCache::new(2);
        cache.set(&ip("1.1.1.1"), "a".to_owned());
        cache.set(&ip("2.2.2.2"), "b".to_owned());
        cache.set(&ip("3.3.3.3"), "c".to_owned());

        // 용량 2이므로 셋 중 하나는 밀려났고 나머지는 남아 있다
        let hits = ["1.1.1.1", "2.2.2.2", "3.3.3.3"]
            .iter()
            .filter(|s| !cache.get(&ip(s)).is_empty())
            .count();
        assert_eq!(hits, 2);
        assert_eq!(cache.get(&ip("3.3.3.3")), "c");
    }

    #[test]
    fn cache_set_overwrites_same_key() {
        let cache = LocationCache::new(2);
        cache.set(&ip("1.1.1.1"), "old".to_owned());
        cache.set(&ip("1.1.1.1"), "new".to_owned());
        assert_eq!(cache.get(&ip("1.1.1.1")), "new");
    }

    #[test]
    fn v4_and_mapped_v6_share_cache_key() {
        let cache = LocationCache::new(4);
        cache.set(&ip("1.2.3.4"), "x".to_owned());
        assert_eq!(cache.get(&ip("::ffff:1.2.3.4")), "x");
    }

    #[test]
    fn label_strips_whitespace() {
        let loc = Location {
            country: "South Korea".to_owned(),
            region: "Seoul".to_owned(),
            city: "Gangnam gu".to_owned(),
        };
        assert_eq!(loc.label(), "SouthKorea-Seoul-Gangnamgu");
    }

    #[test]
    fn bad_pointer_is_config_error() {
        let cfg: HttpLocationSourceConfig = serde_yaml::from_str(
            "url: http://example.com/${ip}\ncountry_pointer: 'no-slash'",
        )
        .unwrap();
        assert!(HttpLocationSource::new(cfg).is_err());
    }

    #[test]
    fn omitted_id_gets_random_one() {
        let cfg: HttpLocationSourceConfig =
            serde_yaml::from_str("url: http://example.com/${ip}").unwrap();
        let source = HttpLocationSource::new(cfg).unwrap();
        assert_eq!(source.id().len(), 8);
    }

    #[test]
    fn pointer_extraction() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"location":{"country":"KR","nested":[{"city":"Seoul"}]}}"#)
                .unwrap();
        assert_eq!(pointer_str(&value, "/location/country"), "KR");
        assert_eq!(pointer_str(&value, "/location/nested/0/city"), "Seoul");
        assert_eq!(pointer_str(&value, "/missing"), "");
        assert_eq!(pointer_str(&value, ""), "");
    }
}
