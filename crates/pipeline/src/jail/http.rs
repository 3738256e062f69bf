//! http jail — 설정된 HTTP 요청을 발사합니다.
//!
//! URL, 쿼리, 헤더, 본문에 `${name}` 전개가 적용됩니다. 발사는 판정당
//! 한 번이며 하류 멱등성은 수신 측의 책임입니다.

use reqwest::{Client, Method};
use serde::Deserialize;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::types::Verdict;

use super::{Jail, MaybeMailer};
use crate::error::PipelineError;
use crate::httpreq::{HttpRequest, HttpRequestConfig};

/// http jail 설정
#[derive(Debug, Deserialize)]
pub struct HttpJailConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default)]
    pub background: bool,
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
}

impl HttpJailConfig {
    fn request_config(&self) -> HttpRequestConfig {
        HttpRequestConfig {
            url: self.url.clone(),
            method: self.method.clone(),
            args: self.args.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout,
        }
    }
}

/// HTTP 콜백 jail
pub struct HttpJail {
    id: String,
    request: HttpRequest,
    client: Client,
    success: Counter,
    fail: Counter,
}

impl HttpJail {
    /// 설정으로 jail을 만듭니다. URL/메서드 검증 실패는 설정 에러입니다.
    pub fn new(cfg: HttpJailConfig) -> Result<Self, PipelineError> {
        let request = HttpRequest::new(cfg.request_config(), Method::POST).map_err(|e| {
            PipelineError::Descriptor {
                kind: "jail",
                id: cfg.id.clone(),
                reason: e.to_string(),
            }
        })?;
        let counters = Counters::global();
        Ok(Self {
            success: counters.register("jail", &cfg.id, "success"),
            fail: counters.register("jail", &cfg.id, "fail"),
            id: cfg.id,
            request,
            client: Client::new(),
        })
    }
}

impl Jail for HttpJail {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arrest(&self, verdict: &Verdict) -> Result<(), PipelineError> {
        tracing::debug!(jail = %self.id, ip = %verdict.ip, "start arrest");
        let mapping = |name: &str| verdict.mapping(name);
        match self.request.execute(&self.client, &mapping, false).await {
            Ok(_) => {
                self.success.incr();
                Ok(())
            }
            Err(e) => {
                self.fail.incr();
                Err(PipelineError::Jail {
                    id: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn close(&self) {}
}

impl MaybeMailer for HttpJail {}
