//! HTTP 요청 헬퍼 — http jail과 위치 조회 소스가 공유
//!
//! 설정된 요청(URL, 메서드, 쿼리, 헤더, 본문)에 `${name}` 전개를
//! 적용해 실행합니다. non-2xx 응답은 본문 첫 1KiB를 실은 에러가
//! 됩니다.

use std::time::Duration;

use reqwest::{Client, Method, Url};
use serde::Deserialize;

use go2jail_core::types::{expand, KeyValue};

use crate::error::PipelineError;

/// HTTP 요청 기본 타임아웃
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(1);

/// 에러에 싣는 응답 본문 상한
const ERROR_BODY_LIMIT: usize = 1024;

/// 설정 문서의 HTTP 요청 필드
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequestConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub args: Vec<KeyValue>,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub body: String,
    /// humantime 문자열 (예: "2s"). 기본 1초.
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub timeout: Option<Duration>,
}

pub(crate) fn de_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// 검증이 끝난 실행 가능한 요청
#[derive(Debug, Clone)]
pub struct HttpRequest {
    cfg: HttpRequestConfig,
    method: Method,
    timeout: Duration,
}

impl HttpRequest {
    /// 설정을 검증합니다. 메서드가 비어 있으면 `default_method`를
    /// 사용합니다.
    pub fn new(cfg: HttpRequestConfig, default_method: Method) -> Result<Self, PipelineError> {
        // URL 템플릿의 구조 검증. 플레이스홀더는 자리값으로 바꿔 본다.
        let probe = expand(&cfg.url, |_| "0".to_owned());
        Url::parse(&probe)
            .map_err(|e| PipelineError::Http(format!("bad url: {e}, {}", cfg.url)))?;

        let method = match cfg.method.as_deref() {
            None | Some("") => default_method,
            Some(m) => m
                .parse::<Method>()
                .map_err(|e| PipelineError::Http(format!("bad method '{m}': {e}")))?,
        };
        let timeout = cfg.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT);
        Ok(Self {
            cfg,
            method,
            timeout,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// `${name}` 전개를 적용해 요청을 실행합니다.
    ///
    /// `read_body`가 true면 성공 응답의 본문을 돌려줍니다.
    pub async fn execute(
        &self,
        client: &Client,
        mapping: &(dyn Fn(&str) -> String + Send + Sync),
        read_body: bool,
    ) -> Result<Vec<u8>, PipelineError> {
        let url = expand(&self.cfg.url, &mapping);
        let url = Url::parse(&url)
            .map_err(|e| PipelineError::Http(format!("bad url: {e}, {url}")))?;
        let body = expand(&self.cfg.body, &mapping);

        let mut request = client
            .request(self.method.clone(), url.clone())
            .timeout(self.timeout)
            .body(body);
        for header in &self.cfg.headers {
            request = request.header(&header.key, expand(&header.value, &mapping));
        }
        if !self.cfg.args.is_empty() {
            let query: Vec<(String, String)> = self
                .cfg
                .args
                .iter()
                .map(|kv| (kv.key.clone(), expand(&kv.value, &mapping)))
                .collect();
            request = request.query(&query);
        }

        let response = request.send().await.map_err(|e| {
            PipelineError::Http(format!("{} {} request fail: {e}", self.method, url))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let cut = &body[..body.len().min(ERROR_BODY_LIMIT)];
            return Err(PipelineError::Http(format!(
                "{} {} http status code {}, body={}",
                self.method,
                url,
                status.as_u16(),
                String::from_utf8_lossy(cut),
            )));
        }
        if read_body {
            let body = response
                .bytes()
                .await
                .map_err(|e| PipelineError::Http(format!("read body: {e}")))?;
            return Ok(body.to_vec());
        }
        Ok(Vec::new())
    }
}
