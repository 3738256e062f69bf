//! 에러 타입 — 도메인별 에러 정의

/// go2jail 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum Go2jailError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 값 파싱/검증 에러
///
/// 설정 문서에서 파생되는 값 타입(`RateSpec`, `RestartPolicy`, `Matcher`,
/// `AllowList`)의 파싱 실패를 표현합니다. 모두 치명적이며 엔진 시작 전에
/// 표면화됩니다.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 레이트 스펙 파싱 실패 (`<count>/<duration>` 형식이 아님)
    #[error("bad rate: {0}")]
    BadRate(String),

    /// 재시작 정책 파싱 실패
    #[error("bad restart policy: {0}")]
    BadPolicy(String),

    /// 백오프 duration 파싱 실패
    #[error("bad backoff '{spec}': {reason}")]
    BadBackoff { spec: String, reason: String },

    /// 정규식 컴파일 실패
    #[error("invalid pattern '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    /// 필수 네임드 캡처 그룹 누락
    #[error("regex group '{group}' must exist in every pattern")]
    MissingGroup { group: String },

    /// CIDR 파싱 실패
    #[error("bad cidr '{value}': {reason}")]
    BadCidr { value: String, reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
