//! 파이프라인 에러 타입
//!
//! [`PipelineError`]는 설정 로딩, 와처, jail, 엔진에서 발생하는 모든
//! 에러를 표현합니다. `From<ConfigError>` 변환으로 core의 값 파싱
//! 에러를 `?`로 자연스럽게 전파할 수 있습니다.

use go2jail_core::error::{ConfigError, Go2jailError};

/// 파이프라인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 설정 문서 파싱 실패
    #[error("parse config fail {source_name}: {reason}")]
    Parse {
        /// 문서 이름 (파일 경로 또는 "<inline>")
        source_name: String,
        /// 실패 사유
        reason: String,
    },

    /// 디스크립터 단위의 설정 에러
    #[error("[{kind}-{id}] {reason}")]
    Descriptor {
        /// 디스크립터 종류 (watch, discipline, jail, ip_location_source)
        kind: &'static str,
        /// 문제가 된 디스크립터 id
        id: String,
        /// 에러 사유
        reason: String,
    },

    /// 알 수 없는 타입 태그
    #[error("unknown {kind} type: {type_tag}")]
    UnknownType {
        kind: &'static str,
        type_tag: String,
    },

    /// 교차 참조 검증 실패 (존재하지 않는 id 참조)
    #[error("[discipline-{discipline}] {kind} {id} not found")]
    DanglingReference {
        discipline: String,
        kind: &'static str,
        id: String,
    },

    /// 와처 실행 에러
    #[error("[watch-{id}] {reason}")]
    Watch { id: String, reason: String },

    /// 스크립트 실행 실패. 캡처된 출력 꼬리를 함께 나릅니다.
    #[error("script fail: {reason}, output={output}")]
    Script { reason: String, output: String },

    /// jail 실행 에러
    #[error("[jail-{id}] {reason}")]
    Jail { id: String, reason: String },

    /// HTTP 요청 실패 (non-2xx는 본문 1KiB까지 포함)
    #[error("http error: {0}")]
    Http(String),

    /// SMTP 전송 실패
    #[error("mail error: {0}")]
    Mail(String),

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// 엔진 수준 에러
    #[error("engine error: {0}")]
    Engine(String),

    /// core 값 파싱 에러
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PipelineError> for Go2jailError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Config(e) => Go2jailError::Config(e),
            PipelineError::Io(e) => Go2jailError::Io(e),
            other => Go2jailError::Config(ConfigError::InvalidValue {
                field: "pipeline".to_owned(),
                reason: other.to_string(),
            }),
        }
    }
}
