//! jail — 체포 실행기
//!
//! # 변형
//! - [`NftJail`]: nft set에 주소 추가
//! - [`ShellJail`]: 스크립트 실행 (인자 `[addr, line]`, 판정 환경 변수)
//! - [`HttpJail`]: 설정된 HTTP 요청 발사
//! - [`MailJail`]: SMTP 경보 메일
//! - [`EchoJail`] / [`LogJail`]: 관측용 싱크, 항상 성공
//!
//! 모든 호출은 `(jail, id, success|fail)` 카운터를 증가시킵니다.
//! 디스크립터의 `background` 플래그는 엔진이 읽어 포그라운드/백그라운드
//! 호출을 고릅니다.

pub mod echo;
pub mod http;
pub mod mail;
pub mod nftset;
pub mod shell;

pub use echo::{EchoJail, LogJail};
pub use http::HttpJail;
pub use mail::MailJail;
pub use nftset::NftJail;
pub use shell::ShellJail;

use std::future::Future;

use go2jail_core::types::Verdict;

use crate::error::PipelineError;
use crate::BoxFuture;

/// 체포 실행기 trait
pub trait Jail: Send + Sync {
    /// jail id
    fn id(&self) -> &str;

    /// 판정에 대한 체포 액션을 실행합니다.
    fn arrest(
        &self,
        verdict: &Verdict,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    /// 보유 자원을 정리합니다.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// dyn-compatible jail trait
///
/// 레지스트리와 엔진이 `Arc<dyn DynJail>`로 다룰 수 있게 합니다.
pub trait DynJail: Send + Sync {
    fn id(&self) -> &str;
    fn arrest<'a>(&'a self, verdict: &'a Verdict) -> BoxFuture<'a, Result<(), PipelineError>>;
    fn close(&self) -> BoxFuture<'_, ()>;

    /// SMTP 연결 점검 기능. 메일 jail만 제공합니다.
    fn as_mailer(&self) -> Option<&dyn Mailer> {
        None
    }
}

impl<T: Jail + MaybeMailer> DynJail for T {
    fn id(&self) -> &str {
        Jail::id(self)
    }

    fn arrest<'a>(&'a self, verdict: &'a Verdict) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(Jail::arrest(self, verdict))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(Jail::close(self))
    }

    fn as_mailer(&self) -> Option<&dyn Mailer> {
        MaybeMailer::as_mailer(self)
    }
}

/// `arrest`와 별도로 노출되는 메일 전송 기능
///
/// CLI의 연결 점검 명령이 사용합니다.
pub trait Mailer: Send + Sync {
    fn send_mail<'a>(
        &'a self,
        subject: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<(), PipelineError>>;
}

/// 메일 기능 유무를 blanket impl에 전달하기 위한 보조 trait
pub trait MaybeMailer {
    fn as_mailer(&self) -> Option<&dyn Mailer> {
        None
    }
}
