//! 와처 — 라인 생산자
//!
//! # 변형
//! - [`FileWatch`]: 파일 tail (로테이션 감지, 테스트 모드는 처음부터 읽기)
//! - [`ShellWatch`]: 재시작 정책으로 감독되는 장기 실행 스크립트
//!
//! 각 와처는 자체 tokio 태스크를 소유하며, 생산된 [`Line`]을 바운디드
//! mpsc 채널로 내보냅니다. 마지막 생산 태스크가 끝나면 채널이 닫히며
//! 와처는 자동으로 마무리됩니다.

pub mod file;
pub mod shell;

pub use file::FileWatch;
pub use shell::ShellWatch;

use std::future::Future;

use tokio::sync::mpsc;

use go2jail_core::types::Line;

use crate::error::PipelineError;
use crate::BoxFuture;

/// 라인 채널 용량
pub const LINE_CHANNEL_CAPACITY: usize = 256;

/// 와처 실행 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// 파일 끝에서 따라가기, 스크립트 무기한 감독
    Live,
    /// 파일 처음부터 끝까지, 스크립트 1회 실행 (10초 상한)
    Test,
}

impl WatchMode {
    pub fn is_test(&self) -> bool {
        matches!(self, Self::Test)
    }
}

/// 라인 생산자의 생명주기 trait
///
/// `start`는 라인 수신 채널을 돌려주고, `close`는 모든 내부 태스크를
/// 취소하고 드레인합니다.
pub trait Watch: Send + Sync {
    /// 와처 id
    fn id(&self) -> &str;

    /// 라인 생산을 시작합니다.
    fn start(
        &self,
        mode: WatchMode,
    ) -> impl Future<Output = Result<mpsc::Receiver<Line>, PipelineError>> + Send;

    /// 생산을 중단하고 내부 태스크가 끝날 때까지 기다립니다.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// dyn-compatible 와처 trait
///
/// `Watch`는 RPITIT를 사용하므로 `dyn Watch`가 불가합니다.
/// `DynWatch`는 `BoxFuture`를 반환해 레지스트리와 엔진이
/// `Arc<dyn DynWatch>`로 다룰 수 있게 합니다.
pub trait DynWatch: Send + Sync {
    fn id(&self) -> &str;
    fn start(&self, mode: WatchMode) -> BoxFuture<'_, Result<mpsc::Receiver<Line>, PipelineError>>;
    fn close(&self) -> BoxFuture<'_, ()>;
}

impl<T: Watch> DynWatch for T {
    fn id(&self) -> &str {
        Watch::id(self)
    }

    fn start(&self, mode: WatchMode) -> BoxFuture<'_, Result<mpsc::Receiver<Line>, PipelineError>> {
        Box::pin(Watch::start(self, mode))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(Watch::close(self))
    }
}
