#![doc = include_str!("../README.md")]

pub mod allow;
pub mod counters;
pub mod error;
pub mod linechan;
pub mod matcher;
pub mod rate;
pub mod restart;
pub mod ringbuf;
pub mod types;

// --- 주요 타입 re-export ---
// 각 모듈의 핵심 타입을 크레이트 루트에서 바로 사용할 수 있도록 합니다.

// 에러
pub use error::{ConfigError, Go2jailError};

// 데이터 모델
pub use types::{Extend, KeyValue, Line, StringList, Verdict};

// 허용 목록
pub use allow::{AddressClass, AllowList};

// 말단 컴포넌트
pub use counters::{Counter, Counters};
pub use linechan::LineWriter;
pub use matcher::Matcher;
pub use rate::{RateLimiter, RateSpec};
pub use restart::RestartPolicy;
pub use ringbuf::RingBuffer;
