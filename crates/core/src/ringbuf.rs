//! 링 버퍼 — 마지막 N바이트만 남기는 바이트 싱크
//!
//! 서브프로세스 출력 캡처에 쓰입니다. 쓰기는 항상 전체 길이를 소비한
//! 것으로 보고하고, 버퍼에는 전체 기록 중 마지막 `min(total, capacity)`
//! 바이트만 남습니다.

use std::collections::VecDeque;
use std::sync::Mutex;

/// 진단용 출력 캡처의 기본 용량
pub const DEFAULT_CAPACITY: usize = 4096;

/// 고정 용량 바이트 싱크. 동시 쓰기에 안전합니다.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    buf: Mutex<VecDeque<u8>>,
}

impl RingBuffer {
    /// 주어진 용량의 버퍼를 생성합니다.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// 바이트를 기록합니다. 반환값은 항상 `data.len()`입니다.
    ///
    /// 단일 쓰기가 용량 이상이면 그 끝부분만 남습니다.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() || self.capacity == 0 {
            return data.len();
        }
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        if data.len() >= self.capacity {
            buf.clear();
            buf.extend(&data[data.len() - self.capacity..]);
        } else {
            buf.extend(data);
            while buf.len() > self.capacity {
                buf.pop_front();
            }
        }
        data.len()
    }

    /// 현재 내용의 복사본
    pub fn contents(&self) -> Vec<u8> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().copied().collect()
    }

    /// 현재 내용을 유효하지 않은 UTF-8을 치환해 문자열로 만듭니다.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
