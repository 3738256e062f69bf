//! 라인 채널 어댑터 — 바이트 스트림을 라인 레코드로 분리
//!
//! [`LineWriter`]는 들어오는 바이트를 `\n` 기준으로 잘라 한 줄씩
//! 바운디드 mpsc 채널에 넣습니다. 개행은 제거됩니다. 닫힌 채널로의
//! 전송은 에러로 관측되며 패닉하지 않습니다.

use tokio::sync::mpsc;

/// 개행 없는 출력의 무한 누적을 막는 강제 플러시 임계값
pub const MAX_PENDING: usize = 24 * 1024;

/// 닫힌 채널로의 전송 에러
#[derive(Debug, thiserror::Error)]
#[error("send to closed channel")]
pub struct ChannelClosed;

/// 바이트 스트림 → 라인 분리 어댑터
///
/// 내부 버퍼가 [`MAX_PENDING`]을 넘으면 개행 없이도 한 줄로
/// 강제 플러시됩니다. [`LineWriter::close`]는 남은 버퍼를 마지막
/// 라인으로 내보냅니다.
#[derive(Debug)]
pub struct LineWriter {
    tx: mpsc::Sender<String>,
    buf: Vec<u8>,
}

impl LineWriter {
    /// 주어진 송신단으로 어댑터를 만듭니다.
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// 바이트 청크를 처리하고 완성된 라인을 내보냅니다.
    pub async fn write(&mut self, mut chunk: &[u8]) -> Result<(), ChannelClosed> {
        while !chunk.is_empty() {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    self.buf.extend_from_slice(&chunk[..idx]);
                    self.flush_line().await?;
                    chunk = &chunk[idx + 1..];
                }
                None => {
                    self.buf.extend_from_slice(chunk);
                    break;
                }
            }
        }
        if self.buf.len() >= MAX_PENDING {
            self.flush_line().await?;
        }
        Ok(())
    }

    /// 남은 버퍼를 마지막 라인으로 내보내며 어댑터를 닫습니다.
    pub async fn close(mut self) -> Result<(), ChannelClosed> {
        if !self.buf.is_empty() {
            self.flush_line().await?;
        }
        Ok(())
    }

    async fn flush_line(&mut self) -> Result<(), ChannelClosed> {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        self.tx.send(line).await.map_err(|_| ChannelClosed)
    }
}
