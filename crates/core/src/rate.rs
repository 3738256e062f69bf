//! 레이트 리미터 — 키별 슬라이딩 윈도우 카운터
//!
//! `<count>/<duration>` 스펙으로 구성됩니다. `add`는 키의 카운트가
//! 만료되지 않은 윈도우 안에서 `max`에 도달하는 바로 그 호출에서
//! fire를 보고합니다. 만료된 키는 10초 주기의 백그라운드 스위퍼가
//! 정리합니다.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::ConfigError;

/// 만료 키 정리 주기
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// 레이트 스펙 `<count>/<duration>`
///
/// duration은 `10m` 같은 `<n><unit>` 형식이며, 단위만 쓰면 (`s`, `m`)
/// 암묵적으로 `1`이 붙습니다. 윈도우는 1ms 이상이어야 합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    /// 윈도우 안에서 fire에 필요한 호출 수
    pub max: u32,
    /// 윈도우 길이
    pub window: Duration,
}

impl Default for RateSpec {
    /// 미구성 리미터는 `1/s`로 동작합니다 (첫 호출에서 fire).
    fn default() -> Self {
        Self {
            max: 1,
            window: Duration::from_secs(1),
        }
    }
}

impl FromStr for RateSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::BadRate(s.to_owned());
        let (count, duration) = s.split_once('/').ok_or_else(bad)?;
        let max: u32 = count.trim().parse().map_err(|_| bad())?;
        if max == 0 {
            return Err(bad());
        }
        let mut d = duration.trim().to_owned();
        if !d.contains(|c: char| c.is_ascii_digit()) {
            d.insert(0, '1');
        }
        let window = humantime::parse_duration(&d).map_err(|_| bad())?;
        if window < Duration::from_millis(1) {
            return Err(bad());
        }
        Ok(Self { max, window })
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max, format_window(self.window))
    }
}

impl<'de> Deserialize<'de> for RateSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 윈도우 길이를 로그용 짧은 형식으로 표기합니다.
fn format_window(d: Duration) -> String {
    const SECOND: Duration = Duration::from_secs(1);
    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86_400);

    if d == SECOND {
        return "s".to_owned();
    }
    if d == Duration::from_millis(1) {
        return "ms".to_owned();
    }
    if d == MINUTE {
        return "m".to_owned();
    }
    if d == HOUR {
        return "h".to_owned();
    }
    if d == DAY {
        return "d".to_owned();
    }
    if d.subsec_nanos() != 0 {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    expires_at: Instant,
}

/// 키별 슬라이딩 윈도우 리미터
///
/// 테이블은 맵 연산 동안만 잡는 뮤텍스로 보호됩니다. 스위퍼 태스크는
/// 첫 `add`에서 게으르게 시작되고 [`RateLimiter::stop`]에서 중단됩니다.
#[derive(Debug)]
pub struct RateLimiter {
    spec: RateSpec,
    windows: Arc<Mutex<HashMap<String, Window>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    /// 주어진 스펙으로 리미터를 생성합니다.
    pub fn new(spec: RateSpec) -> Self {
        Self {
            spec,
            windows: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    /// 키의 발생을 기록하고 (사용량 설명, fire 여부)를 반환합니다.
    ///
    /// 같은 윈도우 안에서 `max`번째 호출부터 fire가 true입니다.
    /// 하류의 중복 제거는 jail 계층의 몫입니다.
    pub fn add(&self, key: &str) -> (String, bool) {
        self.ensure_sweeper();

        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows
            .entry(key.to_owned())
            .and_modify(|w| {
                if w.expires_at <= now {
                    w.count = 0;
                    w.expires_at = now + self.spec.window;
                }
            })
            .or_insert_with(|| Window {
                count: 0,
                expires_at: now + self.spec.window,
            });
        window.count += 1;

        let ts = format_window(self.spec.window);
        let fire = window.count >= self.spec.max;
        let desc = if fire {
            format!("{}/{}>={}/{}", window.count, ts, self.spec.max, ts)
        } else {
            format!("{}/{}<{}/{}", window.count, ts, self.spec.max, ts)
        };
        (desc, fire)
    }

    /// 스위퍼를 중단하고 테이블을 비웁니다.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// 스위퍼 태스크를 필요 시 시작합니다. 런타임 밖에서는 건너뜁니다.
    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let windows = Arc::clone(&self.windows);
        *sweeper = Some(handle.spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let now = Instant::now();
                windows
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|_, w| w.expires_at > now);
            }
        }));
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_count_and_duration() {
        let spec: RateSpec = "5/10m".parse().unwrap();
        assert_eq!(spec.max, 5);
        assert_eq!(spec.window, Duration::from_secs(600));
    }

    #[test]
    fn bare_unit_means_one() {
        let spec: RateSpec = "1/s".parse().unwrap();
        assert_eq!(spec.window, Duration::from_secs(1));

        let spec: RateSpec = "3/m".parse().unwrap();
        assert_eq!(spec.window, Duration::from_secs(60));

        let spec: RateSpec = "2/ms".parse().unwrap();
        assert_eq!(spec.window, Duration::from_millis(1));
    }

    #[test]
    fn rejects_malformed_specs() {
        for bad in ["", "5", "5x10m", "0/1s", "x/1s", "5/", "5/0ms"] {
            assert!(bad.parse::<RateSpec>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn display_round_trips_units() {
        for (s, expect) in [
            ("1/1s", "1/s"),
            ("5/10m", "5/10m"),
            ("2/1h", "2/h"),
            ("2/24h", "2/d"),
            ("7/500ms", "7/500ms"),
            ("1/90s", "1/90s"),
        ] {
            let spec: RateSpec = s.parse().unwrap();
            assert_eq!(spec.to_string(), expect);
        }
    }

    #[test]
    fn default_spec_fires_immediately() {
        let limiter = RateLimiter::new(RateSpec::default());
        let (desc, fire) = limiter.add("1.2.3.4");
        assert!(fire);
        assert_eq!(desc, "1/s>=1/s");
    }

    #[test]
    fn fires_exactly_at_max_within_window() {
        let limiter = RateLimiter::new("3/1h".parse().unwrap());
        assert!(!limiter.add("k").1);
        assert!(!limiter.add("k").1);
        let (desc, fire) = limiter.add("k");
        assert!(fire);
        assert_eq!(desc, "3/h>=3/h");
        // 같은 윈도우의 후속 호출도 fire를 유지
        assert!(limiter.add("k").1);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new("2/1h".parse().unwrap());
        assert!(!limiter.add("a").1);
        assert!(!limiter.add("b").1);
        assert!(limiter.add("a").1);
        assert!(limiter.add("b").1);
    }

    #[test]
    fn expired_window_restarts_count() {
        let limiter = RateLimiter::new("2/20ms".parse().unwrap());
        assert!(!limiter.add("k").1);
        std::thread::sleep(Duration::from_millis(40));
        // 새 윈도우, 카운트 1부터
        let (desc, fire) = limiter.add("k");
        assert!(!fire);
        assert_eq!(desc, "1/20ms<2/20ms");
    }

    #[tokio::test]
    async fn sweeper_purges_expired_keys() {
        let limiter = RateLimiter::new("5/30ms".parse().unwrap());
        limiter.add("gone");
        tokio::time::sleep(Duration::from_millis(60)).await;
        {
            let mut windows = limiter.windows.lock().unwrap();
            let now = Instant::now();
            windows.retain(|_, w| w.expires_at > now);
            assert!(windows.is_empty());
        }
        limiter.stop();
    }

    #[tokio::test]
    async fn stop_clears_table() {
        let limiter = RateLimiter::new("5/1h".parse().unwrap());
        limiter.add("k");
        limiter.stop();
        assert!(limiter.windows.lock().unwrap().is_empty());
    }
}
