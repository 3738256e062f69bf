//! 카운터 레지스트리 — `(group, id, metric)` 이름의 원자 카운터
//!
//! 프로세스 전역 레지스트리는 [`Counters::global`]로 접근합니다.
//! 스냅샷은 `{group: {id: {metric: n}}}` 형태의 JSON으로 렌더링되며
//! 엔진의 stats HTTP 엔드포인트가 그대로 내보냅니다.
//! 테스트는 [`Counters::clear`]로 레지스트리를 초기화합니다.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{Map, Value};

/// 레지스트리가 관리하는 카운터 핸들
///
/// 복제는 같은 원자 값을 공유합니다.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    /// 1 증가시킵니다.
    pub fn incr(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값을 읽습니다.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

type Table = BTreeMap<String, BTreeMap<String, BTreeMap<String, Counter>>>;

/// 이름 있는 카운터의 레지스트리
#[derive(Debug, Default)]
pub struct Counters {
    table: Mutex<Table>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 프로세스 전역 레지스트리
    pub fn global() -> &'static Counters {
        static GLOBAL: OnceLock<Counters> = OnceLock::new();
        GLOBAL.get_or_init(Counters::new)
    }

    /// 카운터를 등록하고 핸들을 돌려줍니다.
    ///
    /// 같은 (group, id, metric)으로 다시 등록하면 기존 카운터를
    /// 공유합니다.
    pub fn register(&self, group: &str, id: &str, metric: &str) -> Counter {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(group.to_owned())
            .or_default()
            .entry(id.to_owned())
            .or_default()
            .entry(metric.to_owned())
            .or_default()
            .clone()
    }

    /// 현재 값의 JSON 스냅샷을 만듭니다.
    pub fn snapshot(&self) -> Value {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut groups = Map::new();
        for (group, ids) in table.iter() {
            let mut id_map = Map::new();
            for (id, metrics) in ids {
                let mut metric_map = Map::new();
                for (metric, counter) in metrics {
                    metric_map.insert(metric.clone(), Value::from(counter.value()));
                }
                id_map.insert(id.clone(), Value::Object(metric_map));
            }
            groups.insert(group.clone(), Value::Object(id_map));
        }
        Value::Object(groups)
    }

    /// 레지스트리를 비웁니다. 기존 핸들은 분리된 채 남습니다.
    pub fn clear(&self) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
