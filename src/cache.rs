use crate::request::{ExecutionRequest, ExecutionResult};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Caller-keyed cache of successful results.
///
/// An entry is only returned for the exact request it was stored with;
/// the same key with a different request is a miss and the new result
/// replaces the old one. Oldest entries are evicted first.
pub struct ResultCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

struct CacheEntry {
    fingerprint: String,
    result: ExecutionResult,
}

/// Canonical text of everything that determines a request's outcome.
fn fingerprint(request: &ExecutionRequest) -> String {
    Value::Array(vec![
        Value::String(request.source_code.clone()),
        Value::Object(request.context.clone()),
        Value::String(request.policy_name.clone()),
        request.timeout_seconds.map(Value::from).unwrap_or(Value::Null),
    ])
    .to_string()
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, key: &str, request: &ExecutionRequest) -> Option<ExecutionResult> {
        let inner = self.inner.lock().ok()?;
        let entry = inner.entries.get(key)?;
        (entry.fingerprint == fingerprint(request)).then(|| entry.result.clone())
    }

    /// Failed results are not stored.
    pub fn put(&self, key: &str, request: &ExecutionRequest, result: &ExecutionResult) {
        if !result.succeeded || self.capacity == 0 {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let entry = CacheEntry {
            fingerprint: fingerprint(request),
            result: result.clone(),
        };
        if inner.entries.insert(key.to_string(), entry).is_none() {
            inner.order.push_back(key.to_string());
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.entries.remove(key).is_some() {
                inner.order.retain(|k| k != key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FailureReason;
    use serde_json::json;
    use uuid::Uuid;

    fn request(source: &str) -> ExecutionRequest {
        ExecutionRequest::new(source, "hardened").with_binding("n", json!(3))
    }

    fn ok(value: Value) -> ExecutionResult {
        ExecutionResult::success(Uuid::new_v4(), value)
    }

    #[test]
    fn test_hit_requires_same_request() {
        let cache = ResultCache::new(4);
        let req = request("result = n * 2");
        cache.put("k", &req, &ok(json!(6)));

        assert_eq!(cache.get("k", &req).unwrap().result_value, Some(json!(6)));
        assert!(cache.get("k", &request("result = n * 3")).is_none());
        assert!(cache.get("other", &req).is_none());
        let retimed = req.clone().with_timeout_seconds(5);
        assert!(cache.get("k", &retimed).is_none());
    }

    #[test]
    fn test_failures_not_cached() {
        let cache = ResultCache::new(4);
        let req = request("result = 1/0");
        let failed = ExecutionResult::failure(Uuid::nil(), FailureReason::RuntimeError, "boom");
        cache.put("k", &req, &failed);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oldest_evicted() {
        let cache = ResultCache::new(2);
        let req = request("result = 1");
        cache.put("a", &req, &ok(json!(1)));
        cache.put("b", &req, &ok(json!(1)));
        cache.put("c", &req, &ok(json!(1)));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", &req).is_none());
        assert!(cache.get("c", &req).is_some());

        cache.invalidate("c");
        assert!(cache.get("c", &req).is_none());
        assert_eq!(cache.len(), 1);
    }
}
