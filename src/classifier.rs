//! Pluggable decision capability for mappings the rule table cannot settle,
//! such as free-text coverage types.
//!
//! Implementations must be deterministic enough to memoize. Callers wrap them in
//! [`BoundedClassifier`] so a slow or failing classifier degrades to the field's
//! default value instead of stalling the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Known attributes handed to a classifier, keyed by source path.
pub type ClassifierContext = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier did not answer within {0:?}")]
    Timeout(Duration),

    #[error("classifier failed: {0}")]
    Failed(String),

    #[error("invalid classifier rule '{0}', expected keyword=value")]
    InvalidRule(String),
}

pub trait Classifier: Send + Sync {
    /// Decide a value from the context, or `None` when there is no answer.
    fn classify(&self, context: &ClassifierContext) -> Result<Option<String>, ClassifierError>;
}

/// Rule-table classifier: the first keyword found in any context value wins.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    rules: Vec<(String, String)>,
}

impl KeywordClassifier {
    pub fn new(rules: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(keyword, value)| (keyword.to_lowercase(), value))
                .collect(),
        }
    }

    /// Parse `keyword=value;keyword=value`.
    pub fn parse(spec: &str) -> Result<Self, ClassifierError> {
        let mut rules = Vec::new();
        for rule in spec.split(';').map(str::trim).filter(|r| !r.is_empty()) {
            match rule.split_once('=') {
                Some((keyword, value)) if !keyword.trim().is_empty() => {
                    rules.push((keyword.trim().to_string(), value.trim().to_string()));
                }
                _ => return Err(ClassifierError::InvalidRule(rule.to_string())),
            }
        }
        Ok(Self::new(rules))
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, context: &ClassifierContext) -> Result<Option<String>, ClassifierError> {
        let haystack: Vec<String> = context.values().map(|v| v.to_lowercase()).collect();
        Ok(self
            .rules
            .iter()
            .find(|(keyword, _)| haystack.iter().any(|v| v.contains(keyword.as_str())))
            .map(|(_, value)| value.clone()))
    }
}

/// Memoizing, time-bounded wrapper around another classifier.
///
/// After the first timeout the inner classifier is treated as stalled and is
/// not called again, so a hung classifier holds at most one helper thread per
/// in-flight request.
pub struct BoundedClassifier {
    inner: Arc<dyn Classifier>,
    timeout: Duration,
    cache: Mutex<HashMap<ClassifierContext, Option<String>>>,
    stalled: AtomicBool,
}

impl BoundedClassifier {
    pub fn new(inner: Arc<dyn Classifier>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            cache: Mutex::new(HashMap::new()),
            stalled: AtomicBool::new(false),
        }
    }

    fn cached(&self, context: &ClassifierContext) -> Option<Option<String>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(context).cloned()
    }
}

impl Classifier for BoundedClassifier {
    fn classify(&self, context: &ClassifierContext) -> Result<Option<String>, ClassifierError> {
        if let Some(answer) = self.cached(context) {
            return Ok(answer);
        }
        if self.stalled.load(Ordering::Acquire) {
            return Err(ClassifierError::Timeout(self.timeout));
        }

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let owned = context.clone();
        // Abandoned on timeout; the send fails quietly once rx is gone.
        thread::spawn(move || {
            let _ = tx.send(inner.classify(&owned));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(answer)) => {
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(context.clone(), answer.clone());
                Ok(answer)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if !self.stalled.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Classifier timed out, skipping it for the rest of the run"
                    );
                }
                Err(ClassifierError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingClassifier {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Classifier for CountingClassifier {
        fn classify(&self, context: &ClassifierContext) -> Result<Option<String>, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(context.values().next().map(|v| v.to_uppercase()))
        }
    }

    fn context(value: &str) -> ClassifierContext {
        let mut context = ClassifierContext::new();
        context.insert("payPlanType".to_string(), value.to_string());
        context
    }

    #[test]
    fn test_keyword_classifier() {
        let classifier = KeywordClassifier::parse("blue cross=group; va=government").unwrap();
        assert_eq!(
            classifier.classify(&context("Blue Cross PPO")).unwrap().as_deref(),
            Some("group")
        );
        assert_eq!(classifier.classify(&context("Aetna")).unwrap(), None);
        assert!(KeywordClassifier::parse("nokeyword").is_err());
    }

    /// Test that repeated contexts are answered from the cache.
    /// Expected: the inner classifier runs once for two identical requests.
    #[test]
    fn test_bounded_classifier_memoizes() {
        let inner = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
        });
        let bounded = BoundedClassifier::new(inner.clone(), Duration::from_secs(5));
        assert_eq!(bounded.classify(&context("hmo")).unwrap().as_deref(), Some("HMO"));
        assert_eq!(bounded.classify(&context("hmo")).unwrap().as_deref(), Some("HMO"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    /// Test that a slow classifier is abandoned once the bound elapses.
    /// Expected: a Timeout error, which callers treat as "use the default".
    #[test]
    fn test_bounded_classifier_times_out() {
        let inner = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
        });
        let bounded = BoundedClassifier::new(inner, Duration::from_millis(20));
        assert!(matches!(
            bounded.classify(&context("slow")),
            Err(ClassifierError::Timeout(_))
        ));
    }

    /// Test repeated requests against a hung classifier.
    /// Expected: only the first request reaches it; the rest time out at once.
    #[test]
    fn test_stalled_classifier_not_called_again() {
        let inner = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(2),
        });
        let bounded = BoundedClassifier::new(inner.clone(), Duration::from_millis(10));
        for i in 0..50 {
            let value = if i % 2 == 0 { "hung" } else { "other" };
            assert!(matches!(
                bounded.classify(&context(value)),
                Err(ClassifierError::Timeout(_))
            ));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
