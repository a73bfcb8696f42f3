//! Prediction overlay
//!
//! Speculative local writes live in a layer above the authoritative slots.
//! Reads consult the overlay first, so a predicted value always wins until
//! the matching authoritative write reconciles it away.
//!
//! ```text
//! NoOverride --predict--> Predicted --authoritative write/merge--> (cleared)
//!                             |
//!                             +--predict again--> Predicted (latest wins)
//! ```

use indexmap::IndexMap;
use replica_value::{Key, Value};

/// Observable prediction state of one key
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionState {
    /// Reads return the authoritative value
    NoOverride,
    /// Reads return `value` until the authority answers
    Predicted {
        /// Speculative value
        value: Value,
        /// Authoritative value when the first pending prediction was made
        authoritative: Value,
    },
}

impl PredictionState {
    /// Whether a prediction is pending
    #[inline]
    #[must_use]
    pub fn is_predicted(&self) -> bool {
        matches!(self, Self::Predicted { .. })
    }
}

#[derive(Debug, Clone)]
struct Prediction {
    value: Value,
    authoritative: Value,
}

/// Pending predictions of one node, in first-predicted order
#[derive(Debug, Clone, Default)]
pub(crate) struct PredictionOverlay {
    entries: IndexMap<Key, Prediction>,
}

impl PredictionOverlay {
    /// Record a prediction; returns `true` if it overrode a pending one
    ///
    /// An override keeps the authoritative value captured by the first
    /// prediction, since the authority has not answered in between.
    pub(crate) fn predict(&mut self, key: Key, value: Value, authoritative: Value) -> bool {
        match self.entries.get_mut(&key) {
            Some(pending) => {
                pending.value = value;
                true
            }
            None => {
                self.entries.insert(key, Prediction { value, authoritative });
                false
            }
        }
    }

    /// Drop the prediction for `key`; returns `true` if one was pending
    pub(crate) fn reconcile(&mut self, key: &Key) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Drop every prediction, returning the keys that had one
    pub(crate) fn clear(&mut self) -> Vec<Key> {
        self.entries.drain(..).map(|(key, _)| key).collect()
    }

    pub(crate) fn value(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key).map(|p| &p.value)
    }

    pub(crate) fn state(&self, key: &Key) -> PredictionState {
        match self.entries.get(key) {
            Some(p) => PredictionState::Predicted {
                value: p.value.clone(),
                authoritative: p.authoritative.clone(),
            },
            None => PredictionState::NoOverride,
        }
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_prediction_wins_and_keeps_first_base() {
        let mut overlay = PredictionOverlay::default();
        assert!(!overlay.predict(Key::from("hp"), Value::from(90), Value::from(100)));
        assert!(overlay.predict(Key::from("hp"), Value::from(70), Value::from(90)));

        assert_eq!(overlay.value(&Key::from("hp")), Some(&Value::from(70)));
        assert_eq!(
            overlay.state(&Key::from("hp")),
            PredictionState::Predicted {
                value: Value::from(70),
                authoritative: Value::from(100),
            }
        );
    }

    #[test]
    fn reconcile_clears_only_that_key() {
        let mut overlay = PredictionOverlay::default();
        overlay.predict(Key::from("a"), Value::from(1), Value::Nil);
        overlay.predict(Key::from("b"), Value::from(2), Value::Nil);

        assert!(overlay.reconcile(&Key::from("a")));
        assert!(!overlay.reconcile(&Key::from("a")));
        assert_eq!(overlay.state(&Key::from("a")), PredictionState::NoOverride);
        assert!(overlay.state(&Key::from("b")).is_predicted());
    }

    #[test]
    fn clear_reports_keys_in_prediction_order() {
        let mut overlay = PredictionOverlay::default();
        overlay.predict(Key::from("z"), Value::from(1), Value::Nil);
        overlay.predict(Key::from("a"), Value::from(2), Value::Nil);

        assert_eq!(overlay.clear(), vec![Key::from("z"), Key::from("a")]);
        assert!(overlay.is_empty());
    }
}
