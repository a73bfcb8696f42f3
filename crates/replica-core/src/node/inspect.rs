//! Debug dump

use super::{Entry, Replicant, Result};
use crate::prediction::PredictionState;

/// Nesting shown when no depth is given
const DEFAULT_INSPECT_DEPTH: usize = 8;

impl Replicant {
    /// Human-readable dump of the subtree, `max_depth` levels deep
    ///
    /// Pending predictions are shown next to the authoritative value.
    /// Nothing is mutated and no signal fires.
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`](crate::ReplicaError::InactiveNode) if
    /// the node was destroyed
    pub fn inspect(&self, max_depth: Option<usize>) -> Result<String> {
        self.ensure_active()?;
        let mut lines = vec![format!(
            "{} {} ({})",
            self.variant(),
            self.key_path(),
            self.role()
        )];
        self.inspect_into(&mut lines, 1, max_depth.unwrap_or(DEFAULT_INSPECT_DEPTH));
        Ok(lines.join("\n"))
    }

    fn inspect_into(&self, lines: &mut Vec<String>, depth: usize, max_depth: usize) {
        let indent = "  ".repeat(depth);
        if let Ok(resolved) = self.resolve_state() {
            lines.push(format!("{indent}=> {resolved}"));
        }

        let (entries, predicted) = {
            let state = self.inner.state.lock();
            let entries: Vec<_> = state
                .slots
                .iter()
                .map(|(key, entry)| {
                    let prediction = state.overlay.state(&key);
                    (key, entry.clone(), prediction)
                })
                .collect();
            let predicted: Vec<_> = state
                .overlay
                .keys()
                .filter(|key| state.slots.get(key).is_none())
                .map(|key| (key.clone(), state.overlay.state(key)))
                .collect();
            (entries, predicted)
        };

        for (key, entry, prediction) in entries {
            let suffix = match prediction {
                PredictionState::Predicted { value, .. } => format!(" (predicted {value})"),
                PredictionState::NoOverride => String::new(),
            };
            match entry {
                Entry::Value(value) => lines.push(format!("{indent}{key} = {value}{suffix}")),
                Entry::Node(node) if depth >= max_depth => {
                    lines.push(format!("{indent}{key}: {} {{...}}{suffix}", node.variant()));
                }
                Entry::Node(node) => {
                    lines.push(format!("{indent}{key}: {}{suffix}", node.variant()));
                    node.inspect_into(lines, depth + 1, max_depth);
                }
            }
        }
        for (key, prediction) in predicted {
            if let PredictionState::Predicted { value, .. } = prediction {
                lines.push(format!("{indent}{key} = nil (predicted {value})"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Replicant, Role, Variant};

    #[test]
    fn dump_is_bounded_by_depth() {
        let root = Replicant::map(Role::Authority);
        let stats = Replicant::map(Role::Authority);
        let combat = Replicant::map(Role::Authority);
        combat.set("armor", 12).unwrap();
        stats.set("combat", &combat).unwrap();
        root.set("stats", &stats).unwrap();
        root.set("health", 100).unwrap();

        let shallow = root.inspect(Some(1)).unwrap();
        assert!(shallow.contains("stats: MapReplicant {...}"));
        assert!(!shallow.contains("armor"));

        let deep = root.inspect(None).unwrap();
        assert!(deep.contains("armor = 12"));
        assert!(deep.contains("health = 100"));
    }

    #[test]
    fn dump_shows_predictions_and_resolution() {
        let status = Replicant::new(Variant::FactoredOr, Role::Observer);
        status.predict("stunned", true).unwrap();

        let dump = status.inspect(None).unwrap();
        assert!(dump.contains("=> true"));
        assert!(dump.contains("stunned = nil (predicted true)"));
    }
}
