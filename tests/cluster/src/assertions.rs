//! Assertion helpers for cluster scenarios.
//!
//! Pure functions over client snapshots: they take state as input and
//! return pass/fail with a description of what differed.

use crate::harness::Client;

/// What one client sees of a document.
#[derive(Debug, Clone, Default)]
pub struct ClientSnapshot {
    /// Client name.
    pub client: String,
    /// Text root contents.
    pub text: String,
    /// Default fragment XML.
    pub content: String,
    /// Incremental updates received.
    pub updates_received: usize,
}

impl ClientSnapshot {
    /// Snapshot a live client.
    pub fn of(client: &Client) -> Self {
        Self {
            client: client.name().to_string(),
            text: client.text(),
            content: client.content_xml(),
            updates_received: client.updates_received(),
        }
    }
}

/// Result of an assertion check.
#[derive(Debug, Clone)]
pub struct AssertionResult {
    /// Whether the assertion passed
    pub passed: bool,
    /// Description of what was checked
    pub description: String,
    /// Details on failure
    pub failure_details: Option<String>,
}

impl AssertionResult {
    /// Create a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.into(),
            failure_details: None,
        }
    }

    /// Create a failing result.
    pub fn fail(description: &str, details: &str) -> Self {
        Self {
            passed: false,
            description: description.into(),
            failure_details: Some(details.into()),
        }
    }

    /// Panic with the failure details unless the check passed.
    pub fn assert_passed(self) {
        assert!(
            self.passed,
            "{}: {}",
            self.description,
            self.failure_details.unwrap_or_default()
        );
    }
}

/// Assert that every client ended up with identical text and content.
pub fn assert_converged(snapshots: &[ClientSnapshot]) -> AssertionResult {
    let Some(reference) = snapshots.first() else {
        return AssertionResult::pass("No clients to check");
    };

    for snapshot in &snapshots[1..] {
        if snapshot.text != reference.text || snapshot.content != reference.content {
            return AssertionResult::fail(
                "Convergence",
                &format!(
                    "{} has text {:?} content {:?}, {} has text {:?} content {:?}",
                    reference.client,
                    reference.text,
                    reference.content,
                    snapshot.client,
                    snapshot.text,
                    snapshot.content
                ),
            );
        }
    }

    AssertionResult::pass(&format!("All {} clients converged", snapshots.len()))
}

/// Assert that the text contains every fragment, in any order.
///
/// Concurrent appends interleave in an order the CRDT decides, so only
/// presence is checked.
pub fn assert_contains_all(snapshot: &ClientSnapshot, fragments: &[&str]) -> AssertionResult {
    let missing: Vec<&str> = fragments
        .iter()
        .copied()
        .filter(|fragment| !snapshot.text.contains(fragment))
        .collect();
    if missing.is_empty() {
        AssertionResult::pass(&format!(
            "{} has all {} fragments",
            snapshot.client,
            fragments.len()
        ))
    } else {
        AssertionResult::fail(
            "No lost edits",
            &format!(
                "{} is missing {:?} in {:?}",
                snapshot.client, missing, snapshot.text
            ),
        )
    }
}

/// Assert that a client received exactly `expected` incremental updates.
pub fn assert_delivered_exactly(snapshot: &ClientSnapshot, expected: usize) -> AssertionResult {
    if snapshot.updates_received == expected {
        AssertionResult::pass(&format!(
            "{} received {} updates",
            snapshot.client, expected
        ))
    } else {
        AssertionResult::fail(
            "Exactly-once delivery",
            &format!(
                "{} received {} updates, expected {}",
                snapshot.client, snapshot.updates_received, expected
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(client: &str, text: &str) -> ClientSnapshot {
        ClientSnapshot {
            client: client.into(),
            text: text.into(),
            ..ClientSnapshot::default()
        }
    }

    #[test]
    fn converged_when_identical() {
        let result = assert_converged(&[snapshot("a", "xy"), snapshot("b", "xy")]);
        assert!(result.passed);
    }

    #[test]
    fn diverged_text_fails() {
        let result = assert_converged(&[snapshot("a", "xy"), snapshot("b", "yx")]);
        assert!(!result.passed);
        assert!(result.failure_details.unwrap().contains("\"yx\""));
    }

    #[test]
    fn empty_set_converges() {
        assert!(assert_converged(&[]).passed);
    }

    #[test]
    fn missing_fragment_reported() {
        let result = assert_contains_all(&snapshot("a", "hello"), &["hel", "world"]);
        assert!(!result.passed);
        assert!(result.failure_details.unwrap().contains("world"));
    }

    #[test]
    fn delivery_count_checked() {
        let mut s = snapshot("a", "");
        s.updates_received = 2;
        assert!(assert_delivered_exactly(&s, 2).passed);
        assert!(!assert_delivered_exactly(&s, 1).passed);
    }
}
