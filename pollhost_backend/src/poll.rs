use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub label: String,
    pub text: String,
    #[serde(default)]
    pub voters: Vec<String>,
}

impl PollOption {
    /// Length of the voters list. A voter listed twice counts twice.
    pub fn vote_count(&self) -> usize {
        self.voters.len()
    }
}

/// The poll document as read from the poll store. Options are keyed by label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub question: String,
    #[serde(default)]
    pub options: BTreeMap<String, PollOption>,
}

impl PollSnapshot {
    /// Question line followed by one `label - text: N votes` line per option,
    /// ordered by option key.
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        let _ = writeln!(summary, "Question: {}", self.question);
        for option in self.options.values() {
            let _ = writeln!(
                summary,
                "{} - {}: {} votes",
                option.label,
                option.text,
                option.vote_count()
            );
        }
        summary
    }

    pub fn total_votes(&self) -> usize {
        self.options.values().map(PollOption::vote_count).sum()
    }
}

/// Shared conversation summary derived from a rendered poll summary.
pub fn conversation_summary(poll_summary: &str) -> String {
    format!("Current poll status:\n{}", poll_summary)
}
