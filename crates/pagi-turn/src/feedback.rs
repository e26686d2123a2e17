//! Post-run transcript evaluation.
//!
//! Keyword heuristics over the final conversation, for a quick sanity check of
//! a support-style dialogue. Has no bearing on the turn pipeline.

use crate::history::{Role, Turn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static GREETING: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\bhello|hi|good\s+(morning|afternoon|evening)\b").ok());
static VERIFICATION: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)name|verify|security|dob|date of birth|account").ok());
static EMPATHY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)sorry|understand|i can imagine|that sounds").ok());
static RESOLUTION: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)let's|we can|i will|steps|block|reissue|unlock|transfer").ok()
});

fn found(pattern: &Lazy<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(text))
}

/// Outcome of each check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedbackReport {
    pub greeting: bool,
    pub verification: bool,
    pub empathy: bool,
    pub resolution: bool,
}

/// Score a finished conversation.
///
/// The greeting check only looks at the first two user turns; the others scan
/// every assistant turn.
pub fn evaluate<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> FeedbackReport {
    let mut user_turns = 0;
    let mut report = FeedbackReport::default();
    for turn in turns {
        match turn.role {
            Role::User => {
                if user_turns < 2 && found(&GREETING, &turn.text) {
                    report.greeting = true;
                }
                user_turns += 1;
            }
            Role::Assistant => {
                report.verification |= found(&VERIFICATION, &turn.text);
                report.empathy |= found(&EMPATHY, &turn.text);
                report.resolution |= found(&RESOLUTION, &turn.text);
            }
            Role::System => {}
        }
    }
    report
}

impl FeedbackReport {
    fn checks(&self) -> [(bool, &'static str, &'static str); 4] {
        [
            (self.greeting, "Greeting present", "Missing greeting"),
            (self.verification, "Verification asked", "Verification missing"),
            (self.empathy, "Empathy detected", "Empathy missing"),
            (self.resolution, "Resolution provided", "Resolution unclear"),
        ]
    }
}

impl fmt::Display for FeedbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Post-run evaluation:")?;
        for (ok, positive, _) in self.checks() {
            if ok {
                write!(f, "\n✅ {}", positive)?;
            }
        }
        for (ok, _, negative) in self.checks() {
            if !ok {
                write!(f, "\n⚠️ {}", negative)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, text: &str) -> Turn {
        Turn::new(role, text)
    }

    #[test]
    fn support_call_scores_all_checks() {
        let turns = vec![
            turn(Role::User, "Hello, I lost my card"),
            turn(Role::Assistant, "I'm sorry to hear that. Can you confirm your name?"),
            turn(Role::User, "Jamie Doe"),
            turn(Role::Assistant, "Thanks. I will block the card and reissue a new one."),
        ];
        let report = evaluate(&turns);
        assert_eq!(
            report,
            FeedbackReport {
                greeting: true,
                verification: true,
                empathy: true,
                resolution: true
            }
        );
        assert!(!report.to_string().contains("⚠️"));
    }

    #[test]
    fn greeting_only_counts_in_first_two_user_turns() {
        let turns = vec![
            turn(Role::User, "my card"),
            turn(Role::User, "is gone"),
            turn(Role::User, "hello?"),
        ];
        assert!(!evaluate(&turns).greeting);
    }

    #[test]
    fn report_lists_positives_then_negatives() {
        let report = FeedbackReport {
            empathy: true,
            ..Default::default()
        };
        let text = report.to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "Post-run evaluation:");
        assert_eq!(lines[1], "✅ Empathy detected");
        assert_eq!(lines[2], "⚠️ Missing greeting");
        assert_eq!(lines.len(), 5);
    }
}
