//! Qualification decision engine.
//!
//! Scores the five captured answers against keyword red flags:
//! - q1 years in business: brand new businesses
//! - q2 employees: solo operators
//! - q3 clients: no current clients
//! - q4 budget: no clear budget
//!
//! q5 (office preference) never raises a flag. Reaching the red-flag threshold
//! disqualifies; anything less still qualifies, with the flags as notes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::voice::Question;

/// Default number of red flags that disqualifies a lead.
pub const DEFAULT_RED_FLAG_THRESHOLD: usize = 3;

/// Outcome of a qualification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Qualified,
    Unqualified,
    NoAnswer,
    CallFailed,
    Pending,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qualified => "qualified",
            Self::Unqualified => "unqualified",
            Self::NoAnswer => "no_answer",
            Self::CallFailed => "call_failed",
            Self::Pending => "pending",
        }
    }

    pub fn is_qualified(&self) -> bool {
        matches!(self, Self::Qualified)
    }
}

/// The five answers captured during a call. `None` means never answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAnswers {
    pub q1: Option<String>,
    pub q2: Option<String>,
    pub q3: Option<String>,
    pub q4: Option<String>,
    pub q5: Option<String>,
}

impl CallAnswers {
    pub fn get(&self, question: Question) -> Option<&str> {
        match question {
            Question::YearsInBusiness => self.q1.as_deref(),
            Question::Employees => self.q2.as_deref(),
            Question::HasClients => self.q3.as_deref(),
            Question::Budget => self.q4.as_deref(),
            Question::OfficePreference => self.q5.as_deref(),
        }
    }

    pub fn set(&mut self, question: Question, text: impl Into<String>) {
        let slot = match question {
            Question::YearsInBusiness => &mut self.q1,
            Question::Employees => &mut self.q2,
            Question::HasClients => &mut self.q3,
            Question::Budget => &mut self.q4,
            Question::OfficePreference => &mut self.q5,
        };
        *slot = Some(text.into());
    }

    /// True when no question has a non-blank answer.
    pub fn is_empty(&self) -> bool {
        Question::ALL
            .iter()
            .all(|q| self.get(*q).is_none_or(|a| a.trim().is_empty()))
    }
}

/// Verdict plus the human-readable reason stored with the lead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: String,
}

/// A keyword rule for one question.
#[derive(Debug, Clone)]
struct RedFlagRule {
    question: Question,
    regex: Regex,
    reason: &'static str,
}

impl RedFlagRule {
    fn new(question: Question, keywords: &[&str], reason: &'static str) -> Self {
        let alternatives = keywords
            .iter()
            .map(|k| keyword_pattern(k))
            .collect::<Vec<_>>()
            .join("|");
        Self {
            question,
            regex: Regex::new(&format!("(?i){alternatives}")).unwrap(),
            reason,
        }
    }
}

/// Words match anywhere in the answer; numbers only when not part of a longer number.
fn keyword_pattern(keyword: &str) -> String {
    let escaped = regex::escape(keyword);
    if keyword.chars().all(|c| c.is_ascii_digit()) {
        format!(r"(?:^|\D){escaped}(?:\D|$)")
    } else {
        escaped
    }
}

/// Keyword-driven qualification scorer.
#[derive(Debug, Clone)]
pub struct QualificationEngine {
    rules: Vec<RedFlagRule>,
    threshold: usize,
}

impl QualificationEngine {
    /// Engine with the standard red-flag rules.
    pub fn new(threshold: usize) -> Self {
        let rules = vec![
            RedFlagRule::new(
                Question::YearsInBusiness,
                &["0", "zero", "new", "just started", "starting"],
                "Less than 1 year in business",
            ),
            RedFlagRule::new(
                Question::Employees,
                &["0", "zero", "none", "just me", "solo"],
                "Solo entrepreneur (no team)",
            ),
            RedFlagRule::new(
                Question::HasClients,
                &["no", "not yet", "none", "don't have"],
                "No current clients",
            ),
            RedFlagRule::new(
                Question::Budget,
                &["don't know", "not sure", "no budget", "free"],
                "No clear budget",
            ),
        ];

        Self {
            rules,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Reasons for every question whose answer trips its rule, in question order.
    pub fn red_flags(&self, answers: &CallAnswers) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|rule| {
                answers
                    .get(rule.question)
                    .map(normalize)
                    .is_some_and(|text| rule.regex.is_match(&text))
            })
            .map(|rule| rule.reason)
            .collect()
    }

    /// Decide a call. Deterministic for the same inputs.
    pub fn decide(&self, answers: &CallAnswers, call_status: &str) -> Decision {
        if call_status != "completed" {
            return Decision {
                verdict: Verdict::NoAnswer,
                reason: format!("Call status: {call_status}"),
            };
        }

        if answers.is_empty() {
            return Decision {
                verdict: Verdict::NoAnswer,
                reason: "No answers recorded".to_string(),
            };
        }

        let flags = self.red_flags(answers);
        debug!(flags = flags.len(), threshold = self.threshold, "Scored answers");

        if flags.len() >= self.threshold {
            Decision {
                verdict: Verdict::Unqualified,
                reason: flags.join("; "),
            }
        } else if !flags.is_empty() {
            Decision {
                verdict: Verdict::Qualified,
                reason: format!("Qualified with notes: {}", flags.join("; ")),
            }
        } else {
            Decision {
                verdict: Verdict::Qualified,
                reason: "Strong fit - established business with team and clients".to_string(),
            }
        }
    }
}

impl Default for QualificationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_RED_FLAG_THRESHOLD)
    }
}

/// Speech transcripts often carry typographic apostrophes.
fn normalize(text: &str) -> String {
    text.replace(['\u{2019}', '\u{2018}'], "'")
}
