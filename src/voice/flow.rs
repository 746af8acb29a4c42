//! Qualification call flow.
//!
//! `GREETING → Q1 … Q5 → CLOSING → hangup`. The flow keeps no state of its
//! own: the current question and retry count travel in the callback URLs.

use std::fmt;

use super::twiml::{Gather, TwimlResponse};

/// Seconds the provider listens for speech before falling through.
pub const LISTEN_TIMEOUT_SECS: u32 = 5;

/// Re-prompts allowed per question before an empty answer is recorded.
pub const MAX_RETRIES: u32 = 1;

const LANGUAGE: &str = "en-US";

const FALLBACK_TEXT: &str =
    "We're experiencing technical difficulties. Please call us back at your convenience.";
const UNKNOWN_QUESTION_TEXT: &str = "Thank you for your time.";
const CLOSING_TEXT: &str = "Thank you for answering my questions. \
    You'll receive a text message shortly with a link to schedule a tour. \
    We look forward to meeting you!";
const REPROMPT_TEXT: &str = "I didn't catch that. Let me ask again.";
const SKIP_TEXT: &str = "I'll skip that question for now.";

/// One of the five qualification questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Question {
    YearsInBusiness,
    Employees,
    HasClients,
    Budget,
    OfficePreference,
}

impl Question {
    pub const ALL: [Question; 5] = [
        Self::YearsInBusiness,
        Self::Employees,
        Self::HasClients,
        Self::Budget,
        Self::OfficePreference,
    ];

    pub fn first() -> Self {
        Self::YearsInBusiness
    }

    /// Wire id used in URLs and answer field names.
    pub fn id(&self) -> &'static str {
        match self {
            Self::YearsInBusiness => "q1",
            Self::Employees => "q2",
            Self::HasClients => "q3",
            Self::Budget => "q4",
            Self::OfficePreference => "q5",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.id() == id)
    }

    pub fn prompt(&self) -> &'static str {
        match self {
            Self::YearsInBusiness => "How many years have you been in business?",
            Self::Employees => "How many employees do you have?",
            Self::HasClients => "Do you currently have clients?",
            Self::Budget => "What is your monthly budget for office space?",
            Self::OfficePreference => {
                "Do you want a private office or are you interested in coworking?"
            }
        }
    }

    /// The following question, or `None` after the last one.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::YearsInBusiness => Some(Self::Employees),
            Self::Employees => Some(Self::HasClients),
            Self::HasClients => Some(Self::Budget),
            Self::Budget => Some(Self::OfficePreference),
            Self::OfficePreference => None,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// What an answer callback amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// Speech was recognised; store it and move on.
    Answered(String),
    /// Nothing heard yet; ask again with this retry count.
    Retry(u32),
    /// Retries exhausted or skip requested; store an empty answer and move on.
    Skipped,
}

impl Capture {
    /// Classify an answer callback from its speech result and query flags.
    pub fn classify(speech: Option<&str>, retry: u32, skip: bool) -> Self {
        let text = speech.map(str::trim).unwrap_or_default();
        if !text.is_empty() {
            return Self::Answered(text.to_string());
        }
        if skip || retry >= MAX_RETRIES {
            Self::Skipped
        } else {
            Self::Retry(retry + 1)
        }
    }

    /// Text to persist, if the flow should advance.
    pub fn stored_text(&self) -> Option<&str> {
        match self {
            Self::Answered(text) => Some(text),
            Self::Skipped => Some(""),
            Self::Retry(_) => None,
        }
    }
}

/// Renders each step of the call.
#[derive(Debug, Clone)]
pub struct VoiceFlow {
    /// Base URL of the webhook gateway, no trailing slash.
    webhook_base: String,
    voice: String,
    business_name: String,
}

impl VoiceFlow {
    pub fn new(
        public_url: &str,
        voice: impl Into<String>,
        business_name: impl Into<String>,
    ) -> Self {
        Self {
            webhook_base: format!("{}/webhooks/twilio", public_url.trim_end_matches('/')),
            voice: voice.into(),
            business_name: business_name.into(),
        }
    }

    fn response(&self) -> TwimlResponse {
        TwimlResponse::new(self.voice.clone())
    }

    fn question_url(&self, question: Question, retry: u32) -> String {
        if retry == 0 {
            format!("{}/question/{}", self.webhook_base, question)
        } else {
            format!("{}/question/{}?retry={retry}", self.webhook_base, question)
        }
    }

    fn answer_url(&self, question: Question, query: &str) -> String {
        format!("{}/answer/{}?{query}", self.webhook_base, question)
    }

    /// Greeting on call-start, then on to the first question.
    pub fn greeting(&self, lead_name: &str) -> String {
        let name = match lead_name.trim() {
            "" => "there",
            name => name,
        };
        self.response()
            .say(format!(
                "Hello {name}, this is {} calling about your inquiry. \
                 I'd like to ask you a few quick questions to better understand your needs. \
                 This will only take a minute.",
                self.business_name
            ))
            .redirect(self.question_url(Question::first(), 0))
            .render()
    }

    /// Ask `question_id`. An unknown id ends the call politely.
    ///
    /// When the caller says nothing the provider falls through the gather:
    /// below the retry cap we re-ask with `retry + 1`, at the cap we post an
    /// explicit skip to the answer endpoint.
    pub fn ask(&self, question_id: &str, retry: u32) -> String {
        let Some(question) = Question::parse(question_id) else {
            return self.terminate();
        };

        let gather = Gather {
            action: self.answer_url(question, &format!("retry={retry}")),
            timeout_secs: LISTEN_TIMEOUT_SECS,
            language: LANGUAGE,
            prompt: question.prompt().to_string(),
        };
        let response = self.response().gather(gather);

        if retry < MAX_RETRIES {
            response
                .say(REPROMPT_TEXT)
                .redirect(self.question_url(question, retry + 1))
                .render()
        } else {
            response
                .say(SKIP_TEXT)
                .redirect(self.answer_url(question, "skip=true"))
                .render()
        }
    }

    /// Response to an answer callback once it has been classified.
    pub fn after_capture(&self, question: Question, capture: &Capture) -> String {
        match capture {
            Capture::Retry(retry) => self
                .response()
                .redirect(self.question_url(question, *retry))
                .render(),
            Capture::Answered(_) | Capture::Skipped => self.advance(question),
        }
    }

    /// Redirect to the next question, or close the call after the last one.
    pub fn advance(&self, question: Question) -> String {
        match question.next() {
            Some(next) => self.response().redirect(self.question_url(next, 0)).render(),
            None => self.closing(),
        }
    }

    pub fn closing(&self) -> String {
        self.response().say(CLOSING_TEXT).hangup().render()
    }

    /// Generic goodbye for an unrecognised question id.
    pub fn terminate(&self) -> String {
        self.response().say(UNKNOWN_QUESTION_TEXT).hangup().render()
    }

    /// Apology and hangup, used on state misses and unexpected errors.
    pub fn fallback(&self) -> String {
        self.response().say(FALLBACK_TEXT).hangup().render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> VoiceFlow {
        VoiceFlow::new("https://agent.test/", "Polly.Matthew-Neural", "Mesh Cowork")
    }

    #[test]
    fn question_ids_round_trip_in_order() {
        let mut q = Some(Question::first());
        let mut seen = Vec::new();
        while let Some(current) = q {
            assert_eq!(Question::parse(current.id()), Some(current));
            seen.push(current.id());
            q = current.next();
        }
        assert_eq!(seen, ["q1", "q2", "q3", "q4", "q5"]);
        assert_eq!(Question::parse("q6"), None);
    }

    #[test]
    fn greeting_names_lead_and_redirects_to_q1() {
        let xml = flow().greeting("Dana");
        assert!(xml.contains("Hello Dana, this is Mesh Cowork calling"));
        assert!(xml.contains(
            "<Redirect method=\"POST\">https://agent.test/webhooks/twilio/question/q1</Redirect>"
        ));
    }

    #[test]
    fn greeting_defaults_blank_name() {
        assert!(flow().greeting("  ").contains("Hello there,"));
    }

    #[test]
    fn first_ask_reprompts_once() {
        let xml = flow().ask("q2", 0);
        assert!(xml.contains("How many employees do you have?"));
        assert!(xml.contains("action=\"https://agent.test/webhooks/twilio/answer/q2?retry=0\""));
        assert!(xml.contains("timeout=\"5\" speechTimeout=\"auto\" language=\"en-US\""));
        assert!(xml.contains("/question/q2?retry=1</Redirect>"));
        assert!(!xml.contains("skip=true"));
    }

    #[test]
    fn retried_ask_skips_instead_of_looping() {
        let xml = flow().ask("q2", 1);
        assert!(xml.contains("answer/q2?retry=1"));
        assert!(xml.contains("I&apos;ll skip that question for now."));
        assert!(xml.contains("/answer/q2?skip=true</Redirect>"));
        assert!(!xml.contains("/question/q2?retry=2"));
    }

    #[test]
    fn unknown_question_terminates() {
        let xml = flow().ask("q9", 0);
        assert!(xml.contains("Thank you for your time."));
        assert!(xml.contains("<Hangup/>"));
        assert!(!xml.contains("<Gather"));
    }

    #[test]
    fn capture_retry_law() {
        assert_eq!(Capture::classify(None, 0, false), Capture::Retry(1));
        assert_eq!(Capture::classify(Some("   "), 0, false), Capture::Retry(1));
        assert_eq!(Capture::classify(None, 1, false), Capture::Skipped);
        assert_eq!(Capture::classify(None, 0, true), Capture::Skipped);
        assert_eq!(
            Capture::classify(Some(" five years "), 1, true),
            Capture::Answered("five years".into())
        );
    }

    #[test]
    fn stored_text_per_capture() {
        assert_eq!(Capture::Answered("yes".into()).stored_text(), Some("yes"));
        assert_eq!(Capture::Skipped.stored_text(), Some(""));
        assert_eq!(Capture::Retry(1).stored_text(), None);
    }

    #[test]
    fn after_capture_routes() {
        let f = flow();
        let retry = f.after_capture(Question::Budget, &Capture::Retry(1));
        assert!(retry.contains("/question/q4?retry=1"));

        let next = f.after_capture(Question::Budget, &Capture::Skipped);
        assert!(next.contains("/question/q5</Redirect>"));

        let coworking = Capture::Answered("coworking".into());
        let last = f.after_capture(Question::OfficePreference, &coworking);
        assert!(last.contains("schedule a tour"));
        assert!(last.ends_with("<Hangup/></Response>"));
    }

    #[test]
    fn fallback_hangs_up() {
        let xml = flow().fallback();
        assert!(xml.contains("technical difficulties"));
        assert!(xml.contains("<Hangup/>"));
    }
}
