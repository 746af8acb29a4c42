//! Minimal TwiML writer.
//!
//! Only the verbs the call flow uses. All text and attribute values are
//! XML-escaped on the way in.

use std::fmt::Write;

/// Escape the five XML special characters.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Speech-capture request. Nested `Say` is spoken while listening.
#[derive(Debug, Clone)]
pub struct Gather {
    pub action: String,
    pub timeout_secs: u32,
    pub language: &'static str,
    pub prompt: String,
}

#[derive(Debug, Clone)]
enum Verb {
    Say(String),
    Gather(Gather),
    Redirect(String),
    Hangup,
}

/// A `<Response>` document under construction.
#[derive(Debug, Clone)]
pub struct TwimlResponse {
    voice: String,
    verbs: Vec<Verb>,
}

impl TwimlResponse {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            verbs: Vec::new(),
        }
    }

    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.verbs.push(Verb::Say(text.into()));
        self
    }

    pub fn gather(mut self, gather: Gather) -> Self {
        self.verbs.push(Verb::Gather(gather));
        self
    }

    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Redirect(url.into()));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    fn write_say(&self, out: &mut String, text: &str) {
        let _ = write!(
            out,
            "<Say voice=\"{}\">{}</Say>",
            escape(&self.voice),
            escape(text)
        );
    }

    /// Render the document.
    pub fn render(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>");
        for verb in &self.verbs {
            match verb {
                Verb::Say(text) => self.write_say(&mut out, text),
                Verb::Gather(g) => {
                    let _ = write!(
                        out,
                        "<Gather input=\"speech\" action=\"{}\" method=\"POST\" timeout=\"{}\" \
                         speechTimeout=\"auto\" language=\"{}\">",
                        escape(&g.action),
                        g.timeout_secs,
                        g.language
                    );
                    self.write_say(&mut out, &g.prompt);
                    out.push_str("</Gather>");
                }
                Verb::Redirect(url) => {
                    let _ = write!(out, "<Redirect method=\"POST\">{}</Redirect>", escape(url));
                }
                Verb::Hangup => out.push_str("<Hangup/>"),
            }
        }
        out.push_str("</Response>");
        out
    }
}
