//! Message model: requests circulated for a vote and the bundles that close them.
//!
//! Both travel by email as a marker-delimited block of `# KEY: value` lines so
//! they survive being quoted in replies.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::crypto::canonical_json;
use crate::model::{BundleRecord, RequestRecord};

const KIND_REQUEST: &str = "REQUEST";
const KIND_BUNDLE: &str = "BUNDLE";

const FIELD_ID: &str = "REQUEST ID";
const FIELD_CONTENTS: &str = "REQUEST CONTENTS";
const FIELD_ACTION: &str = "ACTION REQUESTED";
const FIELD_DATE: &str = "REQUEST DATE";
const FIELD_RECIPIENTS: &str = "RECIPIENTS";
const FIELD_RESPONSES: &str = "RESPONSES";
const FIELD_VERDICT: &str = "VERDICT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("no {0} block found in message")]
    MissingBlock(&'static str),

    #[error("{0} block is not terminated")]
    Unterminated(&'static str),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("unknown vote code `{0}`")]
    BadVote(String),

    #[error("unknown verdict `{0}`")]
    BadVerdict(String),
}

/// A decision opened for voting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub message: String,
    pub action: String,
    /// `DD Mon YYYY`, the form the mail transport reads out of `Date:` headers.
    pub date: String,
}

impl Request {
    /// Create a request with a freshly minted id, dated today (UTC).
    pub fn new(message: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: mint_request_id(),
            message: message.into(),
            action: action.into(),
            date: today(),
        }
    }

    /// Render the block that gets pasted into the circulation email.
    pub fn format_as_email(&self) -> String {
        let mut out = start_marker(KIND_REQUEST);
        push_request_fields(&mut out, self);
        out.push_str(&end_marker(KIND_REQUEST));
        out
    }

    pub fn parse_from_email(text: &str) -> Result<Self, MessageError> {
        let fields = block_fields(text, KIND_REQUEST)?;
        request_from_fields(&fields)
    }
}

impl RequestRecord for Request {
    fn id(&self) -> &str {
        &self.id
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn action(&self) -> &str {
        &self.action
    }

    fn date(&self) -> &str {
        &self.date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Approve,
    Reject,
}

impl Vote {
    fn code(self) -> &'static str {
        match self {
            Vote::Approve => "Y",
            Vote::Reject => "N",
        }
    }

    fn from_code(code: &str) -> Result<Self, MessageError> {
        match code {
            "Y" | "y" => Ok(Vote::Approve),
            "N" | "n" => Ok(Vote::Reject),
            other => Err(MessageError::BadVote(other.to_string())),
        }
    }
}

/// One recipient's reply to a circulated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub sender: String,
    pub vote: Vote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Accepted,
    Rejected,
    Pending,
}

impl Verdict {
    /// Decide the outcome of a vote.
    ///
    /// Any rejection from a recipient rejects the request; acceptance needs an
    /// approval from every recipient. Replies from non-recipients are ignored
    /// and a recipient's last reply counts.
    pub fn tally(recipients: &[String], responses: &[Response]) -> Self {
        if recipients.is_empty() {
            return Verdict::Pending;
        }

        let mut latest: HashMap<String, Vote> = HashMap::new();
        for response in responses {
            let sender = response.sender.to_ascii_lowercase();
            if recipients.iter().any(|r| r.eq_ignore_ascii_case(&sender)) {
                latest.insert(sender, response.vote);
            }
        }

        if latest.values().any(|v| *v == Vote::Reject) {
            return Verdict::Rejected;
        }
        let all_approved = recipients
            .iter()
            .all(|r| latest.get(&r.to_ascii_lowercase()) == Some(&Vote::Approve));
        if all_approved {
            Verdict::Accepted
        } else {
            Verdict::Pending
        }
    }

    pub fn is_final(self) -> bool {
        self != Verdict::Pending
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "ACCEPTED",
            Verdict::Rejected => "REJECTED",
            Verdict::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

impl FromStr for Verdict {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPTED" => Ok(Verdict::Accepted),
            "REJECTED" => Ok(Verdict::Rejected),
            "PENDING" => Ok(Verdict::Pending),
            _ => Err(MessageError::BadVerdict(s.trim().to_string())),
        }
    }
}

/// A request together with everything collected while it was out for a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub request: Request,
    pub recipients: Vec<String>,
    pub responses: Vec<Response>,
    pub verdict: Verdict,
}

impl Bundle {
    /// Bundle the collected replies, tallying the verdict from them.
    pub fn new(request: Request, recipients: Vec<String>, responses: Vec<Response>) -> Self {
        let verdict = Verdict::tally(&recipients, &responses);
        Self {
            request,
            recipients,
            responses,
            verdict,
        }
    }

    pub fn canonical_json(&self) -> serde_json::Result<String> {
        canonical_json(self)
    }

    pub fn format_as_email(&self) -> String {
        let mut out = start_marker(KIND_BUNDLE);
        push_request_fields(&mut out, &self.request);
        push_field(&mut out, FIELD_RECIPIENTS, &self.recipients.join(", "));
        let responses = self
            .responses
            .iter()
            .map(|r| format!("{} {}", r.vote.code(), r.sender))
            .collect::<Vec<_>>()
            .join(", ");
        push_field(&mut out, FIELD_RESPONSES, &responses);
        push_field(&mut out, FIELD_VERDICT, &self.verdict.to_string());
        out.push_str(&end_marker(KIND_BUNDLE));
        out
    }

    /// Parse a bundle block; the verdict is taken as written, not re-tallied.
    pub fn parse_from_email(text: &str) -> Result<Self, MessageError> {
        let fields = block_fields(text, KIND_BUNDLE)?;
        let request = request_from_fields(&fields)?;
        let recipients = extract_addresses(required(&fields, FIELD_RECIPIENTS)?);

        let mut responses = Vec::new();
        for item in required(&fields, FIELD_RESPONSES)?.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (code, sender) = item
                .split_once(char::is_whitespace)
                .ok_or_else(|| MessageError::BadVote(item.to_string()))?;
            responses.push(Response {
                sender: sender.trim().to_string(),
                vote: Vote::from_code(code)?,
            });
        }

        let verdict: Verdict = required(&fields, FIELD_VERDICT)?.parse()?;
        Ok(Self {
            request,
            recipients,
            responses,
            verdict,
        })
    }
}

impl BundleRecord for Bundle {
    type Request = Request;

    fn request(&self) -> &Request {
        &self.request
    }

    fn canonical_json(&self) -> serde_json::Result<String> {
        Bundle::canonical_json(self)
    }
}

/// Pull every email address out of a raw `To:`/`Cc:` style header, keeping the
/// first occurrence of each (case-insensitive) in order.
pub fn extract_addresses(header: &str) -> Vec<String> {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    let email = EMAIL.get_or_init(|| {
        Regex::new(r"[\w.]+@[\w.]+\.\w+").expect("email pattern is valid")
    });

    let mut out: Vec<String> = Vec::new();
    for m in email.find_iter(header) {
        let addr = m.as_str();
        if !out.iter().any(|a| a.eq_ignore_ascii_case(addr)) {
            out.push(addr.to_string());
        }
    }
    out
}

fn mint_request_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn today() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(format_description!("[day] [month repr:short] [year]"))
        .unwrap_or_else(|_| now.date().to_string())
}

fn start_marker(kind: &str) -> String {
    format!("# ---------- START BLOCKCHAIN {kind} ---------- #\n")
}

fn end_marker(kind: &str) -> String {
    format!("# ---------- END BLOCKCHAIN {kind} ---------- #\n")
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(&format!("# {key}: {value}\n"));
}

fn push_request_fields(out: &mut String, request: &Request) {
    push_field(out, FIELD_ID, &request.id);
    push_field(out, FIELD_CONTENTS, &request.message);
    push_field(out, FIELD_ACTION, &request.action);
    push_field(out, FIELD_DATE, &request.date);
}

/// Strip reply quoting (`> > `) and surrounding whitespace.
fn unquote(line: &str) -> &str {
    let mut line = line.trim();
    while let Some(rest) = line.strip_prefix('>') {
        line = rest.trim_start();
    }
    line
}

fn block_fields(text: &str, kind: &'static str) -> Result<HashMap<String, String>, MessageError> {
    let start = start_marker(kind);
    let end = end_marker(kind);
    let mut lines = text.lines().map(unquote);

    if !lines.any(|l| l == start.trim_end()) {
        return Err(MessageError::MissingBlock(kind));
    }

    let mut fields = HashMap::new();
    for line in lines {
        if line == end.trim_end() {
            return Ok(fields);
        }
        let Some(body) = line.strip_prefix('#') else {
            continue;
        };
        if let Some((key, value)) = body.split_once(':') {
            fields
                .entry(key.trim().to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }
    Err(MessageError::Unterminated(kind))
}

fn required<'a>(
    fields: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, MessageError> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or(MessageError::MissingField(key))
}

fn request_from_fields(fields: &HashMap<String, String>) -> Result<Request, MessageError> {
    Ok(Request {
        id: required(fields, FIELD_ID)?.to_string(),
        message: required(fields, FIELD_CONTENTS)?.to_string(),
        action: required(fields, FIELD_ACTION)?.to_string(),
        date: required(fields, FIELD_DATE)?.to_string(),
    })
}
