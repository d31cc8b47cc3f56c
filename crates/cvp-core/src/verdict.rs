//! Inspection requests and verdicts.
//!
//! A peer describes the content it is about to upload with `RequestParams`.
//! Once the whole payload is staged, a `VerdictPolicy` turns the request
//! into a `Verdict`, which is sent once, before any content flows back.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What the server may do with the inspected content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Inspect only; content must come back untouched.
    #[default]
    ReadOnly,
    /// Inspect and, if needed, rewrite the content.
    ReadWrite,
    None,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::ReadOnly => "CVP_RDONLY",
            Action::ReadWrite => "CVP_RDWR",
            Action::None => "CVP_NONE",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Unspecified,
    Binary,
    Text,
    Compound,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentType::Unspecified => "CVP_UNSPECIFIED_CONTENT",
            ContentType::Binary => "CVP_BIN_CONTENT",
            ContentType::Text => "CVP_TEXT_CONTENT",
            ContentType::Compound => "CVP_COMPOUND_CONTENT",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Smtp,
    Ftp,
    #[default]
    Unknown,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "HTTP",
            Protocol::Smtp => "SMTP",
            Protocol::Ftp => "FTP",
            Protocol::Unknown => "unknown",
        })
    }
}

/// Parameters a peer sends before streaming content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestParams {
    /// Advisory file name supplied by the peer.
    pub filename: Option<String>,
    pub content_type: ContentType,
    pub protocol: Protocol,
    /// Protocol command that carried the content (e.g. `GET`, `RETR`).
    pub command: Option<String>,
    pub action: Action,
}

impl RequestParams {
    pub fn filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("unknown")
    }

    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or("unknown")
    }
}

/// Verdict bits as reported to the peer.
pub mod flags {
    pub const CONTENT_SAFE: u32 = 0x01;
    pub const CONTENT_UNSAFE: u32 = 0x02;
    pub const ORIGINAL_CONTENT_UNSAFE: u32 = 0x04;
    pub const CONTENT_MODIFIED: u32 = 0x08;
    pub const CONTENT_NOT_MODIFIED: u32 = 0x10;
}

/// The server's opinion of the inspected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opinion {
    /// Clean, returned as received.
    Safe,
    /// Infected, returned as received because rewriting was not allowed.
    Unsafe,
    /// Infected originally, cleaned before being returned.
    Fixed,
}

impl Opinion {
    pub fn flags(self) -> u32 {
        use flags::*;
        match self {
            Opinion::Safe => CONTENT_SAFE | CONTENT_NOT_MODIFIED,
            Opinion::Unsafe => CONTENT_UNSAFE | CONTENT_NOT_MODIFIED,
            Opinion::Fixed => CONTENT_SAFE | ORIGINAL_CONTENT_UNSAFE | CONTENT_MODIFIED,
        }
    }
}

/// Decision sent to the peer ahead of the returned content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub opinion: Opinion,
    /// Log line explaining the decision.
    pub explanation: String,
    /// Short warning text for the end user.
    pub warning: String,
}

impl Verdict {
    pub fn flags(&self) -> u32 {
        self.opinion.flags()
    }
}

/// Pluggable decision logic, consulted once per session.
pub trait VerdictPolicy: Send + Sync {
    fn judge(&self, request: &RequestParams) -> Verdict;
}

/// Stand-in inspection: a file whose name starts with a configured prefix
/// is treated as infected.
#[derive(Debug, Clone)]
pub struct FilenamePrefixPolicy {
    prefix: String,
}

pub const DEFAULT_INFECTED_PREFIX: &str = "virus";

impl Default for FilenamePrefixPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INFECTED_PREFIX)
    }
}

impl FilenamePrefixPolicy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl VerdictPolicy for FilenamePrefixPolicy {
    fn judge(&self, request: &RequestParams) -> Verdict {
        let filename = request.filename();

        if !filename.starts_with(&self.prefix) {
            let explanation = match filename.chars().next() {
                Some(c) => format!("files beginning with '{c}' are known to be safe"),
                None => "files with empty names are known to be safe".to_string(),
            };
            return Verdict {
                opinion: Opinion::Safe,
                explanation,
                warning: "file was scanned and found safe".into(),
            };
        }

        if request.action != Action::ReadWrite {
            return Verdict {
                opinion: Opinion::Unsafe,
                explanation: "Found virus. CVP server is not allowed to modify content.".into(),
                warning: "file was scanned and found infected".into(),
            };
        }

        // Cleaning is not implemented; the staged bytes stream back as-is.
        Verdict {
            opinion: Opinion::Fixed,
            explanation: "CVP server fixed infected file".into(),
            warning: "file was scanned and fixed".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(filename: &str, action: Action) -> RequestParams {
        RequestParams {
            filename: Some(filename.into()),
            action,
            ..Default::default()
        }
    }

    #[test]
    fn clean_file_is_safe_and_unmodified() {
        let verdict = FilenamePrefixPolicy::default().judge(&request("report.pdf", Action::ReadOnly));
        assert_eq!(verdict.opinion, Opinion::Safe);
        assert_eq!(
            verdict.flags(),
            flags::CONTENT_SAFE | flags::CONTENT_NOT_MODIFIED
        );
        assert_eq!(
            verdict.explanation,
            "files beginning with 'r' are known to be safe"
        );
    }

    #[test]
    fn infected_file_without_write_access_is_unsafe() {
        let verdict = FilenamePrefixPolicy::default().judge(&request("virus.exe", Action::ReadOnly));
        assert_eq!(verdict.opinion, Opinion::Unsafe);
        assert_eq!(verdict.warning, "file was scanned and found infected");
        assert_eq!(
            verdict.flags() & flags::CONTENT_NOT_MODIFIED,
            flags::CONTENT_NOT_MODIFIED
        );
    }

    #[test]
    fn infected_file_with_write_access_is_fixed() {
        let verdict = FilenamePrefixPolicy::default().judge(&request("virus.exe", Action::ReadWrite));
        assert_eq!(verdict.opinion, Opinion::Fixed);
        assert_eq!(
            verdict.flags(),
            flags::CONTENT_SAFE | flags::ORIGINAL_CONTENT_UNSAFE | flags::CONTENT_MODIFIED
        );
    }

    #[test]
    fn missing_filename_is_judged_as_unknown() {
        let params = RequestParams::default();
        assert_eq!(params.filename(), "unknown");
        let verdict = FilenamePrefixPolicy::default().judge(&params);
        assert_eq!(verdict.opinion, Opinion::Safe);
        assert!(verdict.explanation.contains("'u'"));
    }

    #[test]
    fn custom_prefix_is_honoured() {
        let policy = FilenamePrefixPolicy::new("eicar");
        assert_eq!(
            policy.judge(&request("eicar.com", Action::None)).opinion,
            Opinion::Unsafe
        );
        assert_eq!(
            policy.judge(&request("virus.exe", Action::None)).opinion,
            Opinion::Safe
        );
    }

    #[test]
    fn request_params_parse_with_defaults() {
        let params: RequestParams =
            serde_json::from_str(r#"{"filename":"a.txt","action":"readwrite"}"#).unwrap();
        assert_eq!(params.action, Action::ReadWrite);
        assert_eq!(params.protocol, Protocol::Unknown);
        assert_eq!(params.command(), "unknown");
    }

    #[test]
    fn request_parameter_names_match_log_format() {
        assert_eq!(Action::ReadWrite.to_string(), "CVP_RDWR");
        assert_eq!(ContentType::Text.to_string(), "CVP_TEXT_CONTENT");
        assert_eq!(Protocol::Smtp.to_string(), "SMTP");
    }
}
