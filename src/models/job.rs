//! Webhook job records and write-time validation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Error;

/// HTTP method a job is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            other => Err(Error::Validation(format!("unsupported method '{other}'"))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job row. Immutable after creation; edits are delete+create.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: i64,
    pub email: String,
    pub from_regex: String,
    pub url: String,
    pub method: String,
    pub headers: Option<String>,
    pub payload_template: String,
    pub response_body: String,
    pub is_active: bool,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Decode the JSON headers column. A missing or malformed column is an
    /// empty map.
    pub fn header_map(&self) -> HashMap<String, String> {
        self.headers
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// The stored method. Rows are validated at write time, so a value that
    /// no longer parses falls back to GET.
    pub fn http_method(&self) -> Method {
        self.method.parse().unwrap_or_default()
    }
}

/// Creation input for a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub email: String,
    pub from_regex: String,
    pub url: String,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub payload_template: String,
    pub response_body: String,
    pub is_active: bool,
    pub owner_id: i64,
}

impl NewJob {
    /// A job binding `email` to `url` with defaults for everything else.
    pub fn new(email: impl Into<String>, url: impl Into<String>, owner_id: i64) -> Self {
        Self {
            email: email.into(),
            from_regex: ".*".to_string(),
            url: url.into(),
            method: Method::Get,
            headers: HashMap::new(),
            payload_template: String::new(),
            response_body: String::new(),
            is_active: true,
            owner_id,
        }
    }

    /// Normalize and check every field against the configured hostname.
    /// The email is lowercased; an empty regex becomes `.*`.
    pub fn validate(&mut self, allowed_hostname: &str) -> Result<(), Error> {
        self.email = self.email.trim().to_lowercase();
        let suffix = format!("@{allowed_hostname}");
        let local = self.email.strip_suffix(&suffix).unwrap_or("");
        if local.is_empty() || local.contains('@') {
            return Err(Error::Validation(format!(
                "email must have the form <local>@{allowed_hostname}"
            )));
        }

        if self.from_regex.is_empty() {
            self.from_regex = ".*".to_string();
        }
        if let Err(e) = regex::Regex::new(&self.from_regex) {
            return Err(Error::Validation(format!("from_regex does not compile: {e}")));
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(Error::Validation("url must be absolute http or https".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert!("TRACE".parse::<Method>().is_err());
    }

    #[test]
    fn validate_lowercases_and_checks_hostname() {
        let mut job = NewJob::new("Abc@Trap.Test", "http://sink/1", 1);
        job.validate("trap.test").expect("valid job");
        assert_eq!(job.email, "abc@trap.test");

        let mut wrong_host = NewJob::new("abc@other.tld", "http://sink/1", 1);
        assert!(wrong_host.validate("trap.test").is_err());

        let mut empty_local = NewJob::new("@trap.test", "http://sink/1", 1);
        assert!(empty_local.validate("trap.test").is_err());
    }

    #[test]
    fn validate_rejects_bad_regex_and_url() {
        let mut bad_regex = NewJob::new("a@trap.test", "http://sink/1", 1);
        bad_regex.from_regex = "[unclosed".to_string();
        assert!(bad_regex.validate("trap.test").is_err());

        let mut bad_url = NewJob::new("a@trap.test", "ftp://sink/1", 1);
        assert!(bad_url.validate("trap.test").is_err());
    }

    #[test]
    fn validate_defaults_empty_regex() {
        let mut job = NewJob::new("a@trap.test", "https://sink/1", 1);
        job.from_regex = String::new();
        job.validate("trap.test").expect("valid job");
        assert_eq!(job.from_regex, ".*");
    }
}
