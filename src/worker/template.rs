//! Payload templates: literal text with `{{.From}}`, `{{.To}}`,
//! `{{.Subject}}` and `{{.Body}}` variables. No control flow.

use crate::error::Error;

/// The variable bag available to payload templates.
#[derive(Debug, Clone, Copy)]
pub struct Vars<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
}

/// Render `template` against `vars`. Unknown variables and an
/// unterminated `{{` are validation errors.
pub fn render(template: &str, vars: &Vars<'_>) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Validation("unterminated {{ in payload template".into()))?;
        let value = match after[..end].trim() {
            ".From" => vars.from,
            ".To" => vars.to,
            ".Subject" => vars.subject,
            ".Body" => vars.body,
            other => {
                return Err(Error::Validation(format!("bad template variable '{other}'")));
            }
        };
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
