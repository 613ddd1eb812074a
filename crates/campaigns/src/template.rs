//! Email templates and `{{placeholder}}` substitution.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_core::{DomainError, DomainResult, TemplateId};

use crate::recipient::Recipient;

const MIN_BODY_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub body: String,
    /// Placeholder names the template author declared. Informational.
    #[serde(default)]
    pub variables: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        variables: Vec<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let name = name.into().trim().to_string();
        let subject = subject.into().trim().to_string();
        let body = body.into();

        if name.is_empty() {
            return Err(DomainError::validation("template name must not be empty"));
        }
        if subject.is_empty() {
            return Err(DomainError::validation("template subject must not be empty"));
        }
        if body.trim().chars().count() < MIN_BODY_LEN {
            return Err(DomainError::validation(format!(
                "template body must be at least {MIN_BODY_LEN} characters"
            )));
        }

        Ok(Self {
            id: TemplateId::new(),
            name,
            subject,
            body,
            variables,
            is_active: true,
            created_at: now,
        })
    }

    /// Apply an edit. Fields left `None` keep their value; the result is
    /// validated with the same rules as [`Template::new`].
    pub fn update(&mut self, changes: TemplateChanges) -> DomainResult<()> {
        let mut next = self.clone();
        if let Some(name) = changes.name {
            next.name = name.trim().to_string();
        }
        if let Some(subject) = changes.subject {
            next.subject = subject.trim().to_string();
        }
        if let Some(body) = changes.body {
            next.body = body;
        }
        if let Some(variables) = changes.variables {
            next.variables = variables;
        }
        if let Some(active) = changes.is_active {
            next.is_active = active;
        }

        let checked = Template::new(
            next.name.clone(),
            next.subject.clone(),
            next.body.clone(),
            Vec::new(),
            next.created_at,
        )?;
        next.name = checked.name;
        next.subject = checked.subject;
        *self = next;
        Ok(())
    }

    /// Render subject and body for one recipient.
    ///
    /// A campaign-level subject override replaces the template subject before
    /// substitution. Values placed in the HTML body are escaped; the subject
    /// is plain text and gets them verbatim.
    pub fn render(&self, subject_override: Option<&str>, vars: &RecipientVariables) -> RenderedMessage {
        let subject = subject_override.unwrap_or(&self.subject);
        let escaped: BTreeMap<String, String> = vars
            .as_map()
            .iter()
            .map(|(k, v)| (k.clone(), escape_html(v)))
            .collect();
        RenderedMessage {
            subject: render_placeholders(subject, vars.as_map()),
            html_body: render_placeholders(&self.body, &escaped),
        }
    }
}

/// Partial edit of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TemplateChanges {
    pub name: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub variables: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

/// A rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub html_body: String,
}

/// Values available to `{{placeholders}}` for one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientVariables(BTreeMap<String, String>);

impl RecipientVariables {
    /// Build the standard variable set, falling back to friendly defaults for
    /// missing lead attributes.
    pub fn from_recipient(recipient: &Recipient) -> Self {
        fn or_default(value: &Option<String>, default: &str) -> String {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        }

        let mut vars = BTreeMap::new();
        vars.insert("first_name".into(), or_default(&recipient.first_name, "there"));
        vars.insert("last_name".into(), or_default(&recipient.last_name, ""));
        vars.insert("company".into(), or_default(&recipient.company_name, "your company"));
        vars.insert("industry".into(), or_default(&recipient.industry, "your industry"));
        vars.insert("city".into(), or_default(&recipient.city, "your location"));
        vars.insert("email".into(), recipient.email.clone());
        vars.insert("tracking_id".into(), recipient.tracking_id.to_string());
        Self(vars)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Replace every `{{key}}` (whitespace inside the braces allowed) whose key is
/// in `vars`. Unknown placeholders are left untouched.
pub fn render_placeholders(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after_open[..end].trim();
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Escape `& < > " '` for HTML text and attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
