//! Record formatting templates and parameter passing.
//!
//! A template is text with `%property%` placeholders, for example
//! `%timestamp% %hostname% %tag%%msg%\n`. `%%` produces a literal percent.
//! An action renders its templates for every record and hands the result to
//! its output module in the passing convention the module expects.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::SecondsFormat;
use outflow_common::LogRecord;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the template used when an action does not configure one
pub const DEFAULT_TEMPLATE: &str = "TraditionalFormat";

const BUILTIN_TEMPLATES: [(&str, &str); 3] = [
    (DEFAULT_TEMPLATE, "%timestamp% %hostname% %tag%%msg%\n"),
    (
        "FileFormat",
        "%timestamp-rfc3339% %hostname% %tag%%msg%\n",
    ),
    (
        "ForwardFormat",
        "<%pri%>%timestamp-rfc3339% %hostname% %tag%%msg%",
    ),
];

/// How rendered templates are handed to the output module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParamPassing {
    /// One rendered string per template
    #[default]
    String,
    /// One list of rendered fields per template
    Array,
    /// The full record, templates are not rendered
    Record,
}

/// Record property a template can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Msg,
    RawMsg,
    Hostname,
    Tag,
    ProgramName,
    Timestamp,
    TimestampRfc3339,
    Severity,
    SeverityText,
    Facility,
    Pri,
}

impl Property {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "msg" => Self::Msg,
            "rawmsg" => Self::RawMsg,
            "hostname" | "source" => Self::Hostname,
            "tag" | "syslogtag" => Self::Tag,
            "programname" => Self::ProgramName,
            "timestamp" | "timereported" => Self::Timestamp,
            "timestamp-rfc3339" => Self::TimestampRfc3339,
            "severity" => Self::Severity,
            "severity-text" => Self::SeverityText,
            "facility" => Self::Facility,
            "pri" => Self::Pri,
            _ => return None,
        })
    }

    fn render(self, record: &LogRecord) -> String {
        match self {
            Self::Msg => record.message.clone(),
            Self::RawMsg => format!("{}{}", record.tag, record.message),
            Self::Hostname => record.hostname.clone(),
            Self::Tag => record.tag.clone(),
            Self::ProgramName => record
                .tag
                .split(['[', ':'])
                .next()
                .unwrap_or_default()
                .to_string(),
            Self::Timestamp => record.timestamp.format("%b %e %H:%M:%S").to_string(),
            Self::TimestampRfc3339 => record
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            Self::Severity => record.severity.code().to_string(),
            Self::SeverityText => record.severity.to_string(),
            Self::Facility => record.facility.to_string(),
            Self::Pri => record.pri().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Property(Property),
}

/// A parsed formatting template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    parts: Vec<Part>,
}

impl Template {
    /// Parse a template definition
    ///
    /// # Errors
    ///
    /// Returns an error for an unterminated placeholder or an unknown property.
    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self, ConfigError> {
        let name = name.into();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(start) = rest.find('%') {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('%').ok_or_else(|| ConfigError::InvalidSetting {
                field: "template",
                reason: format!("unterminated property in template {name}"),
            })?;

            let property = &after[..end];
            if property.is_empty() {
                literal.push('%');
            } else {
                let property =
                    Property::lookup(property).ok_or_else(|| ConfigError::InvalidSetting {
                        field: "template",
                        reason: format!("unknown property {property} in template {name}"),
                    })?;
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Property(property));
            }
            rest = &after[end + 1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self { name, parts })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the whole template into one string
    #[must_use]
    pub fn render(&self, record: &LogRecord) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Literal(text) => text.clone(),
                Part::Property(property) => property.render(record),
            })
            .collect()
    }

    /// Render only the properties, one field each
    #[must_use]
    pub fn fields(&self, record: &LogRecord) -> Vec<String> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Literal(_) => None,
                Part::Property(property) => Some(property.render(record)),
            })
            .collect()
    }
}

/// Named templates available to actions
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: AHashMap<String, Arc<Template>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    /// Create a registry holding the built-in templates
    #[must_use]
    pub fn new() -> Self {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .filter_map(|(name, source)| {
                Template::parse(*name, source)
                    .ok()
                    .map(|template| ((*name).to_string(), Arc::new(template)))
            })
            .collect();

        Self { templates }
    }

    /// Add or replace a template
    ///
    /// # Errors
    ///
    /// Returns an error if the template does not parse.
    pub fn insert(&mut self, name: &str, source: &str) -> Result<(), ConfigError> {
        let template = Template::parse(name, source)?;
        self.templates.insert(name.to_string(), Arc::new(template));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    /// Look up every named template, in order
    ///
    /// # Errors
    ///
    /// Returns an error naming the first template that does not exist.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<Template>>, ConfigError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| ConfigError::UnknownTemplate(name.clone()))
            })
            .collect()
    }
}

/// Parameters handed to an output module for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionParams {
    Strings(Vec<String>),
    Arrays(Vec<Vec<String>>),
    Record(Arc<LogRecord>),
}

impl ActionParams {
    /// Render `record` through `templates` in the given convention
    #[must_use]
    pub fn prepare(passing: ParamPassing, templates: &[Arc<Template>], record: &Arc<LogRecord>) -> Self {
        match passing {
            ParamPassing::String => Self::Strings(
                templates
                    .iter()
                    .map(|template| template.render(record))
                    .collect(),
            ),
            ParamPassing::Array => Self::Arrays(
                templates
                    .iter()
                    .map(|template| template.fields(record))
                    .collect(),
            ),
            ParamPassing::Record => Self::Record(Arc::clone(record)),
        }
    }

    /// The first rendered string, if any
    #[must_use]
    pub fn first_string(&self) -> Option<&str> {
        match self {
            Self::Strings(strings) => strings.first().map(String::as_str),
            Self::Arrays(_) | Self::Record(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use outflow_common::Severity;
    use pretty_assertions::assert_eq;

    use super::*;

    fn record() -> Arc<LogRecord> {
        let mut record = LogRecord::new("web01", "nginx[311]:", " upstream timed out");
        record.timestamp = Utc.with_ymd_and_hms(2024, 3, 7, 9, 4, 5).unwrap();
        record.severity = Severity::Warning;
        record.facility = 3;
        Arc::new(record)
    }

    #[test]
    fn test_traditional_format() {
        let registry = TemplateRegistry::new();
        let template = registry.get(DEFAULT_TEMPLATE).unwrap();
        assert_eq!(
            template.render(&record()),
            "Mar  7 09:04:05 web01 nginx[311]: upstream timed out\n"
        );
    }

    #[test]
    fn test_forward_format() {
        let registry = TemplateRegistry::new();
        let template = registry.get("ForwardFormat").unwrap();
        assert_eq!(
            template.render(&record()),
            "<28>2024-03-07T09:04:05.000000Z web01 nginx[311]: upstream timed out"
        );
    }

    #[test]
    fn test_literal_percent_and_programname() {
        let template = Template::parse("t", "100%% %programname%/%severity-text%").unwrap();
        assert_eq!(template.render(&record()), "100% nginx/warning");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Template::parse("t", "%msg"),
            Err(ConfigError::InvalidSetting { field: "template", .. })
        ));
        assert!(matches!(
            Template::parse("t", "%nonsense%"),
            Err(ConfigError::InvalidSetting { field: "template", .. })
        ));
    }

    #[test]
    fn test_resolve_unknown_template() {
        let registry = TemplateRegistry::new();
        assert_eq!(
            registry.resolve(&["missing".to_string()]),
            Err(ConfigError::UnknownTemplate("missing".to_string()))
        );
    }

    #[test]
    fn test_param_passing_conventions() {
        let mut registry = TemplateRegistry::new();
        registry.insert("pair", "%hostname% said %msg%").unwrap();
        let templates = registry.resolve(&["pair".to_string()]).unwrap();
        let record = record();

        assert_eq!(
            ActionParams::prepare(ParamPassing::String, &templates, &record),
            ActionParams::Strings(vec!["web01 said  upstream timed out".to_string()])
        );
        assert_eq!(
            ActionParams::prepare(ParamPassing::Array, &templates, &record),
            ActionParams::Arrays(vec![vec![
                "web01".to_string(),
                " upstream timed out".to_string()
            ]])
        );
        assert_eq!(
            ActionParams::prepare(ParamPassing::Record, &templates, &record),
            ActionParams::Record(record)
        );
    }
}
