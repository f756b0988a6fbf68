//! Declarative ASCII command tables.
//!
//! A [`Command`] describes one remote command of an instrument: how to build the
//! string that sets it, how to query it, and how to decode the response. A
//! [`CommandSet`] is the ordered table of a device's commands, loaded from a YAML
//! document with a `device` block and a `commands` list:
//!
//! ```yaml
//! device:
//!   name: "Syringe pump"
//! commands:
//!   - cmd: "SP"
//!     name: "speed"
//!     set_regex: 'SP(\d+)'
//!     set_conv: int
//!     set_range: [10, 20]
//!     query_cmd: "SP?"
//!     resp_regex: 'SP=(\d+)'
//!     resp_conv: int
//! ```
//!
//! Patterns are anchored at both ends and tolerate trailing whitespace.

mod interface;
mod matching;
mod set;

pub use interface::{CommandInterface, Communicator, DEFAULT_MAX_QUERY_RETRY};
pub use matching::{CommandMatch, MatchKind};
pub use set::{CommandSet, DeviceInfo};

use crate::error::CommandError;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// A scalar carried by a command: a set value, a reset value or a decoded response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    /// Integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Text, sent verbatim.
    Str(String),
}

impl CommandValue {
    /// Numeric interpretation, parsing strings if needed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CommandValue::Int(i) => Some(*i as f64),
            CommandValue::Float(f) => Some(*f),
            CommandValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// The integer, for `Int` values only.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CommandValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for CommandValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandValue::Int(i) => write!(f, "{i}"),
            CommandValue::Float(x) => write!(f, "{x}"),
            CommandValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for CommandValue {
    fn from(v: i64) -> Self {
        CommandValue::Int(v)
    }
}

impl From<i32> for CommandValue {
    fn from(v: i32) -> Self {
        CommandValue::Int(i64::from(v))
    }
}

impl From<f64> for CommandValue {
    fn from(v: f64) -> Self {
        CommandValue::Float(v)
    }
}

impl From<&str> for CommandValue {
    fn from(v: &str) -> Self {
        CommandValue::Str(v.to_string())
    }
}

impl From<String> for CommandValue {
    fn from(v: String) -> Self {
        CommandValue::Str(v)
    }
}

/// Type a raw string is converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conversion {
    /// Parse as `i64`.
    Int,
    /// Parse as `f64`.
    Float,
    /// Keep the raw text.
    Str,
}

impl Conversion {
    /// Convert `raw`, trimming surrounding whitespace for numbers.
    pub fn apply(self, raw: &str) -> Result<CommandValue, CommandError> {
        let failed = |target: &str| CommandError::Conversion {
            value: raw.to_string(),
            target: target.to_string(),
        };
        match self {
            Conversion::Int => raw.trim().parse().map(CommandValue::Int).map_err(|_| failed("int")),
            Conversion::Float => raw
                .trim()
                .parse()
                .map(CommandValue::Float)
                .map_err(|_| failed("float")),
            Conversion::Str => Ok(CommandValue::Str(raw.to_string())),
        }
    }
}

fn convert(conv: Option<Conversion>, raw: &str) -> Result<CommandValue, CommandError> {
    conv.unwrap_or(Conversion::Str).apply(raw)
}

/// One entry of the `commands` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command code; unique within a set.
    pub cmd: String,
    /// Human-readable name, also accepted for lookups.
    pub name: String,
    /// Pattern of the set string. Its first group stands for the value.
    #[serde(default)]
    pub set_regex: Option<String>,
    /// Conversion for values decoded from set strings.
    #[serde(default)]
    pub set_conv: Option<Conversion>,
    /// Inclusive bounds for numeric set values.
    #[serde(default)]
    pub set_range: Option<(f64, f64)>,
    /// Labels accepted in place of raw set values.
    #[serde(default)]
    pub set_names: BTreeMap<String, CommandValue>,
    /// Value restored by `cmd_reset`.
    #[serde(default)]
    pub reset_val: Option<CommandValue>,
    /// Exact query string. Absent for set-only commands.
    #[serde(default)]
    pub query_cmd: Option<String>,
    /// Pattern whose first capture is the response value.
    #[serde(default)]
    pub resp_regex: Option<String>,
    /// Conversion applied to the response capture.
    #[serde(default)]
    pub resp_conv: Option<Conversion>,
    /// Status mask to wait on before reading the response.
    #[serde(default)]
    pub wait_flag: Option<u32>,
    /// Free-text description.
    #[serde(default)]
    pub desc: String,
    /// Where the command is documented, `ref` in command files.
    #[serde(default, rename = "ref")]
    pub reference: String,
}

/// A compiled command.
#[derive(Debug, Clone)]
pub struct Command {
    spec: CommandSpec,
    device_name: String,
    set_regex: Option<Regex>,
    query_regex: Option<Regex>,
    resp_regex: Option<Regex>,
}

// Matches the value group of a set pattern.
fn subgroup_regex() -> Option<&'static Regex> {
    static SUBGROUP: OnceLock<Option<Regex>> = OnceLock::new();
    SUBGROUP.get_or_init(|| Regex::new(r"\(.+\)").ok()).as_ref()
}

fn anchored(pattern: &str) -> Result<Regex, CommandError> {
    Regex::new(&format!(r"^(?:{pattern})\s*$")).map_err(|e| CommandError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

impl Command {
    /// Compile `spec` outside of any device.
    pub fn new(spec: CommandSpec) -> Result<Self, CommandError> {
        Self::for_device(spec, "")
    }

    /// Compile `spec` for the device named `device_name`.
    pub fn for_device(spec: CommandSpec, device_name: &str) -> Result<Self, CommandError> {
        if spec.cmd.is_empty() {
            return Err(CommandError::Spec(format!(
                "command '{}' has an empty 'cmd' code",
                spec.name
            )));
        }
        if let Some((min, max)) = spec.set_range {
            if min > max {
                return Err(CommandError::Spec(format!(
                    "command '{}': set_range [{min}, {max}] is inverted",
                    spec.cmd
                )));
            }
        }
        let set_regex = spec.set_regex.as_deref().map(anchored).transpose()?;
        let query_regex = spec
            .query_cmd
            .as_deref()
            .map(|q| anchored(&regex::escape(q)))
            .transpose()?;
        let resp_regex = spec.resp_regex.as_deref().map(anchored).transpose()?;
        Ok(Self {
            spec,
            device_name: device_name.to_string(),
            set_regex,
            query_regex,
            resp_regex,
        })
    }

    /// Command code.
    pub fn cmd(&self) -> &str {
        &self.spec.cmd
    }

    /// Command name; may be empty.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The specification the command was compiled from.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Free-text description.
    pub fn desc(&self) -> &str {
        &self.spec.desc
    }

    /// Documentation reference.
    pub fn reference(&self) -> &str {
        &self.spec.reference
    }

    /// Status mask to wait on after sending, if any.
    pub fn wait_flag(&self) -> Option<u32> {
        self.spec.wait_flag
    }

    /// Name of the device block the command was loaded from.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Place `value` into the set pattern: the parenthesised group of `set_regex` is
    /// replaced, or the value is appended to the command code when there is none.
    pub fn set_interp(&self, value: &str) -> String {
        match (&self.spec.set_regex, subgroup_regex()) {
            (Some(pattern), Some(subgroup)) => {
                subgroup.replace_all(pattern, NoExpand(value)).into_owned()
            }
            (Some(pattern), None) => pattern.clone(),
            (None, _) => format!("{}{value}", self.spec.cmd),
        }
    }

    /// Build the string that sets this command to `value`.
    ///
    /// Symbolic labels from `set_names` are resolved first; the resolved value is
    /// then checked against `set_range` (inclusive) and the built string against
    /// `set_regex`.
    pub fn cmd_set(&self, value: impl Into<CommandValue>) -> Result<String, CommandError> {
        let value = value.into();
        // Labels resolve before the range check: the bounds apply to the wire value.
        let value = self
            .spec
            .set_names
            .get(&value.to_string())
            .cloned()
            .unwrap_or(value);

        if let Some((min, max)) = self.spec.set_range {
            let numeric = value.as_f64().ok_or_else(|| CommandError::NotNumeric {
                cmd: self.spec.cmd.clone(),
                value: value.to_string(),
            })?;
            if !(min..=max).contains(&numeric) {
                return Err(CommandError::OutOfRange {
                    cmd: self.spec.cmd.clone(),
                    value: numeric,
                    min,
                    max,
                });
            }
        }

        let out = self.set_interp(&value.to_string());
        if let (Some(regex), Some(pattern)) = (&self.set_regex, &self.spec.set_regex) {
            if !regex.is_match(&out) {
                return Err(CommandError::RegexMismatch {
                    cmd: self.spec.cmd.clone(),
                    output: out,
                    pattern: pattern.clone(),
                });
            }
        }
        Ok(out)
    }

    /// The string that restores the default value.
    pub fn cmd_reset(&self) -> Result<String, CommandError> {
        let reset = self
            .spec
            .reset_val
            .as_ref()
            .ok_or_else(|| CommandError::NoReset(self.spec.cmd.clone()))?;
        Ok(format!("{}{reset}", self.spec.cmd))
    }

    /// The query string.
    pub fn cmd_query(&self) -> Result<&str, CommandError> {
        self.spec
            .query_cmd
            .as_deref()
            .ok_or_else(|| CommandError::NoQuery(self.spec.cmd.clone()))
    }

    /// Decode a query response: the first capture of `resp_regex` when it matches,
    /// else the whole response, converted with `resp_conv`.
    pub fn filter_resp(&self, resp: &str) -> Result<CommandValue, CommandError> {
        let captured = self
            .resp_regex
            .as_ref()
            .and_then(|re| re.captures(resp))
            .and_then(|caps| caps.get(1))
            .map_or(resp, |m| m.as_str());
        convert(self.spec.resp_conv, captured)
    }

    /// Classify `string` as this command's set form, query form, or neither.
    pub fn match_str(&self, string: &str) -> CommandMatch<'_> {
        if let Some(caps) = self.set_regex.as_ref().and_then(|re| re.captures(string)) {
            let value = caps.get(1).map(|m| m.as_str().to_string());
            return CommandMatch::new(self, MatchKind::Set, value);
        }
        if self
            .query_regex
            .as_ref()
            .is_some_and(|re| re.is_match(string))
        {
            return CommandMatch::new(self, MatchKind::Query, None);
        }
        CommandMatch::new(self, MatchKind::None, None)
    }

    /// `desc` and `ref` as one line, for listings.
    pub fn comment(&self) -> String {
        format!("{}, ({})", self.spec.desc, self.spec.reference)
    }

    /// Like [`comment`](Self::comment), for the query form.
    pub fn query_comment(&self) -> String {
        format!("query - {}, ({})", self.spec.desc, self.spec.reference)
    }

    pub(crate) fn set_conv(&self) -> Option<Conversion> {
        self.spec.set_conv
    }

    pub(crate) fn resp_conv(&self) -> Option<Conversion> {
        self.spec.resp_conv
    }

    pub(crate) fn resp_regex(&self) -> Option<&Regex> {
        self.resp_regex.as_ref()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}): {}, ref. {}",
            self.device_name, self.spec.cmd, self.spec.name, self.spec.desc, self.spec.reference
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speed() -> Command {
        Command::new(CommandSpec {
            cmd: "SP".into(),
            name: "speed".into(),
            set_regex: Some(r"SP(\d+)".into()),
            set_conv: Some(Conversion::Int),
            set_range: Some((10.0, 20.0)),
            query_cmd: Some("SP?".into()),
            resp_regex: Some(r"SP=(\d+)".into()),
            resp_conv: Some(Conversion::Int),
            reset_val: Some(CommandValue::Int(12)),
            ..CommandSpec::default()
        })
        .unwrap()
    }

    #[test]
    fn set_string_within_range() {
        assert_eq!(speed().cmd_set(15).unwrap(), "SP15");
        assert_eq!(speed().cmd_set(10).unwrap(), "SP10");
        assert_eq!(speed().cmd_set(20).unwrap(), "SP20");
    }

    #[test]
    fn set_value_out_of_range() {
        match speed().cmd_set(21).unwrap_err() {
            CommandError::OutOfRange { value, min, max, .. } => {
                assert_eq!((value, min, max), (21.0, 10.0, 20.0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(speed().cmd_set(9.5).is_err());
        assert!(matches!(
            speed().cmd_set("fast").unwrap_err(),
            CommandError::NotNumeric { .. }
        ));
    }

    #[test]
    fn regex_mismatch_is_reported() {
        let cmd = Command::new(CommandSpec {
            cmd: "MD".into(),
            name: "mode".into(),
            set_regex: Some(r"MD([AB])".into()),
            ..CommandSpec::default()
        })
        .unwrap();
        assert_eq!(cmd.cmd_set("A").unwrap(), "MDA");
        assert!(matches!(
            cmd.cmd_set("C").unwrap_err(),
            CommandError::RegexMismatch { .. }
        ));
    }

    #[test]
    fn set_names_resolve_labels() {
        let mut names = BTreeMap::new();
        names.insert("slow".to_string(), CommandValue::Int(11));
        let cmd = Command::new(CommandSpec {
            set_names: names,
            ..speed().spec().clone()
        })
        .unwrap();
        assert_eq!(cmd.cmd_set("slow").unwrap(), "SP11");
    }

    #[test]
    fn range_applies_to_resolved_label() {
        let mut names = BTreeMap::new();
        names.insert("turbo".to_string(), CommandValue::Int(50));
        let cmd = Command::new(CommandSpec {
            set_names: names,
            ..speed().spec().clone()
        })
        .unwrap();
        match cmd.cmd_set("turbo").unwrap_err() {
            CommandError::OutOfRange { value, .. } => assert_eq!(value, 50.0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn without_set_regex_value_is_appended() {
        let cmd = Command::new(CommandSpec {
            cmd: "GO".into(),
            name: "go".into(),
            ..CommandSpec::default()
        })
        .unwrap();
        assert_eq!(cmd.cmd_set("").unwrap(), "GO");
        assert_eq!(cmd.cmd_set(3).unwrap(), "GO3");
        assert!(matches!(cmd.cmd_reset(), Err(CommandError::NoReset(_))));
        assert!(matches!(cmd.cmd_query(), Err(CommandError::NoQuery(_))));
    }

    #[test]
    fn reset_and_query_strings() {
        assert_eq!(speed().cmd_reset().unwrap(), "SP12");
        assert_eq!(speed().cmd_query().unwrap(), "SP?");
    }

    #[test]
    fn filter_resp_uses_first_capture() {
        assert_eq!(speed().filter_resp("SP=17\r\n").unwrap(), CommandValue::Int(17));
        assert!(speed().filter_resp("garbage").is_err());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = Command::new(CommandSpec {
            cmd: "X".into(),
            name: "x".into(),
            set_regex: Some("X(".into()),
            ..CommandSpec::default()
        })
        .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPattern { .. }));
    }

    #[test]
    fn display_and_comments() {
        let cmd = Command::for_device(
            CommandSpec {
                cmd: "SP".into(),
                name: "speed".into(),
                desc: "motor speed".into(),
                reference: "manual p. 12".into(),
                ..CommandSpec::default()
            },
            "Pump",
        )
        .unwrap();
        assert_eq!(cmd.to_string(), "Pump SP (speed): motor speed, ref. manual p. 12");
        assert_eq!(cmd.comment(), "motor speed, (manual p. 12)");
        assert_eq!(cmd.query_comment(), "query - motor speed, (manual p. 12)");
    }
}
