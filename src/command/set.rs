use super::{Command, CommandMatch, CommandSpec};
use crate::error::{AutomatResult, CommandError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// The `device` block of a command file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name; commands record it.
    #[serde(default)]
    pub name: String,
    /// Remaining keys of the block.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CommandFile {
    #[serde(default)]
    device: DeviceInfo,
    #[serde(default)]
    commands: Vec<CommandSpec>,
}

/// Ordered command table indexed by command code and by name.
///
/// Commands can only be added; a second command with the same code or name is
/// rejected.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    device: DeviceInfo,
    commands: Vec<Command>,
    by_cmd: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl CommandSet {
    /// An empty set for `device`.
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    /// Parse a command file, keeping the order of its `commands` list.
    pub fn from_yaml_str(text: &str) -> Result<Self, CommandError> {
        let file: CommandFile =
            serde_yaml::from_str(text).map_err(|e| CommandError::Spec(e.to_string()))?;
        let mut set = Self::new(file.device);
        for spec in file.commands {
            let command = Command::for_device(spec, &set.device.name)?;
            set.add(command)?;
        }
        debug!(device = %set.device.name, commands = set.len(), "command set loaded");
        Ok(set)
    }

    /// Read and parse a command file.
    pub fn from_yaml_file(path: &Path) -> AutomatResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&text)?)
    }

    /// The `device` block.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Append `command`. A code or name already present is rejected, never replaced.
    pub fn add(&mut self, command: Command) -> Result<(), CommandError> {
        if self.by_cmd.contains_key(command.cmd()) {
            return Err(CommandError::Duplicate(command.cmd().to_string()));
        }
        if !command.name().is_empty() && self.by_name.contains_key(command.name()) {
            return Err(CommandError::Duplicate(command.name().to_string()));
        }
        let index = self.commands.len();
        self.by_cmd.insert(command.cmd().to_string(), index);
        if !command.name().is_empty() {
            self.by_name.insert(command.name().to_string(), index);
        }
        self.commands.push(command);
        Ok(())
    }

    /// Look a command up by code, then by name.
    pub fn get(&self, key: &str) -> Option<&Command> {
        self.by_cmd
            .get(key)
            .or_else(|| self.by_name.get(key))
            .map(|&i| &self.commands[i])
    }

    /// Like [`get`](Self::get), failing with `UnknownCommand`.
    pub fn lookup(&self, key: &str) -> Result<&Command, CommandError> {
        self.get(key)
            .ok_or_else(|| CommandError::UnknownCommand(key.to_string()))
    }

    /// Command codes in insertion order.
    pub fn cmds(&self) -> Vec<&str> {
        self.commands.iter().map(Command::cmd).collect()
    }

    /// Non-empty command names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.commands
            .iter()
            .map(Command::name)
            .filter(|n| !n.is_empty())
            .collect()
    }

    /// Commands in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the set has no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// First command, in insertion order, whose set or query form matches `string`.
    pub fn match_str(&self, string: &str) -> Option<CommandMatch<'_>> {
        self.commands
            .iter()
            .map(|command| command.match_str(string))
            .find(|m| m.is_match())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MatchKind;

    const YAML: &str = r#"
device:
  name: "Test rig"
  model: "TR-1"
commands:
  - cmd: "SP"
    name: "speed"
    set_regex: 'SP(\d+)'
    set_conv: int
    set_range: [10, 20]
  - cmd: "ID"
    name: "identity"
    query_cmd: "*IDN?"
"#;

    #[test]
    fn loads_in_order_with_device_info() {
        let set = CommandSet::from_yaml_str(YAML).unwrap();
        assert_eq!(set.cmds(), vec!["SP", "ID"]);
        assert_eq!(set.names(), vec!["speed", "identity"]);
        assert_eq!(set.device().name, "Test rig");
        assert_eq!(set.device().extra["model"], "TR-1");
        assert_eq!(set.get("speed").unwrap().cmd(), "SP");
        assert_eq!(set.get("ID").unwrap().device_name(), "Test rig");
    }

    #[test]
    fn duplicate_code_is_rejected() {
        let mut set = CommandSet::from_yaml_str(YAML).unwrap();
        let dup = Command::new(CommandSpec {
            cmd: "SP".into(),
            name: "other".into(),
            ..CommandSpec::default()
        })
        .unwrap();
        assert_eq!(set.add(dup).unwrap_err(), CommandError::Duplicate("SP".into()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn match_scans_in_order() {
        let set = CommandSet::from_yaml_str(YAML).unwrap();
        let m = set.match_str("*IDN?").unwrap();
        assert_eq!(m.command().cmd(), "ID");
        assert_eq!(m.kind(), MatchKind::Query);
        assert!(set.match_str("XX").is_none());
        assert!(matches!(set.lookup("XX"), Err(CommandError::UnknownCommand(_))));
    }

    #[test]
    fn malformed_document_is_spec_error() {
        assert!(matches!(
            CommandSet::from_yaml_str("commands: [{name: 'no code'}]"),
            Err(CommandError::Spec(_))
        ));
    }
}
