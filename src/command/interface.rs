use super::{CommandSet, CommandValue};
use crate::error::CommandError;
use std::io;
use tracing::{debug, warn};

/// Attempts made by [`CommandInterface::query`] before giving up.
pub const DEFAULT_MAX_QUERY_RETRY: u32 = 3;

/// Byte-level link to an instrument.
///
/// Drivers implement `send` and `read`; the exchange helpers have default
/// implementations built on them.
pub trait Communicator: Send {
    /// Write one command string to the instrument.
    fn send(&mut self, command: &str) -> io::Result<()>;

    /// Read one response line.
    fn read(&mut self) -> io::Result<String>;

    /// Send then read. Only for commands that answer promptly.
    fn exchange(&mut self, command: &str) -> io::Result<String> {
        self.send(command)?;
        self.read()
    }

    /// Send and block until the instrument raises `wait_flag`. The default only sends.
    fn wait_on_command(&mut self, command: &str, wait_flag: u32) -> io::Result<()> {
        let _ = wait_flag;
        self.send(command)
    }

    /// [`wait_on_command`](Self::wait_on_command), then read the response.
    fn wait_on_exchange(&mut self, command: &str, wait_flag: u32) -> io::Result<String> {
        self.wait_on_command(command, wait_flag)?;
        self.read()
    }
}

/// A [`CommandSet`] bound to a [`Communicator`].
pub struct CommandInterface<C: Communicator> {
    commands: CommandSet,
    link: C,
    max_query_retry: u32,
}

impl<C: Communicator> CommandInterface<C> {
    /// Bind `commands` to `link`.
    pub fn new(commands: CommandSet, link: C) -> Self {
        Self {
            commands,
            link,
            max_query_retry: DEFAULT_MAX_QUERY_RETRY,
        }
    }

    /// Override [`DEFAULT_MAX_QUERY_RETRY`].
    pub fn with_max_query_retry(mut self, retries: u32) -> Self {
        self.max_query_retry = retries;
        self
    }

    /// The bound command set.
    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    /// The underlying link.
    pub fn link(&self) -> &C {
        &self.link
    }

    /// Mutable access to the underlying link.
    pub fn link_mut(&mut self) -> &mut C {
        &mut self.link
    }

    /// Query a command by code or name, retrying failed exchanges or undecodable
    /// responses up to the configured retry count.
    pub fn query(&mut self, key: &str) -> Result<CommandValue, CommandError> {
        let command = self.commands.lookup(key)?;
        let query = command.cmd_query()?;
        let mut attempt = 0;
        loop {
            let outcome = self
                .link
                .exchange(query)
                .map_err(|e| CommandError::Exchange(e.to_string()))
                .and_then(|resp| command.filter_resp(&resp));
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_query_retry => {
                    return Err(CommandError::Exchange(format!(
                        "exceeded the maximum number of retries ({}) for query '{query}'; last error: {e}",
                        self.max_query_retry
                    )));
                }
                Err(e) => {
                    attempt += 1;
                    warn!(command = %command.cmd(), attempt, error = %e, "query failed, retrying");
                }
            }
        }
    }

    /// Build the set string for `key` and send it, waiting on `wait_flag` when declared.
    pub fn set(&mut self, key: &str, value: impl Into<CommandValue>) -> Result<(), CommandError> {
        let command = self.commands.lookup(key)?;
        let out = command.cmd_set(value)?;
        debug!(command = %command.cmd(), wire = %out, "set");
        self.link
            .send(&out)
            .map_err(|e| CommandError::Exchange(e.to_string()))
    }

    /// Send the set form and decode the reply, waiting on the command's `wait_flag`
    /// when it has one.
    pub fn read(&mut self, key: &str, value: impl Into<CommandValue>) -> Result<CommandValue, CommandError> {
        let command = self.commands.lookup(key)?;
        let out = command.cmd_set(value)?;
        let resp = match command.wait_flag() {
            Some(flag) => self.link.wait_on_exchange(&out, flag),
            None => self.link.exchange(&out),
        }
        .map_err(|e| CommandError::Exchange(e.to_string()))?;
        command.filter_resp(&resp)
    }

    /// Send the reset string of `key`.
    pub fn reset(&mut self, key: &str) -> Result<(), CommandError> {
        let command = self.commands.lookup(key)?;
        let out = command.cmd_reset()?;
        self.link
            .send(&out)
            .map_err(|e| CommandError::Exchange(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedLink {
        sent: Vec<String>,
        replies: VecDeque<io::Result<String>>,
        waited: Vec<u32>,
    }

    impl Communicator for ScriptedLink {
        fn send(&mut self, command: &str) -> io::Result<()> {
            self.sent.push(command.to_string());
            Ok(())
        }

        fn read(&mut self) -> io::Result<String> {
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::TimedOut, "no reply")))
        }

        fn wait_on_command(&mut self, command: &str, wait_flag: u32) -> io::Result<()> {
            self.waited.push(wait_flag);
            self.send(command)
        }
    }

    const YAML: &str = r#"
commands:
  - cmd: "SP"
    name: "speed"
    set_regex: 'SP(\d+)'
    set_range: [10, 20]
    reset_val: 12
    query_cmd: "SP?"
    resp_regex: 'SP=(\d+)'
    resp_conv: int
  - cmd: "MV"
    name: "move"
    set_regex: 'MV(\d+)'
    resp_conv: str
    wait_flag: 16
"#;

    fn interface(replies: Vec<io::Result<String>>) -> CommandInterface<ScriptedLink> {
        let link = ScriptedLink {
            replies: replies.into(),
            ..ScriptedLink::default()
        };
        CommandInterface::new(CommandSet::from_yaml_str(YAML).unwrap(), link)
    }

    #[test]
    fn query_retries_then_succeeds() {
        let mut iface = interface(vec![
            Err(io::Error::new(io::ErrorKind::TimedOut, "slow")),
            Ok("noise".into()),
            Ok("SP=14".into()),
        ]);
        assert_eq!(iface.query("speed").unwrap(), CommandValue::Int(14));
        assert_eq!(iface.link().sent, vec!["SP?", "SP?", "SP?"]);
    }

    #[test]
    fn query_gives_up_after_retries() {
        let mut iface = interface(Vec::new()).with_max_query_retry(2);
        let err = iface.query("SP").unwrap_err();
        assert!(err.to_string().contains("maximum number of retries (2)"));
        assert_eq!(iface.link().sent.len(), 3);
    }

    #[test]
    fn set_reset_and_read() {
        let mut iface = interface(vec![Ok("DONE".into())]);
        iface.set("speed", 15).unwrap();
        iface.reset("speed").unwrap();
        assert!(iface.set("speed", 30).is_err());
        assert_eq!(iface.read("move", 5).unwrap(), CommandValue::Str("DONE".into()));
        assert_eq!(iface.link().sent, vec!["SP15", "SP12", "MV5"]);
        assert_eq!(iface.link().waited, vec![16]);
    }

    #[test]
    fn unknown_command_is_not_retried() {
        let mut iface = interface(Vec::new());
        assert!(matches!(iface.query("XX"), Err(CommandError::UnknownCommand(_))));
        assert!(iface.link().sent.is_empty());
    }
}
