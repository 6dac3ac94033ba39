use std::fmt;

/// Request commands.
///
/// The built-in commands are answered by the node itself; anything else is
/// looked up in the node's handler table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    FindNode,
    DownHint,
    Holepunch,
    Custom(String),
}

impl Command {
    pub fn parse(name: &str) -> Self {
        match name {
            "ping" => Command::Ping,
            "find_node" => Command::FindNode,
            "down_hint" => Command::DownHint,
            "holepunch" => Command::Holepunch,
            other => Command::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Ping => "ping",
            Command::FindNode => "find_node",
            Command::DownHint => "down_hint",
            Command::Holepunch => "holepunch",
            Command::Custom(name) => name,
        }
    }

    pub fn is_internal(&self) -> bool {
        !matches!(self, Command::Custom(_))
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
