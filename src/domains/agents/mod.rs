use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod claude;
pub mod copilot;
pub mod metadata;

/// The two CLI assistants this daemon knows how to supervise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Copilot,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Copilot => "copilot",
        }
    }

    pub fn binary_name(&self) -> &'static str {
        self.as_str()
    }

    /// Whether the assistant can pick up its most recent conversation.
    pub fn supports_resume(&self) -> bool {
        matches!(self, AgentKind::Claude)
    }

    /// The command line written into the shell once the prompt has gone
    /// idle. A resume attempt falls back to a fresh start when the CLI has
    /// nothing to continue.
    pub fn launch_command(&self, resume: bool) -> String {
        let binary = self.binary_name();
        if resume && self.supports_resume() {
            format!("{binary} --continue || {binary}")
        } else {
            binary.to_string()
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "copilot" => Ok(AgentKind::Copilot),
            _ => Err(format!("Unknown agent kind: {s}")),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_command_plain_start() {
        assert_eq!(AgentKind::Claude.launch_command(false), "claude");
        assert_eq!(AgentKind::Copilot.launch_command(false), "copilot");
    }

    #[test]
    fn launch_command_resume_falls_back_to_fresh_start() {
        assert_eq!(
            AgentKind::Claude.launch_command(true),
            "claude --continue || claude"
        );
    }

    #[test]
    fn copilot_does_not_resume() {
        assert_eq!(AgentKind::Copilot.launch_command(true), "copilot");
    }

    #[test]
    fn kind_round_trips_through_str() {
        assert_eq!("claude".parse::<AgentKind>().unwrap(), AgentKind::Claude);
        assert_eq!("copilot".parse::<AgentKind>().unwrap(), AgentKind::Copilot);
        assert!("cursor".parse::<AgentKind>().is_err());
    }
}
