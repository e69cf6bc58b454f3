use portable_pty::CommandBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
}

impl CommandSpec {
    pub fn into_builder(self) -> CommandBuilder {
        let mut builder = CommandBuilder::new(self.program);
        for var in self.env_remove {
            builder.env_remove(var);
        }
        for arg in self.args {
            builder.arg(arg);
        }
        for (key, value) in self.env {
            builder.env(key, value);
        }
        builder
    }
}

/// Compose the interactive shell invocation for a new session PTY.
pub fn build_shell_spec(cols: u16, rows: u16) -> CommandSpec {
    let mut env = build_environment(cols, rows);
    let env_remove = vec!["PROMPT_COMMAND".to_string(), "PS1".to_string()];

    let shell = super::get_effective_shell();
    env.push(("SHELL".to_string(), shell.clone()));

    CommandSpec {
        program: shell,
        args: Vec::new(),
        env,
        env_remove,
    }
}

fn build_environment(cols: u16, rows: u16) -> Vec<(String, String)> {
    let mut envs = vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
        ("LINES".to_string(), rows.to_string()),
        ("COLUMNS".to_string(), cols.to_string()),
    ];

    let path_value = if let Ok(home) = std::env::var("HOME") {
        envs.push(("HOME".to_string(), home.clone()));

        let mut path_components = vec![
            format!("{home}/.local/bin"),
            format!("{home}/.cargo/bin"),
            format!("{home}/bin"),
            "/opt/homebrew/bin".to_string(),
            "/usr/local/bin".to_string(),
            "/usr/bin".to_string(),
            "/bin".to_string(),
            "/usr/sbin".to_string(),
            "/sbin".to_string(),
        ];

        if let Ok(existing_path) = std::env::var("PATH") {
            for component in existing_path.split(':') {
                let component = component.trim();
                if !component.is_empty() && !path_components.contains(&component.to_string()) {
                    path_components.push(component.to_string());
                }
            }
        }

        path_components.join(":")
    } else {
        std::env::var("PATH").unwrap_or_else(|_| {
            "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string()
        })
    };

    envs.push(("PATH".to_string(), path_value));

    let lang_value = std::env::var("LANG").unwrap_or_else(|_| "en_US.UTF-8".to_string());
    envs.push(("LANG".to_string(), lang_value));

    if let Ok(lc_all) = std::env::var("LC_ALL") {
        envs.push(("LC_ALL".to_string(), lc_all));
    }

    envs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn shell_spec_carries_terminal_environment() {
        let spec = build_shell_spec(120, 30);

        assert!(!spec.program.is_empty());
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm-256color"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "COLORTERM" && v == "truecolor"));
        assert!(spec.env.iter().any(|(k, v)| k == "LINES" && v == "30"));
        assert!(spec.env.iter().any(|(k, v)| k == "COLUMNS" && v == "120"));
        assert!(spec.env_remove.contains(&"PROMPT_COMMAND".to_string()));
        assert!(spec.env_remove.contains(&"PS1".to_string()));
    }

    #[test]
    #[serial]
    fn path_keeps_existing_components() {
        let prev = std::env::var("PATH").ok();
        std::env::set_var("PATH", "/custom/tools:/usr/bin");

        let spec = build_shell_spec(80, 24);
        let path = spec
            .env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(path.contains("/custom/tools"));
        assert!(path.contains("/usr/bin"));

        match prev {
            Some(p) => std::env::set_var("PATH", p),
            None => std::env::remove_var("PATH"),
        }
    }
}
