use std::{env, fs, path::Path};

pub mod command_builder;
pub mod pty;
pub mod utf8_stream;

pub use pty::{PtyEvent, PtySession, SpawnParams};
pub use utf8_stream::Utf8Stream;

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

const FALLBACK_SHELLS: &[&str] = &[
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/bash",
    "/usr/bin/bash",
    "/bin/sh",
    "/usr/bin/sh",
];

/// Determine the interactive shell to spawn, honoring `$SHELL` and falling
/// back through the platform candidates when it is unusable.
pub fn get_effective_shell() -> String {
    if let Ok(env_shell) = env::var("SHELL") {
        if is_executable(Path::new(&env_shell)) {
            return env_shell;
        }
        log::warn!("Environment variable SHELL={env_shell:?} is unavailable; falling back to defaults");
    }

    for candidate in FALLBACK_SHELLS {
        if is_executable(Path::new(candidate)) {
            return (*candidate).to_string();
        }
    }

    log::warn!("No configured shells available; falling back to bare 'sh'");
    "sh".to_string()
}

fn is_executable(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::metadata(path)
            .map(|metadata| (metadata.permissions().mode() & 0o111) != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        true
    }
}
