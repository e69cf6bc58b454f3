//! One supervised pseudo-terminal: an interactive login shell into which the
//! assistant launch command is typed once the prompt has settled.

use portable_pty::{Child, MasterPty, NativePtySystem, PtySize, PtySystem};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::command_builder::build_shell_spec;
use crate::shared::paths::home_dir;

/// Output gap that counts as "the shell prompt has settled".
const LAUNCH_IDLE_GAP: Duration = Duration::from_millis(300);
/// Hard deadline for the launch write when the shell never produces output.
const LAUNCH_FALLBACK: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit { code: Option<i32> },
}

pub type PtyEventSender = mpsc::UnboundedSender<(String, PtyEvent)>;

#[derive(Debug, Clone)]
pub struct SpawnParams {
    pub id: String,
    pub working_dir: String,
    pub cols: u16,
    pub rows: u16,
}

pub struct PtySession {
    id: String,
    killed: Arc<AtomicBool>,
    child_pid: Option<u32>,
    child: Mutex<Option<Box<dyn Child + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    last_output: Arc<StdMutex<Option<Instant>>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    launch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PtySession {
    /// Spawn the shell PTY. Emits `Data`/`Exit` events tagged with the
    /// session id on the provided channel; emission stops after `kill()`.
    pub fn spawn(params: SpawnParams, events: PtyEventSender) -> Result<Arc<Self>, String> {
        let SpawnParams {
            id,
            working_dir,
            cols,
            rows,
        } = params;

        let cwd = if Path::new(&working_dir).is_dir() {
            working_dir
        } else {
            let home = home_dir().to_string_lossy().into_owned();
            log::warn!(
                "Working directory {working_dir} does not exist for session {id}; falling back to {home}"
            );
            home
        };

        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("Failed to open PTY: {e}"))?;

        let mut cmd = build_shell_spec(cols, rows).into_builder();
        cmd.cwd(cwd.clone());

        log::info!("Spawning session {id} shell in {cwd} ({cols}x{rows})");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| format!("Failed to spawn shell: {e}"))?;
        let child_pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| format!("Failed to get writer: {e}"))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| format!("Failed to clone reader: {e}"))?;

        let session = Arc::new(Self {
            id: id.clone(),
            killed: Arc::new(AtomicBool::new(false)),
            child_pid,
            child: Mutex::new(Some(child)),
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            last_output: Arc::new(StdMutex::new(None)),
            reader_handle: Mutex::new(None),
            launch_handle: Mutex::new(None),
        });

        let handle = Self::start_reader(Arc::clone(&session), reader, events);
        // Nothing can contend for the handle slot this early.
        if let Ok(mut guard) = session.reader_handle.try_lock() {
            *guard = Some(handle);
        }

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn start_reader(
        session: Arc<Self>,
        mut reader: Box<dyn Read + Send>,
        events: PtyEventSender,
    ) -> JoinHandle<()> {
        let id = session.id.clone();
        let killed = Arc::clone(&session.killed);
        let last_output = Arc::clone(&session.last_output);

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        log::info!("Session {id} PTY reached EOF");
                        break;
                    }
                    Ok(n) => {
                        if let Ok(mut guard) = last_output.lock() {
                            *guard = Some(Instant::now());
                        }
                        if killed.load(Ordering::SeqCst) {
                            continue;
                        }
                        if events.send((id.clone(), PtyEvent::Data(buf[..n].to_vec()))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::WouldBlock {
                            continue;
                        }
                        log::debug!("Session {id} PTY read error: {e}");
                        break;
                    }
                }
            }

            // Collect the exit status before announcing the exit; the wait
            // also reaps the child so no zombie lingers.
            let code = {
                let mut child_guard = session.child.blocking_lock();
                match child_guard.as_mut() {
                    Some(child) => child.wait().ok().map(|status| status.exit_code() as i32),
                    None => None,
                }
            };

            if !killed.load(Ordering::SeqCst) {
                let _ = events.send((id.clone(), PtyEvent::Exit { code }));
            }
        })
    }

    /// Queue the assistant launch command. It is written once the shell has
    /// been quiet for 300 ms, or unconditionally after 5 s; waiting out the
    /// startup chatter keeps slow rc files from eating the command.
    pub async fn schedule_launch(self: &Arc<Self>, command: String) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if session.is_killed() {
                    return;
                }
                let settled = session
                    .last_output
                    .lock()
                    .ok()
                    .and_then(|guard| *guard)
                    .map(|at| at.elapsed() >= LAUNCH_IDLE_GAP)
                    .unwrap_or(false);
                if settled || started.elapsed() >= LAUNCH_FALLBACK {
                    break;
                }
            }

            log::info!(
                "Writing launch command for session {}: {command}",
                session.id
            );
            let mut payload = command.into_bytes();
            payload.push(b'\r');
            if let Err(e) = session.write(&payload).await {
                log::warn!("Failed to write launch command for {}: {e}", session.id);
            }
        });
        *self.launch_handle.lock().await = Some(handle);
    }

    /// Forward bytes to the shell. A no-op once the PTY is gone.
    pub async fn write(&self, data: &[u8]) -> Result<(), String> {
        if self.is_killed() {
            return Ok(());
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        writer
            .write_all(data)
            .map_err(|e| format!("Write failed: {e}"))?;
        writer.flush().map_err(|e| format!("Flush failed: {e}"))
    }

    /// Resize the PTY. A no-op once the PTY is gone.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), String> {
        if self.is_killed() {
            return Ok(());
        }
        let guard = self.master.lock().await;
        let Some(master) = guard.as_ref() else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("Resize failed: {e}"))
    }

    /// Terminate the child and release the PTY. Idempotent; all event
    /// emission is suppressed from the first call onward. The child gets
    /// SIGTERM first and SIGKILL shortly after.
    pub async fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Killing session {}", self.id);

        if let Some(handle) = self.launch_handle.lock().await.take() {
            handle.abort();
        }

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tokio::time::sleep(KILL_GRACE).await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill() {
                log::debug!("Session {} child kill: {e}", self.id);
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(500),
                tokio::task::spawn_blocking(move || child.wait()),
            )
            .await;
        }

        *self.writer.lock().await = None;
        *self.master.lock().await = None;

        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_id(prefix: &str) -> String {
        format!(
            "{}-{}-{}",
            prefix,
            std::process::id(),
            COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
        )
    }

    fn spawn_session(
        id: &str,
        cwd: &str,
    ) -> (
        Arc<PtySession>,
        mpsc::UnboundedReceiver<(String, PtyEvent)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PtySession::spawn(
            SpawnParams {
                id: id.to_string(),
                working_dir: cwd.to_string(),
                cols: 80,
                rows: 24,
            },
            tx,
        )
        .expect("spawn session");
        (session, rx)
    }

    async fn wait_for_output(
        rx: &mut mpsc::UnboundedReceiver<(String, PtyEvent)>,
        needle: &str,
    ) -> bool {
        let deadline = Duration::from_secs(10);
        let mut collected = Vec::new();
        let result = tokio::time::timeout(deadline, async {
            while let Some((_, event)) = rx.recv().await {
                if let PtyEvent::Data(bytes) = event {
                    collected.extend_from_slice(&bytes);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        return true;
                    }
                }
            }
            false
        })
        .await;
        result.unwrap_or(false)
    }

    #[tokio::test]
    async fn spawn_write_receive_and_kill() {
        let id = unique_id("pty-basic");
        let (session, mut rx) = spawn_session(&id, "/tmp");

        session.write(b"echo marker_$((40+2))\r").await.unwrap();
        assert!(wait_for_output(&mut rx, "marker_42").await);

        session.kill().await;
        assert!(session.is_killed());
        // Second kill must be a no-op.
        session.kill().await;
    }

    #[tokio::test]
    async fn missing_working_dir_falls_back_to_home() {
        let id = unique_id("pty-fallback");
        let (session, mut rx) = spawn_session(&id, "/no/such/directory/at/all");

        session.write(b"pwd\r").await.unwrap();
        // The shell starts despite the bogus directory.
        assert!(wait_for_output(&mut rx, "/").await);
        session.kill().await;
    }

    #[tokio::test]
    async fn write_and_resize_after_kill_are_no_ops() {
        let id = unique_id("pty-postkill");
        let (session, _rx) = spawn_session(&id, "/tmp");
        session.kill().await;

        assert!(session.write(b"ignored\r").await.is_ok());
        assert!(session.resize(100, 40).await.is_ok());
    }

    #[tokio::test]
    async fn launch_command_is_written_after_idle() {
        let id = unique_id("pty-launch");
        let (session, mut rx) = spawn_session(&id, "/tmp");

        session
            .schedule_launch("echo launched_$((100+23))".to_string())
            .await;
        assert!(wait_for_output(&mut rx, "launched_123").await);
        session.kill().await;
    }

    #[tokio::test]
    async fn exit_event_carries_shell_exit() {
        let id = unique_id("pty-exit");
        let (session, mut rx) = spawn_session(&id, "/tmp");

        session.write(b"exit 0\r").await.unwrap();

        let deadline = Duration::from_secs(10);
        let saw_exit = tokio::time::timeout(deadline, async {
            while let Some((_, event)) = rx.recv().await {
                if matches!(event, PtyEvent::Exit { .. }) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(saw_exit);
        session.kill().await;
    }
}
