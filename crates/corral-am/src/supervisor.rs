use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::appmaster::{AmEvent, EventSink};
use crate::error::{AmError, AmResult};

pub const DEFAULT_RECENT_LINES: usize = 64;

/// Extra time to wait for the exit status after a SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Supervises one long-lived child process: the backing-service master.
/// Its combined stdout and stderr are captured in a bounded ring buffer;
/// start and exit are reported through the engine's event queue. The
/// death of the child is a signal, not an error.
pub struct ChildSupervisor {
    stop_grace: Duration,
    shared: Arc<Shared>,
}

struct Shared {
    phase: Mutex<Phase>,
    command_line: Mutex<Option<String>>,
    output: Mutex<OutputRing>,
    /// `Some(code)` once the child has exited.
    exit: watch::Sender<Option<i32>>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Running { pid: i32 },
    Exited,
}

struct OutputRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputRing {
    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

impl ChildSupervisor {
    pub fn new(recent_lines: usize, stop_grace: Duration) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            stop_grace,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                command_line: Mutex::new(None),
                output: Mutex::new(OutputRing {
                    lines: VecDeque::new(),
                    capacity: recent_lines.max(1),
                }),
                exit,
            }),
        }
    }

    /// Spawns the child. Fails if a process is already live; spawning
    /// again after an exit is allowed.
    pub fn spawn(
        &self,
        command: &[String],
        environment: &[(String, String)],
        sink: EventSink,
    ) -> AmResult<()> {
        let mut phase = self.shared.phase.lock();
        if let Phase::Running { pid } = *phase {
            return Err(AmError::InternalState(format!(
                "the master process is already running (pid {pid})"
            )));
        }
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AmError::InternalState("empty master command".to_string()))?;
        let mut builder = Command::new(program);
        builder
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in environment {
            builder.env(name, value);
        }
        let mut child = builder
            .spawn()
            .map_err(|e| AmError::Launch(format!("cannot spawn {program}: {e}")))?;
        let pid = child
            .id()
            .map(|pid| pid as i32)
            .ok_or_else(|| AmError::InternalState("spawned child has no pid".to_string()))?;
        info!("spawned master process {} (pid {pid})", command.join(" "));

        *phase = Phase::Running { pid };
        *self.shared.command_line.lock() = Some(command.join(" "));
        self.shared.exit.send_replace(None);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::read_lines(stdout, Arc::clone(&self.shared)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::read_lines(stderr, Arc::clone(&self.shared)));
        }
        tokio::spawn(Self::monitor(child, Arc::clone(&self.shared), sink));
        Ok(())
    }

    /// Requests graceful termination; escalates to SIGKILL after the
    /// grace period. Idempotent, and a no-op once the child has exited.
    pub async fn stop(&self) {
        let pid = match *self.shared.phase.lock() {
            Phase::Running { pid } => pid,
            Phase::Idle | Phase::Exited => return,
        };
        info!("stopping master process (pid {pid})");
        if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!("SIGTERM to pid {pid}: {e}");
        }
        let mut exited = self.shared.exit.subscribe();
        let grace = self.stop_grace;
        if tokio::time::timeout(grace, exited.wait_for(|x| x.is_some()))
            .await
            .is_err()
        {
            warn!("master process did not exit within {grace:?}; killing it");
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!("SIGKILL to pid {pid}: {e}");
            }
            let _ = tokio::time::timeout(KILL_WAIT, exited.wait_for(|x| x.is_some())).await;
        }
    }

    /// Up to the ring capacity of the most recent output lines,
    /// in arrival order.
    pub fn recent_output(&self) -> Vec<String> {
        self.shared.output.lock().lines.iter().cloned().collect()
    }

    /// `None` until the child has terminated.
    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.shared.phase.lock(), Phase::Running { .. })
    }

    /// The launch command of the current or last spawn, joined by spaces.
    pub fn command_line(&self) -> Option<String> {
        self.shared.command_line.lock().clone()
    }

    async fn read_lines<R: AsyncRead + Unpin>(stream: R, shared: Arc<Shared>) {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            shared.output.lock().push(line);
        }
    }

    async fn monitor(mut child: Child, shared: Arc<Shared>, sink: EventSink) {
        sink.post(AmEvent::MasterStarted).await;
        let code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                warn!("failed to await the master process: {e}");
                -1
            }
        };
        *shared.phase.lock() = Phase::Exited;
        shared.exit.send_replace(Some(code));
        sink.post(AmEvent::MasterExited { code }).await;
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn sink() -> (EventSink, mpsc::Receiver<AmEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (EventSink::new(tx), rx)
    }

    async fn expect_started(rx: &mut mpsc::Receiver<AmEvent>) {
        match timeout(WAIT, rx.recv()).await.unwrap() {
            Some(AmEvent::MasterStarted) => {}
            _ => panic!("expected the started event"),
        }
    }

    async fn expect_exited(rx: &mut mpsc::Receiver<AmEvent>) -> i32 {
        match timeout(WAIT, rx.recv()).await.unwrap() {
            Some(AmEvent::MasterExited { code }) => code,
            _ => panic!("expected the exited event"),
        }
    }

    async fn wait_for_output(
        supervisor: &ChildSupervisor,
        predicate: impl Fn(&[String]) -> bool,
    ) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let output = supervisor.recent_output();
            if predicate(&output) {
                return output;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for output, got {output:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_spawn_reports_start_exit_and_output() {
        let supervisor = ChildSupervisor::new(DEFAULT_RECENT_LINES, Duration::from_secs(5));
        let (sink, mut rx) = sink();
        supervisor
            .spawn(&sh("echo one; echo two >&2"), &[], sink)
            .unwrap();
        expect_started(&mut rx).await;
        assert_eq!(expect_exited(&mut rx).await, 0);
        assert_eq!(supervisor.exit_code(), Some(0));
        assert!(!supervisor.is_running());
        let output = wait_for_output(&supervisor, |lines| lines.len() == 2).await;
        assert!(output.contains(&"one".to_string()));
        assert!(output.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn test_output_ring_drops_oldest_lines() {
        let supervisor = ChildSupervisor::new(8, Duration::from_secs(5));
        let (sink, mut rx) = sink();
        supervisor
            .spawn(&sh("i=1; while [ $i -le 100 ]; do echo line$i; i=$((i+1)); done"), &[], sink)
            .unwrap();
        expect_started(&mut rx).await;
        expect_exited(&mut rx).await;
        let output =
            wait_for_output(&supervisor, |lines| lines.last() == Some(&"line100".to_string()))
                .await;
        assert_eq!(output.len(), 8);
        assert_eq!(output[0], "line93");
    }

    #[tokio::test]
    async fn test_environment_reaches_the_child() {
        let supervisor = ChildSupervisor::new(DEFAULT_RECENT_LINES, Duration::from_secs(5));
        let (sink, mut rx) = sink();
        supervisor
            .spawn(
                &sh("echo $CORRAL_TEST_VALUE"),
                &[("CORRAL_TEST_VALUE".to_string(), "hello".to_string())],
                sink,
            )
            .unwrap();
        expect_started(&mut rx).await;
        expect_exited(&mut rx).await;
        let output = wait_for_output(&supervisor, |lines| !lines.is_empty()).await;
        assert_eq!(output[0], "hello");
    }

    #[tokio::test]
    async fn test_second_spawn_fails_while_running() {
        let supervisor = ChildSupervisor::new(DEFAULT_RECENT_LINES, Duration::from_secs(5));
        let (sink, mut rx) = sink();
        supervisor
            .spawn(&["/bin/sleep".to_string(), "30".to_string()], &[], sink.clone())
            .unwrap();
        expect_started(&mut rx).await;
        let out = supervisor.spawn(&sh("true"), &[], sink);
        assert!(matches!(out, Err(AmError::InternalState(_))));
        supervisor.stop().await;
        expect_exited(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stop_terminates_the_child() {
        let supervisor = ChildSupervisor::new(DEFAULT_RECENT_LINES, Duration::from_secs(5));
        let (sink, mut rx) = sink();
        supervisor
            .spawn(&["/bin/sleep".to_string(), "30".to_string()], &[], sink)
            .unwrap();
        expect_started(&mut rx).await;
        supervisor.stop().await;
        // Terminated by SIGTERM.
        assert_eq!(expect_exited(&mut rx).await, 128 + 15);
        assert_eq!(supervisor.exit_code(), Some(128 + 15));
        // Stopping again is a no-op.
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_launch_error() {
        let supervisor = ChildSupervisor::new(DEFAULT_RECENT_LINES, Duration::from_secs(5));
        let (sink, _rx) = sink();
        let out = supervisor.spawn(
            &["/nonexistent/binary".to_string()],
            &[],
            sink,
        );
        assert!(matches!(out, Err(AmError::Launch(_))));
        assert!(!supervisor.is_running());
    }
}
