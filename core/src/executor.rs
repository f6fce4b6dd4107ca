use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::artifact::ArtifactStore;
use crate::builder::PlannedStage;
use crate::errors::{command_line, PipelineError};
use crate::logger::Logger;
use crate::monitor::ResourceMonitor;
use crate::parser::ToolOutputParser;
use crate::stage::StageId;

/// Lines of tool output kept for error reports.
pub const LOG_TAIL_LINES: usize = 20;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// One external tool call, fully resolved.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: StageId,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Option<Duration>,
    pub expected_outputs: Vec<PathBuf>,
}

impl Invocation {
    pub fn for_stage(stage: &PlannedStage, store: &ArtifactStore) -> Result<Self, PipelineError> {
        let expected_outputs = stage
            .definition
            .output_names()
            .map(|name| store.resolve(name).map(|path| path.to_path_buf()))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            stage: stage.id().clone(),
            program: stage.command.program.clone(),
            args: stage.command.args.clone(),
            working_dir: stage.working_dir.clone(),
            log_path: stage.log_path.clone(),
            timeout: stage.timeout,
            expected_outputs,
        })
    }

    pub fn command_line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Runs an external tool. A non-zero exit is an error, never an outcome.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, invocation: &Invocation) -> Result<InvocationOutcome, PipelineError>;
}

/// Spawns tools as child processes, appending stdout and stderr to the stage log.
#[derive(Clone, Default)]
pub struct ProcessInvoker {
    logger: Option<Arc<Logger>>,
    monitor: Option<ResourceMonitor>,
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo classified tool output through `logger`.
    pub fn with_echo(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok()
                {
                    return;
                }
            }
        }

        let _ = child.kill().await;
    }
}

/// Sends each output line as raw bytes, line ending included.
/// Tool output is not required to be valid UTF-8.
async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    loop {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(buf).is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(&self, invocation: &Invocation) -> Result<InvocationOutcome, PipelineError> {
        let start = Instant::now();
        let log_path = &invocation.log_path;

        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                PipelineError::io(format!("cannot create {}", parent.display()), err)
            })?;
        }
        let mut log_file = tokio::fs::File::create(log_path).await.map_err(|err| {
            PipelineError::io(format!("cannot create {}", log_path.display()), err)
        })?;

        let spawned = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to start '{}': {}", invocation.program, err);
                let _ = log_file.write_all(format!("{}\n", message).as_bytes()).await;
                return Err(PipelineError::ToolFailure {
                    stage: invocation.stage.to_string(),
                    command: invocation.program.clone(),
                    args: invocation.args.clone(),
                    exit_code: None,
                    log_tail: vec![message],
                });
            }
        };

        let pid = child.id();
        if let (Some(monitor), Some(pid)) = (&self.monitor, pid) {
            monitor.add_pid(pid);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(tokio::spawn(forward_lines(stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(tokio::spawn(forward_lines(stderr, tx)));
        }
        drop(tx);

        let logger = self.logger.clone();
        let mut parser = ToolOutputParser::new(&invocation.program).for_stage(invocation.stage.as_str());
        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(log_file);
            let mut tail = VecDeque::with_capacity(LOG_TAIL_LINES);

            while let Some(raw) = rx.recv().await {
                out.write_all(&raw).await?;
                if raw.last() != Some(&b'\n') {
                    out.write_all(b"\n").await?;
                }

                let text = String::from_utf8_lossy(&raw);
                let line = text.trim_end_matches(&['\n', '\r'][..]).to_string();
                if let Some(logger) = &logger {
                    logger.log_entry(&parser.parse_line(&line));
                }

                if tail.len() == LOG_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }

            out.flush().await?;
            Ok::<_, std::io::Error>(Vec::from(tail))
        });

        let waited = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Some(status),
                Err(_) => {
                    self.terminate(&mut child).await;
                    None
                }
            },
            None => Some(child.wait().await),
        };

        if let (Some(monitor), Some(pid)) = (&self.monitor, pid) {
            monitor.remove_pid(pid);
        }

        // Grandchildren may keep the pipes open after the tool itself exits.
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN, reader).await.is_err() {
                abort.abort();
            }
        }

        let log_tail = match writer.await {
            Ok(Ok(tail)) => tail,
            Ok(Err(err)) => {
                return Err(PipelineError::io(
                    format!("cannot write {}", log_path.display()),
                    err,
                ))
            }
            Err(err) => {
                return Err(PipelineError::io(
                    format!("log writer for '{}' stopped", invocation.stage),
                    std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
                ))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        let status = match waited {
            Some(status) => status.map_err(|err| {
                PipelineError::io(format!("cannot wait for '{}'", invocation.program), err)
            })?,
            None => {
                return Err(PipelineError::ToolTimeout {
                    stage: invocation.stage.to_string(),
                    command: invocation.program.clone(),
                    args: invocation.args.clone(),
                    limit: invocation.timeout.unwrap_or_default(),
                    log_tail,
                })
            }
        };

        match status.code() {
            Some(0) => Ok(InvocationOutcome {
                exit_code: 0,
                duration_ms,
            }),
            exit_code => Err(PipelineError::ToolFailure {
                stage: invocation.stage.to_string(),
                command: invocation.program.clone(),
                args: invocation.args.clone(),
                exit_code,
                log_tail,
            }),
        }
    }
}
