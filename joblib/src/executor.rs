use crate::error::{Error, Result};
use crate::events::{JobOutcome, JobResult};
use crate::types::{Args, Envs, Program};

use bytes::{Bytes, BytesMut};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use std::{env, io};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{self, ChildStdout},
    time,
};
use tracing::{debug, warn};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// How long stdout may stay open once the program itself has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// What to run and for how long.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub program: Program,
    /// Arguments passed to the program. Empty unless configured.
    pub args: Args,
    /// Extra environment. The program otherwise only inherits `PATH`.
    pub envs: Envs,
    pub deadline: Duration,
}

impl ExecutorConfig {
    pub fn new(program: impl Into<Program>) -> Self {
        Self {
            program: program.into(),
            args: Args::new(),
            envs: Envs::new(),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// A finished execution together with the number of input bytes that were drained for it.
#[derive(Clone, Debug)]
pub struct Execution {
    pub input_bytes: u64,
    pub result: JobResult,
}

/// Runs the configured program once per call, each run with its own process and buffers.
#[derive(Clone, Debug)]
pub struct JobExecutor {
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn deadline(&self) -> Duration {
        self.config.deadline
    }

    /// Drain `input` and run the program on it.
    pub async fn execute<R>(&self, input: R) -> Result<Execution>
    where
        R: AsyncRead + Unpin,
    {
        let input = self.drain(input).await?;
        let input_bytes = input.len() as u64;
        let result = self.run(input).await?;
        Ok(Execution {
            input_bytes,
            result,
        })
    }

    /// Read the whole input stream into a scratch buffer.
    pub async fn drain<R>(&self, mut input: R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut scratch = Vec::new();
        input
            .read_to_end(&mut scratch)
            .await
            .map_err(Error::Input)?;
        Ok(Bytes::from(scratch))
    }

    /// Run the program with `input` on its stdin, killing it once the deadline passes.
    pub async fn run(&self, input: Bytes) -> Result<JobResult> {
        let mut command = process::Command::new(&self.config.program);
        command.args(&self.config.args).env_clear();
        if let Some(path) = env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
            .envs(self.config.envs.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // own session, so a kill reaches everything the program started
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id();

        // feed stdin from the scratch buffer, the pipe closes when the writer is dropped
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&input).await {
                    debug!(%err, "program stopped reading its input");
                }
            });
        }

        let mut stdout = child.stdout.take();
        let mut output = BytesMut::with_capacity(4096);
        let deadline = time::sleep(self.config.deadline);
        tokio::pin!(deadline);
        let exited = loop {
            tokio::select! {
                status = child.wait() => break Some(status.map_err(Error::Wait)?),
                read = read_chunk(&mut stdout, &mut output), if stdout.is_some() => {
                    if read.map_err(Error::Output)? == 0 {
                        stdout = None;
                    }
                }
                _ = &mut deadline => break None,
            }
        };

        let outcome = match exited {
            Some(status) => {
                // whatever the program started may still hold stdout open
                let drained =
                    time::timeout(OUTPUT_DRAIN_GRACE, read_output(&mut stdout, &mut output)).await;
                match drained {
                    Ok(read) => read.map_err(Error::Output)?,
                    Err(_) => {
                        debug!("stdout still open after the program exited");
                        kill_process_group(pid);
                    }
                }
                classify(status)
            }
            None => {
                kill_process_group(pid);
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to kill program after deadline");
                }
                JobOutcome::TimedOut
            }
        };
        let elapsed = started.elapsed();

        let output = match outcome {
            JobOutcome::Success => output.freeze(),
            JobOutcome::NonZeroExit { .. } | JobOutcome::TimedOut => Bytes::new(),
        };
        debug!(
            ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            output_bytes = output.len(),
            "program finished"
        );
        Ok(JobResult {
            outcome,
            output,
            elapsed,
        })
    }
}

async fn read_chunk(stdout: &mut Option<ChildStdout>, buf: &mut BytesMut) -> io::Result<usize> {
    match stdout {
        Some(stdout) => stdout.read_buf(buf).await,
        None => Ok(0),
    }
}

async fn read_output(stdout: &mut Option<ChildStdout>, buf: &mut BytesMut) -> io::Result<()> {
    while read_chunk(stdout, buf).await? > 0 {}
    *stdout = None;
    Ok(())
}

fn classify(status: ExitStatus) -> JobOutcome {
    match status.code() {
        Some(0) => JobOutcome::Success,
        Some(code) => JobOutcome::NonZeroExit { code },
        None => JobOutcome::NonZeroExit {
            code: signal_code(status),
        },
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // the program leads its own group, see the pre_exec hook in `run`
        if unsafe { libc::kill(-pid, libc::SIGKILL) } == -1 {
            debug!(err = %io::Error::last_os_error(), "process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signal| -signal).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_code(_status: ExitStatus) -> i32 {
    -1
}
