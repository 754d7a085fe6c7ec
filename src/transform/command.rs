//! Out-of-process transform: one child process per frame

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::capture::RawFrame;
use crate::error::TransformError;
use crate::pipeline::FrameTransform;

/// Runs `program args...` for every frame. The packed RGBA frame goes to
/// the child's stdin; whatever it writes to stdout is the result, and an
/// empty stdout means "no result". Dimensions are passed as
/// `FRAMEGATE_INPUT_WIDTH`/`_HEIGHT` and `FRAMEGATE_OUTPUT_WIDTH`/`_HEIGHT`.
///
/// A child still running after `timeout` is killed.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    width: u32,
    height: u32,
    timeout: Duration,
}

impl CommandTransform {
    pub fn new(program: String, args: Vec<String>, width: u32, height: u32, timeout: Duration) -> Self {
        Self {
            program,
            args,
            width,
            height,
            timeout,
        }
    }

    async fn run(&self, frame: RawFrame) -> Result<Option<Vec<u8>>, TransformError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("FRAMEGATE_INPUT_WIDTH", frame.width().to_string())
            .env("FRAMEGATE_INPUT_HEIGHT", frame.height().to_string())
            .env("FRAMEGATE_OUTPUT_WIDTH", self.width.to_string())
            .env("FRAMEGATE_OUTPUT_HEIGHT", self.height.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransformError::Failed("child stdin not captured".into()))?;

        // Feed stdin while draining stdout, or a chatty child deadlocks on a full pipe.
        let write = async move {
            let written = stdin.write_all(&frame.data).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        let output = output?;
        if !output.status.success() {
            return Err(TransformError::ExitStatus(output.status.to_string()));
        }

        match written {
            Ok(()) => {}
            // The child is allowed to answer without reading all of its input.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e.into()),
        }

        debug!("{} returned {} bytes", self.program, output.stdout.len());
        if output.stdout.is_empty() {
            Ok(None)
        } else {
            Ok(Some(output.stdout))
        }
    }
}

impl FrameTransform for CommandTransform {
    /// Must be called from a thread inside a tokio runtime that is not
    /// itself driving async tasks, such as the blocking pool.
    fn transform(&self, frame: RawFrame) -> Result<Option<Vec<u8>>, TransformError> {
        let handle = Handle::try_current()
            .map_err(|e| TransformError::Failed(format!("no tokio runtime for child process: {}", e)))?;

        handle.block_on(async {
            match tokio::time::timeout(self.timeout, self.run(frame)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("{} did not answer within {:?}, killing it", self.program, self.timeout);
                    Err(TransformError::Failed(format!(
                        "{} killed after {:?}",
                        self.program, self.timeout
                    )))
                }
            }
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}
