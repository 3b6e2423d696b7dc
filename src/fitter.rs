//! The fit itself is an injected capability; coordination never looks inside it.

use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitFailure {
    pub message: String,
}

impl FitFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for FitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FitFailure {}

/// Fits one object. May be slow and non-deterministic.
pub trait Fitter: Send + Sync {
    fn fit(&self, id: &str, config: &Value) -> Result<Value, FitFailure>;
}

impl<F> Fitter for F
where
    F: Fn(&str, &Value) -> Result<Value, FitFailure> + Send + Sync,
{
    fn fit(&self, id: &str, config: &Value) -> Result<Value, FitFailure> {
        self(id, config)
    }
}

/// Runs `<program> [args...] <id>` with the configuration JSON on stdin and parses stdout as the
/// JSON result. A non-zero exit or unparsable stdout is a fit failure.
#[derive(Debug, Clone)]
pub struct CommandFitter {
    program: String,
    args: Vec<String>,
}

impl CommandFitter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Fitter for CommandFitter {
    fn fit(&self, id: &str, config: &Value) -> Result<Value, FitFailure> {
        let input = serde_json::to_vec(config)
            .map_err(|e| FitFailure::new(format!("encode config: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FitFailure::new(format!("spawn {}: {}", self.program, e)))?;

        // Feed stdin from a separate thread so a chatty child cannot deadlock us.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                // The child may legitimately ignore stdin and exit early.
                let _ = stdin.write_all(&input);
            })
        });

        let output = child
            .wait_with_output()
            .map_err(|e| FitFailure::new(format!("wait {}: {}", self.program, e)))?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            return Err(FitFailure::new(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| FitFailure::new(format!("unparsable result from {}: {}", self.program, e)))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
