//! Trusted execution
//!
//! Functions defined from client-supplied source text. This runs arbitrary
//! code on the server host and is only wired up when the server is started
//! with trusted execution enabled.
//!
//! [`CommandEvaluator`] hands each invocation to an interpreter subprocess:
//! the request `{"name", "source", "args", "kwargs"}` is written to its
//! stdin as JSON and the function result is read back from stdout.

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::codec::{self, Map, Value};
use crate::function::{CallContext, FunctionError, RemoteFunction};

/// Turns source text into a callable
pub trait SourceEvaluator: Send + Sync {
    fn define(&self, name: &str, source: &str) -> Result<Arc<dyn RemoteFunction>, FunctionError>;
}

/// Evaluator backed by an external interpreter command
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
}

impl CommandEvaluator {
    /// Build from a command line; the first element is the program
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl SourceEvaluator for CommandEvaluator {
    fn define(&self, name: &str, source: &str) -> Result<Arc<dyn RemoteFunction>, FunctionError> {
        if name.trim().is_empty() {
            return Err(FunctionError::invalid_arguments("function name is empty"));
        }
        if source.trim().is_empty() {
            return Err(FunctionError::invalid_arguments("function source is empty"));
        }
        Ok(Arc::new(SourceFunction {
            name: name.to_string(),
            source: source.to_string(),
            evaluator: self.clone(),
        }))
    }
}

#[derive(Serialize)]
struct EvalRequest<'a> {
    name: &'a str,
    source: &'a str,
    args: &'a [Value],
    kwargs: &'a Map,
}

/// A source-defined function, evaluated per invocation
struct SourceFunction {
    name: String,
    source: String,
    evaluator: CommandEvaluator,
}

#[async_trait]
impl RemoteFunction for SourceFunction {
    async fn call(
        &self,
        _ctx: &mut CallContext<'_>,
        args: Vec<Value>,
        kwargs: Map,
    ) -> Result<Value, FunctionError> {
        let request = codec::encode(&EvalRequest {
            name: &self.name,
            source: &self.source,
            args: &args,
            kwargs: &kwargs,
        })?;

        debug!("Evaluating `{}` with {}", self.name, self.evaluator.program);
        let mut child = Command::new(&self.evaluator.program)
            .args(&self.evaluator.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FunctionError::Execution(format!(
                    "failed to start interpreter `{}`: {e}",
                    self.evaluator.program
                ))
            })?;

        // Feed stdin while draining stdout/stderr so neither pipe can fill up
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(request.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| FunctionError::Execution(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FunctionError::Execution(format!(
                "`{}` exited with {}: {}",
                self.name,
                output.status,
                stderr.trim()
            )));
        }

        written.map_err(|e| FunctionError::Execution(format!("failed to write request: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(codec::decode(stdout)?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandEvaluator {
        CommandEvaluator::new(&["sh".to_string(), "-c".to_string(), script.to_string()]).unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandEvaluator::new(&[]).is_none());
    }

    #[test]
    fn test_empty_source_rejected() {
        let evaluator = sh("cat");
        assert!(evaluator.define("f", "   ").is_err());
        assert!(evaluator.define("", "x").is_err());
    }

    #[tokio::test]
    async fn test_request_reaches_interpreter() {
        // `cat` echoes the request back, so the result is the request itself
        let function = sh("cat").define("double", "def double(x): return 2 * x").unwrap();
        let mut ctx = CallContext::detached();
        let result = function
            .call(&mut ctx, vec![Value::from(21)], Map::new())
            .await
            .unwrap();

        let request = result.as_map().unwrap();
        assert_eq!(request.get("name"), Some(&Value::from("double")));
        assert_eq!(request.get("args"), Some(&Value::list(vec![21])));
    }

    #[tokio::test]
    async fn test_result_parsed_from_stdout() {
        let function = sh("cat > /dev/null; echo '[1, 2.5]'").define("f", "src").unwrap();
        let mut ctx = CallContext::detached();
        let result = function.call(&mut ctx, vec![], Map::new()).await.unwrap();
        assert_eq!(result, Value::list(vec![Value::from(1), Value::from(2.5)]));
    }

    #[tokio::test]
    async fn test_large_request_echoed_back() {
        let big = "x".repeat(1 << 20);
        let function = sh("cat").define("f", "src").unwrap();
        let mut ctx = CallContext::detached();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            function.call(&mut ctx, vec![Value::from(big.as_str())], Map::new()),
        )
        .await
        .expect("interpreter pipes stalled")
        .unwrap();

        let request = result.as_map().unwrap();
        assert_eq!(request.get("args"), Some(&Value::list(vec![Value::from(big.as_str())])));
    }

    #[tokio::test]
    async fn test_interpreter_failure_surfaces_stderr() {
        let function = sh("cat > /dev/null; echo 'NameError: y' >&2; exit 3")
            .define("f", "src")
            .unwrap();
        let mut ctx = CallContext::detached();
        let err = function.call(&mut ctx, vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, FunctionError::Execution(_)));
        assert!(err.to_string().contains("NameError: y"));
    }
}
