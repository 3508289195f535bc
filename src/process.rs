//! Blocking execution of external tools
//!
//! The proxy binary and the certificate client are both driven through
//! [`CommandLine`]. Every call blocks until the child exits; there is no
//! timeout beyond what the tool enforces itself.

use std::fmt;
use std::process::{Command, Stdio};
use tracing::debug;

/// A program plus its leading arguments, parsed from a settings string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Split a command string with shell quoting rules
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = shell_words::split(line).map_err(|e| format!("invalid command line: {}", e))?;
        if words.is_empty() {
            return Err("command line is empty".to_string());
        }
        let program = words.remove(0);
        Ok(Self { program, args: words })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Append extra arguments (builder pattern)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run to completion, capturing both output streams
    pub fn run(&self) -> std::io::Result<CommandOutput> {
        debug!(command = %self, "Running command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()?;

        let result = CommandOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(command = %self, code = ?result.code, "Command finished");
        Ok(result)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(self.args.iter());
        f.write_str(&shell_words::join(words))
    }
}

/// What a finished command reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Best diagnostic for a failed run: stderr, else stdout, else the exit code
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_quoted_words() {
        let cmd = CommandLine::parse("systemctl reload 'nginx service'").unwrap();
        assert_eq!(cmd.program(), "systemctl");
        assert_eq!(cmd.args, vec!["reload", "nginx service"]);
    }

    #[test]
    fn test_parse_rejects_empty_and_unbalanced() {
        assert!(CommandLine::parse("").is_err());
        assert!(CommandLine::parse("   ").is_err());
        assert!(CommandLine::parse("nginx '-t").is_err());
    }

    #[test]
    fn test_with_args_appends() {
        let cmd = CommandLine::parse("certbot").unwrap().with_args(["delete", "--cert-name", "a.example.com"]);
        assert_eq!(cmd.to_string(), "certbot delete --cert-name a.example.com");
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let out = CommandOutput {
            code: Some(1),
            success: false,
            stdout: "some output\n".to_string(),
            stderr: "nginx: [emerg] unexpected \"}\"\n".to_string(),
        };
        assert_eq!(out.diagnostic(), "nginx: [emerg] unexpected \"}\"");

        let quiet = CommandOutput {
            code: Some(2),
            success: false,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(quiet.diagnostic(), "exited with status 2");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_captures_exit_status() {
        let ok = CommandLine::parse("true").unwrap().run().unwrap();
        assert!(ok.success);
        assert_eq!(ok.code, Some(0));

        let failed = CommandLine::parse("false").unwrap().run().unwrap();
        assert!(!failed.success);
    }

    #[test]
    fn test_run_missing_program_is_io_error() {
        let cmd = CommandLine::parse("definitely-not-a-real-binary-4821").unwrap();
        assert!(cmd.run().is_err());
    }
}
