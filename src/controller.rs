//! Front-end proxy control: syntax check and reload

use crate::config::Settings;
use crate::error::{ConfigError, StoreError};
use crate::process::CommandLine;
use tracing::{error, info};

/// Capability the reconciliation engine needs from the proxy
///
/// Implementors provide the check and the raw reload signal. [`reload`]
/// always validates first and never signals an invalid configuration.
///
/// [`reload`]: ProxyController::reload
pub trait ProxyController {
    /// Run the proxy's built-in configuration syntax check
    fn validate(&self) -> Result<(), ConfigError>;

    /// Tell the running proxy to reload, without checking anything
    fn signal_reload(&self) -> Result<(), ConfigError>;

    /// Validate, then reload only if validation passed
    fn reload(&self) -> Result<(), ConfigError> {
        self.validate()?;
        self.signal_reload()
    }
}

/// nginx checked with `nginx -t` and reloaded through the service manager
#[derive(Debug, Clone)]
pub struct Nginx {
    test_command: CommandLine,
    reload_command: CommandLine,
}

impl Nginx {
    pub fn new(test_command: CommandLine, reload_command: CommandLine) -> Self {
        Self {
            test_command,
            reload_command,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        let parse = |key: &str, line: &str| {
            CommandLine::parse(line)
                .map_err(|e| StoreError::Invalid(vec![format!("settings.{}: {}", key, e)]))
        };
        Ok(Self::new(
            parse("nginx_test_command", &settings.nginx_test_command)?,
            parse("nginx_reload_command", &settings.nginx_reload_command)?,
        ))
    }
}

fn run_checked(cmd: &CommandLine) -> Result<(), ConfigError> {
    let output = cmd
        .run()
        .map_err(|e| ConfigError::new(format!("failed to run {}: {}", cmd, e)))?;
    if output.success {
        Ok(())
    } else {
        Err(ConfigError::new(output.diagnostic()))
    }
}

impl ProxyController for Nginx {
    fn validate(&self) -> Result<(), ConfigError> {
        match run_checked(&self.test_command) {
            Ok(()) => {
                info!("Nginx configuration test passed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e.message, "Nginx configuration test failed");
                Err(e)
            }
        }
    }

    fn signal_reload(&self) -> Result<(), ConfigError> {
        match run_checked(&self.reload_command) {
            Ok(()) => {
                info!("Nginx reloaded successfully");
                Ok(())
            }
            Err(e) => {
                error!(error = %e.message, "Nginx reload failed");
                Err(e)
            }
        }
    }
}
