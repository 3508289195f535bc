//! Certificate management through the external certificate-authority client
//!
//! Certificate contents are never read here. The system only observes whether
//! `<cert_root>/<name>/fullchain.pem` and `privkey.pem` exist and asks certbot
//! to issue or delete.

use crate::config::Settings;
use crate::error::{CertError, StoreError};
use crate::process::CommandLine;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Capability the reconciliation engine needs from a certificate authority
pub trait CertificateManager {
    /// Obtain or renew a certificate covering `name`
    fn obtain(&self, name: &str) -> Result<(), CertError>;

    /// Whether both the certificate chain and the key exist for `name`
    fn exists(&self, name: &str) -> bool;

    /// Delete the certificate for `name`; deleting an absent certificate succeeds
    fn delete(&self, name: &str) -> Result<(), CertError>;
}

/// Path convention for certificate files
pub fn certificate_paths(cert_root: &Path, name: &str) -> (PathBuf, PathBuf) {
    let dir = cert_root.join(name);
    (dir.join("fullchain.pem"), dir.join("privkey.pem"))
}

/// One entry of `certbot certificates`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub name: String,
    pub domains: Vec<String>,
}

/// Parse the human-readable output of `certbot certificates`
pub fn parse_certificate_listing(output: &str) -> Vec<IssuedCertificate> {
    let mut certs: Vec<IssuedCertificate> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Certificate Name:") {
            certs.push(IssuedCertificate {
                name: name.trim().to_string(),
                domains: Vec::new(),
            });
        } else if let Some(domains) = line.strip_prefix("Domains:") {
            if let Some(current) = certs.last_mut() {
                current.domains = domains.split_whitespace().map(str::to_string).collect();
            }
        }
    }

    certs
}

/// Certbot driven in non-interactive mode with the nginx plugin
#[derive(Debug, Clone)]
pub struct Certbot {
    command: CommandLine,
    cert_root: PathBuf,
    email: Option<String>,
}

impl Certbot {
    pub fn new(command: CommandLine, cert_root: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cert_root: cert_root.into(),
            email: None,
        }
    }

    /// Register with a contact address (builder pattern)
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        let command = CommandLine::parse(&settings.certbot_command)
            .map_err(|e| StoreError::Invalid(vec![format!("settings.certbot_command: {}", e)]))?;
        let certbot = Self::new(command, &settings.cert_root);
        Ok(match &settings.certbot_email {
            Some(email) => certbot.with_email(email.clone()),
            None => certbot,
        })
    }

    /// Arguments for issuing a certificate for `name`
    fn obtain_command(&self, name: &str) -> CommandLine {
        let mut cmd = self.command.clone().with_args([
            "--nginx",
            "-d",
            name,
            "--redirect",
            "--agree-tos",
            "--no-eff-email",
            "--non-interactive",
        ]);
        if let Some(email) = &self.email {
            cmd = cmd.with_args(["--email", email.as_str()]);
        }
        cmd
    }

    /// Issued certificates as reported by the client
    pub fn list(&self) -> Result<Vec<IssuedCertificate>, CertError> {
        let cmd = self.command.clone().with_args(["certificates"]);
        let output = cmd
            .run()
            .map_err(|e| CertError::new("*", format!("failed to run {}: {}", cmd, e)))?;
        if !output.success {
            return Err(CertError::new("*", output.diagnostic()));
        }
        Ok(parse_certificate_listing(&output.stdout))
    }
}

impl CertificateManager for Certbot {
    fn obtain(&self, name: &str) -> Result<(), CertError> {
        let cmd = self.obtain_command(name);
        info!(subdomain = name, "Requesting SSL certificate");

        let output = cmd.run().map_err(|e| {
            error!(subdomain = name, error = %e, "Failed to run certificate client");
            CertError::new(name, format!("failed to run {}: {}", cmd, e))
        })?;

        if output.success {
            info!(subdomain = name, "Obtained SSL certificate");
            Ok(())
        } else {
            let message = output.diagnostic();
            error!(subdomain = name, error = %message, "Failed to obtain SSL certificate");
            Err(CertError::new(name, message))
        }
    }

    fn exists(&self, name: &str) -> bool {
        let (cert, key) = certificate_paths(&self.cert_root, name);
        cert.exists() && key.exists()
    }

    fn delete(&self, name: &str) -> Result<(), CertError> {
        let issued = self.list().map_err(|e| CertError::new(name, e.message))?;

        // Only a certificate dedicated to this name is deleted; shared ones stay
        let Some(cert) = issued
            .iter()
            .find(|c| c.name == name || c.domains == [name])
        else {
            info!(subdomain = name, "No SSL certificate found");
            return Ok(());
        };

        let cmd = self
            .command
            .clone()
            .with_args(["delete", "--cert-name", cert.name.as_str(), "--non-interactive"]);
        let output = cmd
            .run()
            .map_err(|e| CertError::new(name, format!("failed to run {}: {}", cmd, e)))?;

        if output.success {
            info!(subdomain = name, cert_name = %cert.name, "Deleted SSL certificate");
            Ok(())
        } else {
            Err(CertError::new(name, output.diagnostic()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LISTING: &str = "\
Saving debug log to /var/log/letsencrypt/letsencrypt.log

- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -
Found the following certs:
  Certificate Name: app.example.com
    Serial Number: 3f1c
    Key Type: ECDSA
    Domains: app.example.com
    Expiry Date: 2026-12-01 10:00:00+00:00 (VALID: 43 days)
    Certificate Path: /etc/letsencrypt/live/app.example.com/fullchain.pem
    Private Key Path: /etc/letsencrypt/live/app.example.com/privkey.pem
  Certificate Name: shared.example.com
    Domains: shared.example.com www.example.com
- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -
";

    #[test]
    fn test_parse_certificate_listing() {
        let certs = parse_certificate_listing(LISTING);
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].name, "app.example.com");
        assert_eq!(certs[0].domains, vec!["app.example.com"]);
        assert_eq!(certs[1].domains, vec!["shared.example.com", "www.example.com"]);
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_certificate_listing("No certificates found.\n").is_empty());
    }

    #[test]
    fn test_obtain_command_arguments() {
        let certbot = Certbot::new(CommandLine::parse("certbot").unwrap(), "/etc/letsencrypt/live");
        assert_eq!(
            certbot.obtain_command("app.example.com").to_string(),
            "certbot --nginx -d app.example.com --redirect --agree-tos --no-eff-email --non-interactive"
        );

        let with_email = certbot.with_email("ops@example.com");
        assert!(with_email
            .obtain_command("app.example.com")
            .to_string()
            .ends_with("--non-interactive --email ops@example.com"));
    }

    #[test]
    fn test_exists_requires_chain_and_key() {
        let tmp = TempDir::new().unwrap();
        let certbot = Certbot::new(CommandLine::parse("certbot").unwrap(), tmp.path());
        assert!(!certbot.exists("app.example.com"));

        let (cert, key) = certificate_paths(tmp.path(), "app.example.com");
        std::fs::create_dir_all(cert.parent().unwrap()).unwrap();
        std::fs::write(&cert, "chain").unwrap();
        assert!(!certbot.exists("app.example.com"));

        std::fs::write(&key, "key").unwrap();
        assert!(certbot.exists("app.example.com"));
    }

    #[cfg(unix)]
    #[test]
    fn test_obtain_failure_is_cert_error() {
        let certbot = Certbot::new(CommandLine::parse("false").unwrap(), "/nonexistent");
        let err = certbot.obtain("app.example.com").unwrap_err();
        assert_eq!(err.subdomain, "app.example.com");
    }

    #[test]
    fn test_obtain_missing_binary_is_cert_error() {
        let certbot = Certbot::new(
            CommandLine::parse("definitely-not-certbot-4821").unwrap(),
            "/nonexistent",
        );
        let err = certbot.obtain("app.example.com").unwrap_err();
        assert!(err.message.contains("failed to run"));
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_absent_certificate_succeeds() {
        // `echo certificates` prints no listing, so nothing matches
        let certbot = Certbot::new(CommandLine::parse("echo").unwrap(), "/nonexistent");
        certbot.delete("app.example.com").unwrap();
    }

    #[test]
    fn test_from_settings_rejects_bad_command() {
        let settings = Settings {
            certbot_command: "certbot '--config-dir".to_string(),
            ..Settings::default()
        };
        match Certbot::from_settings(&settings) {
            Err(StoreError::Invalid(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].starts_with("settings.certbot_command:"));
            }
            other => panic!("expected invalid settings, got {:?}", other),
        }
    }

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.certbot_command = "/usr/bin/certbot --config-dir /srv/le".to_string();
        settings.certbot_email = Some("ops@example.com".to_string());

        let certbot = Certbot::from_settings(&settings).unwrap();
        assert_eq!(
            certbot.obtain_command("a.example.com").to_string(),
            "/usr/bin/certbot --config-dir /srv/le --nginx -d a.example.com --redirect --agree-tos --no-eff-email --non-interactive --email ops@example.com"
        );
    }
}
