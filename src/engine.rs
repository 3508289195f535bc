//! Subdomain lifecycle orchestration
//!
//! Single-entry operations (create, edit, delete) move through
//! [`Stage`]s and fail with an [`OperationError`] only when primary state (the
//! config files or the desired-state store) could not be changed safely.
//! Certificate and reload problems are recorded on the [`Outcome`] instead.
//!
//! Bulk operations (update all, reset all, repair) isolate subdomains from
//! each other: every per-subdomain result is collected into a [`BulkReport`]
//! and the proxy is reloaded once at the end.

use crate::certs::{CertificateManager, Certbot};
use crate::config::{ConfigStore, SubdomainEntry, Upstream};
use crate::controller::{Nginx, ProxyController};
use crate::error::{ConfigError, Error, OperationError, Stage, StoreError, ValidationError};
use crate::repository::ProxyConfigRepository;
use crate::validate::{parse_address, parse_port, parse_subdomain_name};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// A secondary step that failed without invalidating the operation
#[derive(Debug)]
pub struct StepFailure {
    pub stage: Stage,
    pub error: Error,
}

/// Result of a single-subdomain operation that reached `Done`
#[derive(Debug)]
pub struct Outcome {
    pub subdomain: String,
    /// Stages completed, in order
    pub completed: Vec<Stage>,
    /// Certificate and reload failures; the operation is reported as failed
    /// if this is non-empty
    pub failures: Vec<StepFailure>,
}

impl Outcome {
    fn new(subdomain: &str) -> Self {
        Self {
            subdomain: subdomain.to_string(),
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn complete(&mut self, stage: Stage) {
        self.completed.push(stage);
    }

    fn fail(&mut self, stage: Stage, error: impl Into<Error>) {
        self.failures.push(StepFailure {
            stage,
            error: error.into(),
        });
    }

    pub fn reached(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-subdomain step performed by a bulk operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ObtainCertificate,
    Remove,
    Materialize,
    NormalizeListeners,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::ObtainCertificate => "obtain certificate",
            Action::Remove => "remove configuration",
            Action::Materialize => "write configuration",
            Action::NormalizeListeners => "remove duplicate listeners",
        })
    }
}

/// One subdomain's result inside a bulk operation
#[derive(Debug)]
pub struct EntryResult {
    pub subdomain: String,
    pub action: Action,
    pub result: Result<(), Error>,
}

/// Everything a bulk operation did
#[derive(Debug, Default)]
pub struct BulkReport {
    /// Backup taken before destructive work, if any
    pub backup: Option<PathBuf>,
    pub results: Vec<EntryResult>,
    /// Each proxy reload attempted, in order
    pub reloads: Vec<Result<(), ConfigError>>,
}

impl BulkReport {
    fn record(&mut self, subdomain: &str, action: Action, result: Result<(), Error>) {
        match &result {
            Ok(()) => info!(subdomain, action = %action, "Step succeeded"),
            Err(e) => error!(subdomain, action = %action, error = %e, "Step failed"),
        }
        self.results.push(EntryResult {
            subdomain: subdomain.to_string(),
            action,
            result,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryResult> {
        self.results.iter().filter(|r| r.result.is_err())
    }

    /// Results for one kind of step
    pub fn results_for(&self, action: Action) -> impl Iterator<Item = &EntryResult> {
        self.results.iter().filter(move |r| r.action == action)
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none() && self.reloads.iter().all(Result::is_ok)
    }
}

/// One row of the managed-site listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteStatus {
    pub name: String,
    /// Upstream found in the config file on disk
    pub upstream: Option<String>,
    /// Upstream recorded in the desired state
    pub desired: Option<String>,
    pub enabled: bool,
    pub certificate: bool,
}

/// Divergence between desired state and what the proxy serves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Drift {
    /// In the desired state but not enabled
    pub missing: Vec<String>,
    /// Enabled but not in the desired state
    pub unmanaged: Vec<String>,
    /// Enabled with an upstream different from the desired one
    pub stale: Vec<String>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unmanaged.is_empty() && self.stale.is_empty()
    }
}

/// Orchestrates the store, the config files, certificates and the proxy
pub struct ReconciliationEngine {
    store: ConfigStore,
    repo: ProxyConfigRepository,
    certs: Box<dyn CertificateManager>,
    proxy: Box<dyn ProxyController>,
}

impl ReconciliationEngine {
    pub fn new(
        store: ConfigStore,
        certs: Box<dyn CertificateManager>,
        proxy: Box<dyn ProxyController>,
    ) -> Self {
        let repo = ProxyConfigRepository::from_settings(store.settings());
        Self {
            store,
            repo,
            certs,
            proxy,
        }
    }

    /// Engine driving the real certbot and nginx configured in the store
    pub fn with_system_tools(store: ConfigStore) -> Result<Self, StoreError> {
        let certs = Certbot::from_settings(store.settings())?;
        let proxy = Nginx::from_settings(store.settings())?;
        Ok(Self::new(store, Box::new(certs), Box::new(proxy)))
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn repository(&self) -> &ProxyConfigRepository {
        &self.repo
    }

    /// Add a new subdomain
    pub fn create(
        &mut self,
        name: &str,
        address: &str,
        port: &str,
        directives: Vec<String>,
    ) -> Result<Outcome, OperationError> {
        let entry = validated_entry(name, address, port, directives)
            .map_err(|e| OperationError::new(Stage::Validated, e))?;
        if self.store.contains(&entry.name) {
            return Err(OperationError::new(
                Stage::Validated,
                ValidationError::Duplicate(entry.name),
            ));
        }

        info!(subdomain = %entry.name, upstream = %entry.upstream.socket_addr(), "Creating subdomain");
        self.apply(entry)
    }

    /// Replace an existing subdomain's upstream
    ///
    /// `directives` of `None` keeps the current custom directives. Invalid
    /// input leaves the stored entry untouched.
    pub fn edit(
        &mut self,
        name: &str,
        address: &str,
        port: &str,
        directives: Option<Vec<String>>,
    ) -> Result<Outcome, OperationError> {
        let Some(current) = self.store.get(name) else {
            return Err(OperationError::new(
                Stage::Validated,
                Error::NotFound(name.to_string()),
            ));
        };

        let directives = directives.unwrap_or(current.upstream.custom_directives);
        let entry = validated_entry(name, address, port, directives)
            .map_err(|e| OperationError::new(Stage::Validated, e))?;

        info!(subdomain = %entry.name, upstream = %entry.upstream.socket_addr(), "Updating subdomain");
        self.apply(entry)
    }

    /// Materialize, certify, reload and persist a validated entry
    fn apply(&mut self, entry: SubdomainEntry) -> Result<Outcome, OperationError> {
        let mut outcome = Outcome::new(&entry.name);
        outcome.complete(Stage::Validated);

        let rendered = self.repo.renderer().render(&entry);
        outcome.complete(Stage::Rendered);

        self.repo
            .install(&entry.name, &rendered)
            .map_err(|e| OperationError::new(Stage::Materialized, e))?;
        outcome.complete(Stage::Materialized);

        match self.certs.obtain(&entry.name) {
            Ok(()) => outcome.complete(Stage::CertificateObtained),
            Err(e) => {
                warn!(subdomain = %entry.name, error = %e, "Continuing without certificate");
                outcome.fail(Stage::CertificateObtained, e);
            }
        }

        match self.proxy.reload() {
            Ok(()) => outcome.complete(Stage::Reloaded),
            Err(e) => outcome.fail(Stage::Reloaded, e),
        }

        let name = entry.name.clone();
        self.store
            .upsert(entry)
            .map_err(|e| OperationError::new(Stage::Persisted, e))?;
        outcome.complete(Stage::Persisted);
        outcome.complete(Stage::Done);

        if outcome.is_success() {
            info!(subdomain = %name, "Nginx configuration and SSL setup complete");
        } else {
            warn!(subdomain = %name, failures = outcome.failures.len(), "Subdomain saved with failed steps");
        }
        Ok(outcome)
    }

    /// Remove a subdomain's config, certificate and desired-state entry
    ///
    /// Names present only on disk can be deleted too.
    pub fn delete(&mut self, name: &str) -> Result<Outcome, OperationError> {
        let in_store = self.store.contains(name);
        let on_disk = is_plain_file_name(name)
            && (self.repo.is_enabled(name) || self.repo.available_path(name).is_file());
        if !in_store && !on_disk {
            return Err(OperationError::new(
                Stage::Validated,
                Error::NotFound(name.to_string()),
            ));
        }

        info!(subdomain = name, "Deleting subdomain");
        let mut outcome = Outcome::new(name);
        outcome.complete(Stage::Validated);

        self.repo
            .remove(name)
            .map_err(|e| OperationError::new(Stage::Removed, e))?;
        outcome.complete(Stage::Removed);

        match self.certs.delete(name) {
            Ok(()) => outcome.complete(Stage::CertificateDeleted),
            Err(e) => {
                warn!(subdomain = name, error = %e, "Failed to delete SSL certificate");
                outcome.fail(Stage::CertificateDeleted, e);
            }
        }

        match self.proxy.reload() {
            Ok(()) => outcome.complete(Stage::Reloaded),
            Err(e) => outcome.fail(Stage::Reloaded, e),
        }

        if in_store {
            self.store
                .remove(name)
                .map_err(|e| OperationError::new(Stage::Persisted, e))?;
        }
        outcome.complete(Stage::Persisted);
        outcome.complete(Stage::Done);

        info!(subdomain = name, "Subdomain has been deleted");
        Ok(outcome)
    }

    /// Renew the certificate of every enabled subdomain, then reload once
    pub fn update_all(&mut self) -> Result<BulkReport, Error> {
        let names = self.repo.list_managed()?;
        info!(count = names.len(), "Updating SSL certificates for all existing domains");

        let mut report = BulkReport::default();
        for name in &names {
            let result = self.certs.obtain(name).map_err(Error::from);
            report.record(name, Action::ObtainCertificate, result);
        }

        report.reloads.push(self.proxy.reload());
        Ok(report)
    }

    /// Rebuild every config file from the desired state
    ///
    /// A failed backup aborts before anything is removed.
    pub fn reset_all(&mut self) -> Result<BulkReport, Error> {
        info!("Initiating reset of all Nginx configurations");
        let backup = self.repo.backup_all()?;
        let existing = self.repo.list_managed()?;

        let mut report = BulkReport {
            backup: Some(backup),
            ..BulkReport::default()
        };

        for name in &existing {
            let result = self.repo.remove(name).map_err(Error::from);
            report.record(name, Action::Remove, result);
        }

        let entries = self.store.entries();
        if entries.is_empty() {
            info!("No subdomains found in configuration to recreate");
        }

        for entry in &entries {
            if let Err(e) = self.repo.materialize(entry) {
                report.record(&entry.name, Action::Materialize, Err(e.into()));
                continue;
            }
            report.record(&entry.name, Action::Materialize, Ok(()));

            let result = self.certs.obtain(&entry.name).map_err(Error::from);
            report.record(&entry.name, Action::ObtainCertificate, result);
        }

        report.reloads.push(self.proxy.reload());
        info!(failures = report.failures().count(), "Reset of all Nginx configurations finished");
        Ok(report)
    }

    /// Strip duplicate TLS listeners, reload, fill in missing certificates, reload
    pub fn repair(&mut self) -> Result<BulkReport, Error> {
        info!("Starting Nginx configuration fix process");
        let names = self.repo.list_managed()?;
        let mut report = BulkReport::default();

        for name in &names {
            let result = self
                .repo
                .normalize_listeners(name)
                .map(|_| ())
                .map_err(Error::from);
            report.record(name, Action::NormalizeListeners, result);
        }

        report.reloads.push(self.proxy.reload());

        for name in &names {
            if self.certs.exists(name) {
                info!(subdomain = %name, "SSL certificates already exist");
                continue;
            }
            warn!(subdomain = %name, "Missing SSL certificates, attempting to obtain");
            let result = self.certs.obtain(name).map_err(Error::from);
            report.record(name, Action::ObtainCertificate, result);
        }

        report.reloads.push(self.proxy.reload());
        Ok(report)
    }

    /// Every name known to the store or the enabled directory
    pub fn list(&self) -> Result<Vec<SiteStatus>, Error> {
        let enabled: BTreeSet<String> = self.repo.list_managed()?.into_iter().collect();
        let names: BTreeSet<String> = enabled
            .iter()
            .cloned()
            .chain(self.store.names())
            .collect();

        Ok(names
            .into_iter()
            .map(|name| SiteStatus {
                upstream: self.repo.read_upstream(&name),
                desired: self
                    .store
                    .get(&name)
                    .map(|e| e.upstream.socket_addr().to_string()),
                enabled: enabled.contains(&name),
                certificate: self.certs.exists(&name),
                name,
            })
            .collect())
    }

    /// Compare the desired state with the enabled directory
    pub fn drift(&self) -> Result<Drift, Error> {
        let mut drift = Drift::default();
        for site in self.list()? {
            match (&site.desired, site.enabled) {
                (Some(_), false) => drift.missing.push(site.name),
                (None, true) => drift.unmanaged.push(site.name),
                (Some(desired), true) => {
                    if matches!(&site.upstream, Some(found) if found != desired) {
                        drift.stale.push(site.name);
                    }
                }
                (None, false) => {}
            }
        }
        Ok(drift)
    }
}

fn validated_entry(
    name: &str,
    address: &str,
    port: &str,
    directives: Vec<String>,
) -> Result<SubdomainEntry, ValidationError> {
    let name = parse_subdomain_name(name)?;
    let address = parse_address(address)?;
    let port = parse_port(port)?;
    Ok(SubdomainEntry::new(
        name,
        Upstream::new(address, port).with_directives(directives),
    ))
}

/// Guards against selecting paths outside the site directories
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}
