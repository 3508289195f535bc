//! Desired state: managed subdomains plus operator settings
//!
//! The state lives in one TOML file:
//!
//! ```toml
//! [settings]
//! log_file = "/var/log/nginx_domain_manager.log"
//! sites_available = "/etc/nginx/sites-available"
//! sites_enabled = "/etc/nginx/sites-enabled"
//!
//! [subdomains."app.example.com"]
//! target_ip = "192.168.0.215"
//! target_port = 8080
//! custom_options = ["client_max_body_size 50m;"]
//! ```
//!
//! Every mutation is written through to disk before it returns.

use crate::error::StoreError;
use crate::process::CommandLine;
use crate::validate::validate_subdomain_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where a subdomain's traffic is proxied to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(rename = "target_ip")]
    pub address: IpAddr,

    #[serde(rename = "target_port")]
    pub port: u16,

    /// Directives inserted verbatim into the proxy location block, in order
    #[serde(rename = "custom_options", default)]
    pub custom_directives: Vec<String>,
}

impl Upstream {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            custom_directives: Vec::new(),
        }
    }

    /// Set custom directives (builder pattern)
    pub fn with_directives(mut self, directives: Vec<String>) -> Self {
        self.custom_directives = directives;
        self
    }

    /// `ip:port`, with IPv6 addresses bracketed
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// One managed virtual host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubdomainEntry {
    pub name: String,
    #[serde(flatten)]
    pub upstream: Upstream,
}

impl SubdomainEntry {
    pub fn new(name: impl Into<String>, upstream: Upstream) -> Self {
        Self {
            name: name.into(),
            upstream,
        }
    }
}

/// Operator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Log file written by the tool
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding one rendered config per subdomain
    #[serde(default = "default_sites_available")]
    pub sites_available: PathBuf,

    /// Directory of activation links the proxy actually loads
    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: PathBuf,

    /// Where timestamped backups are written
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Root of `<name>/fullchain.pem` and `<name>/privkey.pem`
    #[serde(default = "default_cert_root")]
    pub cert_root: PathBuf,

    /// Replacement for the built-in virtual host template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Certificate client executable (and leading arguments)
    #[serde(default = "default_certbot_command")]
    pub certbot_command: String,

    /// Contact address passed to the certificate client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certbot_email: Option<String>,

    /// Command that checks proxy configuration syntax
    #[serde(default = "default_nginx_test_command")]
    pub nginx_test_command: String,

    /// Command that makes the running proxy reload its configuration
    #[serde(default = "default_nginx_reload_command")]
    pub nginx_reload_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            log_level: default_log_level(),
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
            backup_dir: default_backup_dir(),
            cert_root: default_cert_root(),
            template: None,
            certbot_command: default_certbot_command(),
            certbot_email: None,
            nginx_test_command: default_nginx_test_command(),
            nginx_reload_command: default_nginx_reload_command(),
        }
    }
}

/// Keys accepted by [`Settings::set`]
pub const SETTING_KEYS: &[&str] = &[
    "nginx_conf_dir",
    "sites_available",
    "sites_enabled",
    "backup_dir",
    "log_file",
    "log_level",
    "cert_root",
    "template",
    "certbot_command",
    "certbot_email",
    "nginx_test_command",
    "nginx_reload_command",
];

impl Settings {
    /// Change one setting by key
    ///
    /// `nginx_conf_dir` is a shorthand that points both site directories below
    /// the given directory. An empty value clears optional settings.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        let required = |v: &str| {
            if v.is_empty() {
                Err(format!("'{}' cannot be empty", key))
            } else {
                Ok(v.to_string())
            }
        };

        match key {
            "nginx_conf_dir" => {
                let dir = PathBuf::from(required(value)?);
                self.sites_available = dir.join("sites-available");
                self.sites_enabled = dir.join("sites-enabled");
            }
            "sites_available" => self.sites_available = required(value)?.into(),
            "sites_enabled" => self.sites_enabled = required(value)?.into(),
            "backup_dir" => self.backup_dir = required(value)?.into(),
            "log_file" => self.log_file = required(value)?.into(),
            "log_level" => self.log_level = required(value)?,
            "cert_root" => self.cert_root = required(value)?.into(),
            "template" => self.template = optional(value),
            "certbot_command" => self.certbot_command = required(value)?,
            "certbot_email" => self.certbot_email = optional(value),
            "nginx_test_command" => self.nginx_test_command = required(value)?,
            "nginx_reload_command" => self.nginx_reload_command = required(value)?,
            _ => {
                return Err(format!(
                    "unknown setting '{}' (expected one of: {})",
                    key,
                    SETTING_KEYS.join(", ")
                ))
            }
        }
        Ok(())
    }

    /// Current settings as display pairs
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sites_available", self.sites_available.display().to_string()),
            ("sites_enabled", self.sites_enabled.display().to_string()),
            ("backup_dir", self.backup_dir.display().to_string()),
            ("log_file", self.log_file.display().to_string()),
            ("log_level", self.log_level.clone()),
            ("cert_root", self.cert_root.display().to_string()),
            (
                "template",
                if self.template.is_some() { "custom" } else { "built-in" }.to_string(),
            ),
            ("certbot_command", self.certbot_command.clone()),
            ("certbot_email", self.certbot_email.clone().unwrap_or_default()),
            ("nginx_test_command", self.nginx_test_command.clone()),
            ("nginx_reload_command", self.nginx_reload_command.clone()),
        ]
    }

    /// Validate the settings, collecting every problem
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (key, line) in [
            ("certbot_command", &self.certbot_command),
            ("nginx_test_command", &self.nginx_test_command),
            ("nginx_reload_command", &self.nginx_reload_command),
        ] {
            if let Err(e) = CommandLine::parse(line) {
                errors.push(format!("settings.{}: {}", key, e));
            }
        }

        if self.sites_available == self.sites_enabled {
            errors.push("settings: sites_available and sites_enabled must differ".to_string());
        }

        if let Some(template) = &self.template {
            if template.trim().is_empty() {
                errors.push("settings.template: template is empty".to_string());
            }
        }

        errors
    }
}

// Default value functions
fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/nginx_domain_manager.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sites_available() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available")
}

fn default_sites_enabled() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/backup")
}

fn default_cert_root() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_certbot_command() -> String {
    "certbot".to_string()
}

fn default_nginx_test_command() -> String {
    "nginx -t".to_string()
}

fn default_nginx_reload_command() -> String {
    "systemctl reload nginx".to_string()
}

/// The persisted document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub settings: Settings,

    /// Subdomain name -> upstream, iterated in name order
    #[serde(default)]
    pub subdomains: BTreeMap<String, Upstream>,
}

impl DesiredState {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate settings and every stored entry
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut errors = self.settings.validate();

        for (name, upstream) in &self.subdomains {
            if !validate_subdomain_name(name) {
                errors.push(format!("subdomain '{}': invalid subdomain format", name));
            }
            if upstream.port == 0 {
                errors.push(format!("subdomain '{}': 'target_port' must be greater than 0", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Invalid(errors))
        }
    }
}

/// Desired-state store backed by a TOML file
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: DesiredState,
}

impl ConfigStore {
    /// Load an existing store file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let state = DesiredState::from_toml(&content).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;
        state.validate()?;

        debug!(path = %path.display(), subdomains = state.subdomains.len(), "Desired state loaded");
        Ok(Self { path, state })
    }

    /// Load the store, creating it with default settings if it does not exist
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let store = Self {
            path: path.to_path_buf(),
            state: DesiredState::default(),
        };
        store.save()?;
        info!(path = %path.display(), "Created default configuration");
        Ok(store)
    }

    /// Wrap an in-memory state that will be persisted to `path`
    pub fn with_state<P: AsRef<Path>>(path: P, state: DesiredState) -> Result<Self, StoreError> {
        state.validate()?;
        let store = Self {
            path: path.as_ref().to_path_buf(),
            state,
        };
        store.save()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &DesiredState {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.state.settings
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.subdomains.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<SubdomainEntry> {
        self.state
            .subdomains
            .get(name)
            .map(|upstream| SubdomainEntry::new(name, upstream.clone()))
    }

    /// All entries in name order
    pub fn entries(&self) -> Vec<SubdomainEntry> {
        self.state
            .subdomains
            .iter()
            .map(|(name, upstream)| SubdomainEntry::new(name.clone(), upstream.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.subdomains.keys().cloned().collect()
    }

    /// Insert or replace an entry, then persist
    pub fn upsert(&mut self, entry: SubdomainEntry) -> Result<(), StoreError> {
        let previous = self
            .state
            .subdomains
            .insert(entry.name.clone(), entry.upstream);

        if let Err(e) = self.save() {
            match previous {
                Some(upstream) => self.state.subdomains.insert(entry.name, upstream),
                None => self.state.subdomains.remove(&entry.name),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove an entry, then persist. Returns the removed entry if present.
    pub fn remove(&mut self, name: &str) -> Result<Option<SubdomainEntry>, StoreError> {
        let Some(upstream) = self.state.subdomains.remove(name) else {
            return Ok(None);
        };

        if let Err(e) = self.save() {
            self.state.subdomains.insert(name.to_string(), upstream);
            return Err(e);
        }
        Ok(Some(SubdomainEntry::new(name, upstream)))
    }

    /// Change one setting by key, then persist
    pub fn set_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut settings = self.state.settings.clone();
        settings.set(key, value).map_err(|e| StoreError::Invalid(vec![e]))?;

        let errors = settings.validate();
        if !errors.is_empty() {
            return Err(StoreError::Invalid(errors));
        }

        let previous = std::mem::replace(&mut self.state.settings, settings);
        if let Err(e) = self.save() {
            self.state.settings = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Atomically write the current state to disk
    pub fn save(&self) -> Result<(), StoreError> {
        let content = self.state.to_toml()?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), "Desired state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entry(name: &str, port: u16) -> SubdomainEntry {
        SubdomainEntry::new(
            name,
            Upstream::new("192.168.0.215".parse().unwrap(), port)
                .with_directives(vec!["client_max_body_size 50m;".to_string()]),
        )
    }

    #[test]
    fn test_parse_store_file() {
        let toml = r#"
[settings]
log_file = "/tmp/dm.log"
sites_available = "/srv/nginx/available"
sites_enabled = "/srv/nginx/enabled"

[subdomains."app.example.com"]
target_ip = "192.168.0.215"
target_port = 8080
custom_options = ["client_max_body_size 50m;", "proxy_read_timeout 300;"]

[subdomains."v6.example.com"]
target_ip = "fd00::5"
target_port = 3000
"#;

        let state = DesiredState::from_toml(toml).unwrap();
        assert_eq!(state.settings.log_file, PathBuf::from("/tmp/dm.log"));
        assert_eq!(state.settings.backup_dir, PathBuf::from("/etc/nginx/backup"));
        assert_eq!(state.subdomains.len(), 2);

        let app = &state.subdomains["app.example.com"];
        assert_eq!(app.port, 8080);
        assert_eq!(app.custom_directives.len(), 2);
        assert_eq!(app.custom_directives[1], "proxy_read_timeout 300;");

        let v6 = &state.subdomains["v6.example.com"];
        assert!(v6.custom_directives.is_empty());
        assert_eq!(v6.socket_addr().to_string(), "[fd00::5]:3000");
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.sites_available, PathBuf::from("/etc/nginx/sites-available"));
        assert_eq!(settings.sites_enabled, PathBuf::from("/etc/nginx/sites-enabled"));
        assert_eq!(settings.cert_root, PathBuf::from("/etc/letsencrypt/live"));
        assert_eq!(settings.nginx_test_command, "nginx -t");
        assert_eq!(settings.nginx_reload_command, "systemctl reload nginx");
        assert!(settings.template.is_none());
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut store = ConfigStore::load_or_init(&path).unwrap();
        store.upsert(sample_entry("app.example.com", 8080)).unwrap();
        store.upsert(sample_entry("api.example.com", 3000)).unwrap();
        store.set_setting("template", "server { server_name {{SUBDOMAIN}}; }").unwrap();

        let loaded = ConfigStore::load(&path).unwrap();
        assert_eq!(loaded.state(), store.state());

        loaded.save().unwrap();
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.state(), store.state());
    }

    #[test]
    fn test_load_or_init_creates_default_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let store = ConfigStore::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert!(store.entries().is_empty());
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        let err = ConfigStore::load(tmp.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }

    #[test]
    fn test_load_rejects_invalid_entries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[subdomains."bad_host!"]
target_ip = "10.0.0.1"
target_port = 0
"#,
        )
        .unwrap();

        match ConfigStore::load(&path).unwrap_err() {
            StoreError::Invalid(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("bad_host!"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_rejects_bad_address() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[subdomains."app.example.com"]
target_ip = "999.999.999.999"
target_port = 80
"#,
        )
        .unwrap();

        assert!(matches!(ConfigStore::load(&path).unwrap_err(), StoreError::Parse { .. }));
    }

    #[test]
    fn test_writes_are_immediately_persisted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        let mut store = ConfigStore::load_or_init(&path).unwrap();

        store.upsert(sample_entry("app.example.com", 8080)).unwrap();
        assert!(ConfigStore::load(&path).unwrap().contains("app.example.com"));

        let removed = store.remove("app.example.com").unwrap();
        assert_eq!(removed.unwrap().upstream.port, 8080);
        assert!(!ConfigStore::load(&path).unwrap().contains("app.example.com"));

        assert!(store.remove("app.example.com").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_whole_record() {
        let tmp = TempDir::new().unwrap();
        let mut store = ConfigStore::load_or_init(tmp.path().join("config.toml")).unwrap();

        store.upsert(sample_entry("app.example.com", 8080)).unwrap();
        store
            .upsert(SubdomainEntry::new(
                "app.example.com",
                Upstream::new("10.0.0.9".parse().unwrap(), 9000),
            ))
            .unwrap();

        let entry = store.get("app.example.com").unwrap();
        assert_eq!(entry.upstream.port, 9000);
        assert!(entry.upstream.custom_directives.is_empty());
    }

    #[test]
    fn test_entries_are_name_ordered() {
        let tmp = TempDir::new().unwrap();
        let mut store = ConfigStore::load_or_init(tmp.path().join("config.toml")).unwrap();
        store.upsert(sample_entry("c.example.com", 1)).unwrap();
        store.upsert(sample_entry("a.example.com", 2)).unwrap();
        store.upsert(sample_entry("b.example.com", 3)).unwrap();

        assert_eq!(store.names(), vec!["a.example.com", "b.example.com", "c.example.com"]);
    }

    #[test]
    fn test_set_nginx_conf_dir_moves_both_site_dirs() {
        let mut settings = Settings::default();
        settings.set("nginx_conf_dir", "/opt/nginx").unwrap();
        assert_eq!(settings.sites_available, PathBuf::from("/opt/nginx/sites-available"));
        assert_eq!(settings.sites_enabled, PathBuf::from("/opt/nginx/sites-enabled"));
    }

    #[test]
    fn test_set_rejects_unknown_and_empty() {
        let mut settings = Settings::default();
        assert!(settings.set("colour", "blue").is_err());
        assert!(settings.set("backup_dir", "  ").is_err());

        settings.set("certbot_email", "ops@example.com").unwrap();
        assert_eq!(settings.certbot_email.as_deref(), Some("ops@example.com"));
        settings.set("certbot_email", "").unwrap();
        assert!(settings.certbot_email.is_none());
    }

    #[test]
    fn test_set_setting_validates_before_persisting() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        let mut store = ConfigStore::load_or_init(&path).unwrap();

        let err = store.set_setting("nginx_test_command", "nginx '-t").unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(store.settings().nginx_test_command, "nginx -t");

        store.set_setting("backup_dir", "/srv/backups").unwrap();
        let loaded = ConfigStore::load(&path).unwrap();
        assert_eq!(loaded.settings().backup_dir, PathBuf::from("/srv/backups"));
    }

    #[test]
    fn test_failed_save_rolls_back_memory() {
        let tmp = TempDir::new().unwrap();
        // A directory where the file should be makes persist fail
        let path = tmp.path().join("config.toml");
        let mut store = ConfigStore::load_or_init(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.upsert(sample_entry("app.example.com", 8080)).is_err());
        assert!(!store.contains("app.example.com"));
    }
}
