//! On-disk virtual host files
//!
//! Each subdomain is materialized as a file in the "available" directory plus
//! an activation symlink of the same name in the "enabled" directory. Nothing
//! is overwritten or deleted without first copying it into the backup
//! directory, and an enabled link never points at a missing file:
//! links are created after their target is written and removed before it.

use crate::config::{Settings, SubdomainEntry};
use crate::error::IoError;
use crate::render::Renderer;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The two files backing one subdomain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFilePair {
    pub name: String,
    pub available: PathBuf,
    pub enabled: PathBuf,
}

/// Reconciles rendered configuration with the available/enabled directories
#[derive(Debug, Clone)]
pub struct ProxyConfigRepository {
    available_dir: PathBuf,
    enabled_dir: PathBuf,
    backup_dir: PathBuf,
    renderer: Renderer,
}

impl ProxyConfigRepository {
    pub fn new(
        available_dir: impl Into<PathBuf>,
        enabled_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        renderer: Renderer,
    ) -> Self {
        Self {
            available_dir: available_dir.into(),
            enabled_dir: enabled_dir.into(),
            backup_dir: backup_dir.into(),
            renderer,
        }
    }

    /// Build from operator settings, honouring a custom template
    pub fn from_settings(settings: &Settings) -> Self {
        let mut renderer = Renderer::new(&settings.cert_root);
        if let Some(template) = &settings.template {
            renderer = renderer.with_template(template.clone());
        }
        Self::new(
            &settings.sites_available,
            &settings.sites_enabled,
            &settings.backup_dir,
            renderer,
        )
    }

    pub fn available_path(&self, name: &str) -> PathBuf {
        self.available_dir.join(name)
    }

    pub fn enabled_path(&self, name: &str) -> PathBuf {
        self.enabled_dir.join(name)
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Render an entry and install it as the active configuration
    pub fn materialize(&self, entry: &SubdomainEntry) -> Result<ConfigFilePair, IoError> {
        let rendered = self.renderer.render(entry);
        self.install(&entry.name, &rendered)
    }

    /// Write `content` as the available file for `name` and enable it
    ///
    /// An existing available file is backed up first; if the backup fails
    /// nothing is written.
    pub fn install(&self, name: &str, content: &str) -> Result<ConfigFilePair, IoError> {
        create_dir(&self.available_dir)?;
        create_dir(&self.enabled_dir)?;

        let available = self.available_path(name);
        if available.is_file() {
            self.backup_file(&available)?;
        }

        write_atomic(&available, content)?;
        info!(subdomain = name, path = %available.display(), "Configuration written");

        let enabled = self.activate(name, &available)?;

        Ok(ConfigFilePair {
            name: name.to_string(),
            available,
            enabled,
        })
    }

    /// Point the enabled entry for `name` at `available`
    fn activate(&self, name: &str, available: &Path) -> Result<PathBuf, IoError> {
        let enabled = self.enabled_path(name);

        match fs::symlink_metadata(&enabled) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if self.links_to(&enabled, available) {
                    debug!(subdomain = name, "Configuration already enabled");
                    return Ok(enabled);
                }
                info!(subdomain = name, "Repointing enabled link");
            }
            Ok(meta) if meta.is_dir() => {
                return Err(IoError::new(
                    "enable",
                    &enabled,
                    io::Error::new(io::ErrorKind::Other, "enabled entry is a directory"),
                ));
            }
            Ok(_) => {
                if cfg!(not(unix)) && same_contents(&enabled, available) {
                    return Ok(enabled);
                }
                // A plain file is replaced by the link, keep a copy
                self.backup_file(&enabled)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(IoError::new("inspect", &enabled, e)),
        }

        self.link(name, available, &enabled)?;
        info!(subdomain = name, path = %enabled.display(), "Configuration enabled");
        Ok(enabled)
    }

    #[cfg(unix)]
    fn link(&self, name: &str, available: &Path, enabled: &Path) -> Result<(), IoError> {
        // Build the link beside its final name, then rename over it
        let staging = self.enabled_dir.join(format!(".{}.link", name));
        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(IoError::new("remove", &staging, e)),
        }
        // A relative target would resolve against the enabled directory
        let target = std::path::absolute(available).map_err(IoError::with("resolve", available))?;
        std::os::unix::fs::symlink(&target, &staging).map_err(IoError::with("link", &staging))?;
        fs::rename(&staging, enabled).map_err(IoError::with("enable", enabled))
    }

    #[cfg(not(unix))]
    fn link(&self, _name: &str, available: &Path, enabled: &Path) -> Result<(), IoError> {
        fs::copy(available, enabled)
            .map(|_| ())
            .map_err(IoError::with("enable", enabled))
    }

    /// Whether the symlink at `link` resolves to `target`
    fn links_to(&self, link: &Path, target: &Path) -> bool {
        let Ok(dest) = fs::read_link(link) else {
            return false;
        };
        let dest = if dest.is_absolute() {
            dest
        } else {
            link.parent().unwrap_or(&self.enabled_dir).join(dest)
        };
        if dest == target {
            return true;
        }
        match (fs::canonicalize(&dest), fs::canonicalize(target)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Back up and delete the pair for `name`
    ///
    /// Removing an absent pair succeeds. An enabled entry that refers to some
    /// other file is left alone.
    pub fn remove(&self, name: &str) -> Result<(), IoError> {
        let available = self.available_path(name);
        let enabled = self.enabled_path(name);
        let available_exists = available.is_file();

        if available_exists {
            self.backup_file(&available)?;
        }

        match fs::symlink_metadata(&enabled) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if self.links_to(&enabled, &available) {
                    remove_file(&enabled)?;
                    info!(subdomain = name, "Configuration disabled");
                } else {
                    warn!(
                        subdomain = name,
                        path = %enabled.display(),
                        "Enabled link points elsewhere, leaving it in place"
                    );
                }
            }
            Ok(meta) if meta.is_file() => {
                if available_exists && same_contents(&enabled, &available) {
                    remove_file(&enabled)?;
                    info!(subdomain = name, "Configuration disabled");
                } else {
                    warn!(
                        subdomain = name,
                        path = %enabled.display(),
                        "Enabled file is not a copy of the managed configuration, leaving it in place"
                    );
                }
            }
            Ok(_) => {
                warn!(subdomain = name, path = %enabled.display(), "Enabled entry is a directory, skipping");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(IoError::new("inspect", &enabled, e)),
        }

        if available_exists {
            remove_file(&available)?;
            info!(subdomain = name, path = %available.display(), "Configuration removed");
        }

        Ok(())
    }

    /// Names currently present in the enabled directory, sorted
    ///
    /// This is what the proxy serves, independent of the desired state.
    pub fn list_managed(&self) -> Result<Vec<String>, IoError> {
        let entries = match fs::read_dir(&self.enabled_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IoError::new("list", &self.enabled_dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(IoError::with("list", &self.enabled_dir))?;
            let file_type = entry.file_type().map_err(IoError::with("inspect", entry.path()))?;
            if file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }

    /// Whether `name` has an enabled entry
    pub fn is_enabled(&self, name: &str) -> bool {
        fs::symlink_metadata(self.enabled_path(name)).is_ok()
    }

    /// Copy both site directories into a fresh timestamped backup directory
    pub fn backup_all(&self) -> Result<PathBuf, IoError> {
        create_dir(&self.backup_dir)?;

        let dest = self.backup_dir.join(format!("config_backup_{}", timestamp()));
        fs::create_dir(&dest).map_err(IoError::with("create directory", &dest))?;

        copy_tree(&self.available_dir, &dest.join("sites-available"))?;
        copy_tree(&self.enabled_dir, &dest.join("sites-enabled"))?;

        info!(path = %dest.display(), "Backed up proxy configuration");
        Ok(dest)
    }

    /// Copy one file to `<backup_dir>/<file name>.<timestamp>.bak`
    pub fn backup_file(&self, path: &Path) -> Result<PathBuf, IoError> {
        create_dir(&self.backup_dir)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string());
        let dest = self.backup_dir.join(format!("{}.{}.bak", file_name, timestamp()));

        fs::copy(path, &dest).map_err(IoError::with("back up", path))?;
        debug!(source = %path.display(), backup = %dest.display(), "Backup created");
        Ok(dest)
    }

    /// Drop repeated TLS `listen` directives from the file `name` serves
    ///
    /// The first occurrence of each directive is kept. The file is only
    /// rewritten (after a backup) if something was removed. Returns the number
    /// of lines removed.
    pub fn normalize_listeners(&self, name: &str) -> Result<usize, IoError> {
        let enabled = self.enabled_path(name);
        // Write through the link, not over it
        let target = fs::canonicalize(&enabled).map_err(IoError::with("resolve", &enabled))?;
        let content = fs::read_to_string(&target).map_err(IoError::with("read", &target))?;

        let (normalized, removed) = strip_duplicate_listeners(&content);
        if removed == 0 {
            debug!(subdomain = name, "No duplicate listen directives");
            return Ok(0);
        }

        self.backup_file(&target)?;
        write_atomic(&target, &normalized)?;
        info!(subdomain = name, removed, path = %target.display(), "Removed duplicate listen directives");
        Ok(removed)
    }

    /// `host:port` from the `proxy_pass` line of the available file for `name`
    pub fn read_upstream(&self, name: &str) -> Option<String> {
        let content = fs::read_to_string(self.available_path(name)).ok()?;
        parse_proxy_pass(&content)
    }
}

/// Remove duplicate port-443 `listen` lines, keeping the first of each
fn strip_duplicate_listeners(content: &str) -> (String, usize) {
    let mut seen = HashSet::new();
    let mut out = String::with_capacity(content.len());
    let mut removed = 0;

    for line in content.split_inclusive('\n') {
        if let Some(key) = tls_listener_key(line) {
            if !seen.insert(key) {
                removed += 1;
                continue;
            }
        }
        out.push_str(line);
    }

    (out, removed)
}

/// Normalized directive text if `line` is a `listen` on port 443
fn tls_listener_key(line: &str) -> Option<String> {
    let directive = line.split('#').next().unwrap_or("").trim();
    let mut words = directive.split_whitespace();
    if words.next()? != "listen" {
        return None;
    }

    let address = words.next()?.trim_end_matches(';');
    let port = address.rsplit(':').next().unwrap_or(address);
    if port != "443" {
        return None;
    }

    Some(directive.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Extract `host:port` from the first `proxy_pass` directive
fn parse_proxy_pass(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        let mut words = line.split_whitespace();
        if words.next()? != "proxy_pass" {
            return None;
        }
        let url = words.next()?.trim_end_matches(';');
        let url = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url);
        let authority = url.split('/').next().unwrap_or(url);
        (!authority.is_empty()).then(|| authority.to_string())
    })
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%dT%H%M%S%.6f").to_string()
}

fn create_dir(dir: &Path) -> Result<(), IoError> {
    fs::create_dir_all(dir).map_err(IoError::with("create directory", dir))
}

fn remove_file(path: &Path) -> Result<(), IoError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IoError::new("remove", path, e)),
    }
}

fn same_contents(a: &Path, b: &Path) -> bool {
    match (fs::read(a), fs::read(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// Replace `path` with `content` so readers never observe a partial file
fn write_atomic(path: &Path, content: &str) -> Result<(), IoError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(IoError::with("create temporary file in", dir))?;
    tmp.write_all(content.as_bytes()).map_err(IoError::with("write", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
            .map_err(IoError::with("set permissions on", path))?;
    }

    tmp.persist(path).map_err(|e| IoError::new("write", path, e.error))?;
    Ok(())
}

/// Recursively copy `src` into a new directory `dst`, keeping symlinks as links
fn copy_tree(src: &Path, dst: &Path) -> Result<(), IoError> {
    fs::create_dir_all(dst).map_err(IoError::with("create directory", dst))?;

    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(IoError::new("list", src, e)),
    };

    for entry in entries {
        let entry = entry.map_err(IoError::with("list", src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(IoError::with("inspect", &from))?;

        if file_type.is_symlink() {
            copy_link(&from, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(IoError::with("back up", &from))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_link(from: &Path, to: &Path) -> Result<(), IoError> {
    let target = fs::read_link(from).map_err(IoError::with("read link", from))?;
    std::os::unix::fs::symlink(target, to).map_err(IoError::with("back up", from))
}

#[cfg(not(unix))]
fn copy_link(from: &Path, to: &Path) -> Result<(), IoError> {
    match fs::copy(from, to) {
        Ok(_) => Ok(()),
        // Dangling links have nothing to copy
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IoError::new("back up", from, e)),
    }
}
