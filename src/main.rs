//! domain-manager - nginx virtual hosts and certificates for internal services
//!
//! Usage:
//!   domain-manager create <name> <ip> <port>   Add a subdomain
//!   domain-manager edit <name> <ip> <port>     Point a subdomain elsewhere
//!   domain-manager delete <name>               Remove a subdomain
//!   domain-manager list                        Show managed subdomains
//!   domain-manager renew                       Renew every certificate
//!   domain-manager reset                       Rebuild every config file
//!   domain-manager repair                      Fix listeners and missing certificates

use anyhow::{bail, Context, Result};
use domain_manager::config::{ConfigStore, SETTING_KEYS};
use domain_manager::engine::{BulkReport, Outcome, ReconciliationEngine};
use domain_manager::logging;
use std::env;
use std::io::Write;
use std::path::PathBuf;

/// Environment variable overriding the store location
const CONFIG_ENV: &str = "DOMAIN_MANAGER_CONFIG";

/// Environment variable that skips the root check
const ALLOW_NON_ROOT_ENV: &str = "DOMAIN_MANAGER_ALLOW_NON_ROOT";

/// CLI command structure
#[derive(Debug, PartialEq)]
enum Command {
    Create(UpstreamArgs),
    Edit(UpstreamArgs),
    Delete { name: String, yes: bool },
    List { json: bool },
    Drift,
    Renew,
    Reset { yes: bool },
    Repair,
    Logs { lines: usize },
    Settings(SettingsCommand),
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
struct UpstreamArgs {
    name: String,
    address: String,
    port: String,
    /// `None` keeps the stored directives on edit
    options: Option<Vec<String>>,
}

#[derive(Debug, PartialEq)]
enum SettingsCommand {
    List,
    Set { key: String, value: String },
}

impl Command {
    /// Commands that touch the proxy, certificates or the store
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Create(_)
                | Command::Edit(_)
                | Command::Delete { .. }
                | Command::Renew
                | Command::Reset { .. }
                | Command::Repair
                | Command::Settings(SettingsCommand::Set { .. })
        )
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (config_flag, args) = split_config_flag(&args)?;

    let command = parse_command(&args)?;
    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("domain-manager {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let path = config_path(config_flag);
    let mut store = ConfigStore::load_or_init(&path)?;
    let _guard = logging::init(store.settings());

    if command.is_mutating() {
        ensure_root()?;
    }

    match command {
        Command::Settings(cmd) => return handle_settings(&mut store, cmd),
        Command::Logs { lines } => return handle_logs(&store, lines),
        _ => {}
    }

    let mut engine = ReconciliationEngine::with_system_tools(store)?;

    match command {
        Command::Create(args) => {
            let directives = args.options.unwrap_or_default();
            let outcome = engine.create(&args.name, &args.address, &args.port, directives)?;
            finish_outcome(&outcome, "created")?;
        }
        Command::Edit(args) => {
            let outcome = engine.edit(&args.name, &args.address, &args.port, args.options)?;
            finish_outcome(&outcome, "updated")?;
        }
        Command::Delete { name, yes } => {
            if !yes && !confirm(&format!("Delete {} and its certificate?", name))? {
                println!("Deletion cancelled.");
                return Ok(());
            }
            let outcome = engine.delete(&name)?;
            finish_outcome(&outcome, "deleted")?;
        }
        Command::List { json } => handle_list(&engine, json)?,
        Command::Drift => handle_drift(&engine)?,
        Command::Renew => {
            let report = engine.update_all()?;
            finish_report(&report, "Certificate renewal")?;
        }
        Command::Reset { yes } => {
            if !yes
                && !confirm("Reset ALL nginx configurations from the stored subdomains?")?
            {
                println!("Reset cancelled.");
                return Ok(());
            }
            let report = engine.reset_all()?;
            finish_report(&report, "Reset")?;
        }
        Command::Repair => {
            let report = engine.repair()?;
            finish_report(&report, "Repair")?;
        }
        Command::Settings(_) | Command::Logs { .. } | Command::Help | Command::Version => {}
    }

    Ok(())
}

/// Pull `--config <path>` out of the argument list
fn split_config_flag(args: &[String]) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let path = iter.next().context("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }

    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.is_empty() {
        return Ok(Command::Help);
    }

    let rest = &args[1..];
    let has_flag = |flags: &[&str]| rest.iter().any(|a| flags.contains(&a.as_str()));

    let command = match args[0].as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "create" | "add" => Command::Create(parse_upstream_args(rest, "create")?),
        "edit" | "update" => Command::Edit(parse_upstream_args(rest, "edit")?),
        "delete" | "remove" | "rm" => {
            let name = positional(rest)
                .first()
                .cloned()
                .context("usage: domain-manager delete <name> [--yes]")?;
            Command::Delete {
                name,
                yes: has_flag(&["--yes", "-y"]),
            }
        }
        "list" | "ls" => Command::List {
            json: has_flag(&["--json"]),
        },
        "drift" | "status" => Command::Drift,
        "renew" | "update-all" => Command::Renew,
        "reset" => Command::Reset {
            yes: has_flag(&["--yes", "-y"]),
        },
        "repair" | "fix" => Command::Repair,
        "logs" | "log" => {
            let lines: usize = match rest.iter().position(|a| a == "--lines" || a == "-n") {
                Some(i) => rest
                    .get(i + 1)
                    .and_then(|s| s.parse().ok())
                    .context("--lines requires a number")?,
                None => 50,
            };
            Command::Logs { lines }
        }
        "settings" | "config" => parse_settings_command(rest)?,
        other => bail!("unknown command '{}' (see 'domain-manager help')", other),
    };

    Ok(command)
}

/// Arguments that are not flags or flag values
fn positional(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--option" || arg == "-o" {
            iter.next();
        } else if !arg.starts_with('-') {
            out.push(arg.clone());
        }
    }
    out
}

fn parse_upstream_args(args: &[String], verb: &str) -> Result<UpstreamArgs> {
    let usage = || {
        format!(
            "usage: domain-manager {} <name> <ip> <port> [--option <directive>]...",
            verb
        )
    };

    let positional = positional(args);
    let [name, address, port] = positional.as_slice() else {
        bail!(usage());
    };

    let mut options = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--option" || arg == "-o" {
            let directive = iter.next().with_context(usage)?;
            options.push(directive.clone());
        }
    }
    let clear = args.iter().any(|a| a == "--clear-options");

    Ok(UpstreamArgs {
        name: name.clone(),
        address: address.clone(),
        port: port.clone(),
        options: (clear || !options.is_empty()).then_some(options),
    })
}

fn parse_settings_command(args: &[String]) -> Result<Command> {
    let cmd = match args.first().map(String::as_str) {
        None | Some("list") => SettingsCommand::List,
        Some("set") => match (args.get(1), args.get(2)) {
            (Some(key), value) => SettingsCommand::Set {
                key: key.clone(),
                value: value.cloned().unwrap_or_default(),
            },
            (None, _) => bail!(
                "usage: domain-manager settings set <key> <value>\nkeys: {}",
                SETTING_KEYS.join(", ")
            ),
        },
        Some(other) => bail!("unknown settings command '{}'", other),
    };
    Ok(Command::Settings(cmd))
}

fn config_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("domain-manager")
        .join("config.toml")
}

#[cfg(unix)]
fn ensure_root() -> Result<()> {
    if env::var(ALLOW_NON_ROOT_ENV).as_deref() == Ok("1") {
        return Ok(());
    }
    // SAFETY: geteuid has no preconditions and cannot fail
    if unsafe { libc::geteuid() } != 0 {
        bail!(
            "this command must be run as root (set {}=1 to override)",
            ALLOW_NON_ROOT_ENV
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_root() -> Result<()> {
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} Type 'yes' to confirm: ", question);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "yes" | "y"))
}

fn finish_outcome(outcome: &Outcome, verb: &str) -> Result<()> {
    if outcome.is_success() {
        println!("Subdomain {} {}.", outcome.subdomain, verb);
        return Ok(());
    }

    println!("Subdomain {} {}, but some steps failed:", outcome.subdomain, verb);
    for failure in &outcome.failures {
        println!("  - {}: {}", failure.stage, failure.error);
    }
    bail!("{} step(s) failed for {}", outcome.failures.len(), outcome.subdomain)
}

fn finish_report(report: &BulkReport, label: &str) -> Result<()> {
    if let Some(backup) = &report.backup {
        println!("Backup written to {}", backup.display());
    }

    for entry in &report.results {
        match &entry.result {
            Ok(()) => println!("  ok      {:<40} {}", entry.subdomain, entry.action),
            Err(e) => println!("  FAILED  {:<40} {}: {}", entry.subdomain, entry.action, e),
        }
    }
    for reload in &report.reloads {
        if let Err(e) = reload {
            println!("  FAILED  nginx reload: {}", e);
        }
    }

    if report.is_success() {
        println!("{} completed.", label);
        Ok(())
    } else {
        bail!("{} completed with errors", label)
    }
}

fn handle_list(engine: &ReconciliationEngine, json: bool) -> Result<()> {
    let sites = engine.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sites)?);
        return Ok(());
    }

    if sites.is_empty() {
        println!("No subdomains configured.");
        return Ok(());
    }

    println!("{:<40} {:<24} {:<8} {:<6}", "SUBDOMAIN", "UPSTREAM", "ENABLED", "CERT");
    for site in &sites {
        let upstream = site
            .upstream
            .as_deref()
            .or(site.desired.as_deref())
            .unwrap_or("-");
        println!(
            "{:<40} {:<24} {:<8} {:<6}",
            site.name,
            upstream,
            if site.enabled { "yes" } else { "no" },
            if site.certificate { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn handle_drift(engine: &ReconciliationEngine) -> Result<()> {
    let drift = engine.drift()?;
    if drift.is_empty() {
        println!("Configuration matches the stored subdomains.");
        return Ok(());
    }

    for (label, names) in [
        ("Stored but not enabled", &drift.missing),
        ("Enabled but not stored", &drift.unmanaged),
        ("Upstream differs from stored", &drift.stale),
    ] {
        if !names.is_empty() {
            println!("{}:", label);
            for name in names {
                println!("  {}", name);
            }
        }
    }
    Ok(())
}

fn handle_settings(store: &mut ConfigStore, cmd: SettingsCommand) -> Result<()> {
    match cmd {
        SettingsCommand::List => {
            println!("Configuration file: {}", store.path().display());
            for (key, value) in store.settings().entries() {
                println!("  {:<22} {}", key, value);
            }
        }
        SettingsCommand::Set { key, value } => {
            store.set_setting(&key, &value)?;
            println!("Setting {} updated.", key);
        }
    }
    Ok(())
}

fn handle_logs(store: &ConfigStore, lines: usize) -> Result<()> {
    let log_file = &store.settings().log_file;
    for line in logging::tail(log_file, lines)? {
        println!("{}", line);
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"
domain-manager - nginx virtual hosts and Let's Encrypt certificates

USAGE:
    domain-manager [--config <path>] <command> [options]

COMMANDS:
    create <name> <ip> <port> [--option <directive>]...
                             Add a subdomain, obtain its certificate, reload nginx
    edit <name> <ip> <port> [--option <directive>]... [--clear-options]
                             Point an existing subdomain at a new upstream
    delete <name> [--yes]    Remove a subdomain and its certificate
    list [--json]            Show subdomains, upstreams and certificate status
    drift                    Compare stored subdomains with enabled configs
    renew                    Renew certificates for every enabled subdomain
    reset [--yes]            Back up, then rebuild every config from the store
    repair                   Remove duplicate listeners, obtain missing certificates
    logs [--lines N]         Show the end of the log file

    settings list            Show settings
    settings set <key> <val> Change a setting (nginx_conf_dir sets both site dirs)

    help                     Show this help
    version                  Show version

ENVIRONMENT:
    DOMAIN_MANAGER_CONFIG          Configuration file path
    DOMAIN_MANAGER_ALLOW_NON_ROOT  Set to 1 to skip the root check
    RUST_LOG                       Log filter (overrides settings.log_level)
"#
    );
}
