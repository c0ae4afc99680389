//! Configuration resolver.
//!
//! Merges CLI options, a one-time snapshot of the process environment and
//! `/etc/os-release` into an immutable [`RunContext`]. Priority, highest first:
//! explicit CLI flags, environment variables, os-release (distro id/version only),
//! built-in defaults.
//!
//! After [`resolve`] returns, nothing in the crate consults `std::env`; child tasks
//! receive [`RunContext::task_environment`] as their complete environment.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use crate::cli::ConfigureArgs;
use crate::error::{ProvisionError, Result};
use crate::events::EventLogger;
use crate::mounts::{self, LegacyDevices, MountEntry, MountRecord};
use crate::os_release;
use crate::skip::SkipSet;
use crate::structured_log::StructuredLog;

pub const DEFAULT_INTERPRETER: &str = "php";
pub const DEFAULT_STRUCTURED_LOG_NAME: &str = "structured.log";
pub const DISTROS_DIR: &str = "distros";

/// Process environment and working directory captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
    current_dir: Option<PathBuf>,
}

impl EnvSnapshot {
    /// Capture the current process environment. Non UTF-8 values are converted lossily.
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect();
        Self {
            vars,
            current_dir: std::env::current_dir().ok(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            current_dir: None,
        }
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Working directory at capture time; `.` when it could not be read.
    pub fn current_dir(&self) -> &Path {
        self.current_dir.as_deref().unwrap_or(Path::new("."))
    }

    /// Raw value, possibly blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Trimmed value, `None` when unset or blank.
    pub fn non_blank(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// `MCX_DRY_RUN` and similar switches: anything but blank/0/false/no/off enables.
pub fn env_flag_enabled(value: Option<&str>) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => false,
        Some(v) => !matches!(v.as_str(), "" | "0" | "false" | "no" | "off"),
    }
}

/// Hostname decomposed on the first dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub fqdn: String,
    pub short: Option<String>,
    pub domain: Option<String>,
}

impl HostIdentity {
    pub fn parse(fqdn: &str) -> Self {
        let fqdn = fqdn.trim().to_string();
        let (short, domain) = match fqdn.split_once('.') {
            Some((short, domain)) => (short.trim(), Some(domain.trim())),
            None => (fqdn.as_str(), None),
        };
        Self {
            short: Some(short.to_string()).filter(|s| !s.is_empty()),
            domain: domain.map(str::to_string).filter(|d| !d.is_empty()),
            fqdn,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    pub host_ip: Option<String>,
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    pub primary_interface: Option<String>,
}

/// Remote material fetched by individual tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSources {
    pub ssh_keys_uri: Option<String>,
    pub ssh_keys_sha256: Option<String>,
    pub post_config_uri: Option<String>,
    pub post_config_sha256: Option<String>,
    pub hosts_template: Option<String>,
}

/// Resolved, read-only configuration for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub template_root: PathBuf,
    pub distro_id: String,
    pub distro_version: Option<String>,
    pub hostname: Option<HostIdentity>,
    pub network: NetworkSettings,
    pub remote: RemoteSources,
    pub mounts: Vec<MountEntry>,
    pub log_dir: Option<PathBuf>,
    pub structured_log: Option<PathBuf>,
    pub skip: SkipSet,
    pub dry_run: bool,
    pub task_timeout: Option<Duration>,
    pub interpreter: String,
    task_env: BTreeMap<String, String>,
}

impl RunContext {
    /// Root of the per-distro task trees.
    pub fn distros_root(&self) -> PathBuf {
        self.template_root.join(DISTROS_DIR)
    }

    /// Complete environment handed to every task.
    pub fn task_environment(&self) -> &BTreeMap<String, String> {
        &self.task_env
    }

    /// Variables this run sets (`Some`) or removes (`None`) on top of the inherited
    /// environment.
    pub fn exports(&self) -> Result<Vec<(String, Option<String>)>> {
        let mut out: Vec<(String, Option<String>)> = Vec::new();
        let mut set = |key: &str, value: Option<&str>| {
            if let Some(value) = value {
                out.push((key.to_string(), Some(value.to_string())));
            }
        };

        set("MCX_TEMPLATE_ROOT", Some(self.template_root.to_string_lossy().as_ref()));
        set("MCX_DISTRO_ID", Some(self.distro_id.as_str()));
        set("MCX_DISTRO_VERSION", self.distro_version.as_deref());

        if let Some(host) = &self.hostname {
            set("MCX_FQDN", Some(host.fqdn.as_str()));
            set("MCX_SHORT_HOSTNAME", host.short.as_deref());
            set("MCX_HOSTNAME_DOMAIN", host.domain.as_deref());
        }

        set("MCX_HOST_IP", self.network.host_ip.as_deref());
        set("MCX_NETWORK_CIDR", self.network.cidr.as_deref());
        set("MCX_GATEWAY", self.network.gateway.as_deref());
        set("MCX_PRIMARY_INTERFACE", self.network.primary_interface.as_deref());

        set("MCX_SSH_KEYS_URI", self.remote.ssh_keys_uri.as_deref());
        set("MCX_SSH_KEYS_SHA256", self.remote.ssh_keys_sha256.as_deref());
        set("MCX_POST_CONFIG_URI", self.remote.post_config_uri.as_deref());
        set("MCX_POST_CONFIG_SHA256", self.remote.post_config_sha256.as_deref());
        set("MCX_HOSTS_TEMPLATE", self.remote.hosts_template.as_deref());

        set(
            "MCX_LOG_DIR",
            self.log_dir.as_deref().map(Path::to_string_lossy).as_deref(),
        );
        set(
            "MCX_STRUCTURED_LOG",
            self.structured_log.as_deref().map(Path::to_string_lossy).as_deref(),
        );
        if !self.skip.is_empty() {
            set("MCX_SKIP_TASKS", Some(self.skip.display().join(",").as_str()));
        }
        if self.dry_run {
            set("MCX_DRY_RUN", Some("1"));
        }

        out.push(("MCX_MOUNT_SPEC".into(), Some(mounts::encode_spec(&self.mounts)?)));
        for (name, device) in mounts::legacy_device_env(&self.mounts) {
            out.push((name.to_string(), device));
        }

        Ok(out)
    }
}

/// Trimmed CLI value; an explicitly empty value is warned about and ignored.
fn cli_value(events: &EventLogger, option: &str, value: &Option<String>) -> Option<String> {
    let value = value.as_deref()?.trim();
    if value.is_empty() {
        events.warn(
            &format!("Ignoring empty value for --{option}."),
            Some(json!({ "option": option })),
        );
        return None;
    }
    Some(value.to_string())
}

/// CLI flag, else the named environment variable.
fn cli_or_env(
    events: &EventLogger,
    env: &EnvSnapshot,
    option: &str,
    value: &Option<String>,
    var: &str,
) -> Option<String> {
    cli_value(events, option, value).or_else(|| env.non_blank(var).map(str::to_string))
}

/// Structured target named directly by `--structured-log` or `MCX_STRUCTURED_LOG`,
/// known before anything is resolved. The log-dir default only applies in [`resolve`].
pub fn initial_structured_target(args: &ConfigureArgs, env: &EnvSnapshot) -> Option<PathBuf> {
    non_blank(&args.structured_log)
        .or_else(|| env.non_blank("MCX_STRUCTURED_LOG").map(str::to_string))
        .map(PathBuf::from)
}

/// Resolve the run configuration.
///
/// `events` starts out console-only and is switched to the structured target as soon
/// as that target is known, so later warnings are recorded too.
pub fn resolve(
    args: &ConfigureArgs,
    env: &EnvSnapshot,
    os_release_path: &Path,
    events: &mut EventLogger,
) -> Result<RunContext> {
    // Logging targets first so that everything below is mirrored.
    let explicit_structured =
        cli_or_env(events, env, "structured-log", &args.structured_log, "MCX_STRUCTURED_LOG")
            .map(PathBuf::from);
    if explicit_structured.is_some() {
        *events = EventLogger::new(StructuredLog::new(explicit_structured.clone()));
    }

    let log_dir = cli_or_env(events, env, "log-dir", &args.log_dir, "MCX_LOG_DIR")
        .map(PathBuf::from)
        .and_then(|dir| prepare_log_dir(dir, events));
    let structured_log = explicit_structured
        .or_else(|| log_dir.as_ref().map(|dir| dir.join(DEFAULT_STRUCTURED_LOG_NAME)));
    *events = EventLogger::new(StructuredLog::new(structured_log.clone()));

    let template_root = cli_or_env(events, env, "template-root", &args.template_root, "MCX_TEMPLATE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| env.current_dir().to_path_buf());

    // Distro identity
    let distro_id = cli_or_env(events, env, "distro", &args.distro, "MCX_DISTRO_ID")
        .or_else(|| non_blank(&args.positional_distro));
    let distro_version = cli_or_env(events, env, "version", &args.distro_version, "MCX_DISTRO_VERSION")
        .or_else(|| non_blank(&args.positional_version));
    let (distro_id, distro_version) =
        os_release::detect_distro(distro_id, distro_version, os_release_path);

    let distro_id = distro_id
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
        .ok_or(ProvisionError::MissingDistro)?;
    let distro_version = distro_version.as_deref().and_then(os_release::major_version);

    let hostname = resolve_hostname(args, env, events);

    let network = NetworkSettings {
        host_ip: cli_or_env(events, env, "host-ip", &args.host_ip, "MCX_HOST_IP"),
        cidr: cli_or_env(events, env, "network-cidr", &args.network_cidr, "MCX_NETWORK_CIDR"),
        gateway: cli_or_env(events, env, "gateway", &args.gateway, "MCX_GATEWAY"),
        primary_interface: cli_or_env(
            events,
            env,
            "primary-interface",
            &args.primary_interface,
            "MCX_PRIMARY_INTERFACE",
        ),
    };

    let remote = RemoteSources {
        ssh_keys_uri: cli_or_env(events, env, "ssh-keys-uri", &args.ssh_keys_uri, "MCX_SSH_KEYS_URI"),
        ssh_keys_sha256: cli_or_env(
            events,
            env,
            "ssh-keys-sha256",
            &args.ssh_keys_sha256,
            "MCX_SSH_KEYS_SHA256",
        ),
        post_config_uri: cli_or_env(events, env, "post-config", &args.post_config, "MCX_POST_CONFIG_URI"),
        post_config_sha256: cli_or_env(
            events,
            env,
            "post-config-sha256",
            &args.post_config_sha256,
            "MCX_POST_CONFIG_SHA256",
        ),
        hosts_template: cli_or_env(
            events,
            env,
            "hosts-template",
            &args.hosts_template,
            "MCX_HOSTS_TEMPLATE",
        ),
    };

    let mounts = resolve_mounts(args, env, events);
    mounts::require_root(&mounts)?;

    let skip = cli_or_env(events, env, "skip-tasks", &args.skip_tasks, "MCX_SKIP_TASKS")
        .map(|raw| SkipSet::parse(&raw))
        .unwrap_or_default();

    let dry_run = args.dry_run || env_flag_enabled(env.get("MCX_DRY_RUN"));

    let task_timeout = cli_or_env(events, env, "task-timeout", &args.task_timeout, "MCX_TASK_TIMEOUT")
        .and_then(|raw| parse_timeout(&raw, events));

    let interpreter = cli_or_env(events, env, "interpreter", &args.interpreter, "MCX_TASK_INTERPRETER")
        .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());

    let mut ctx = RunContext {
        template_root,
        distro_id,
        distro_version,
        hostname,
        network,
        remote,
        mounts,
        log_dir,
        structured_log,
        skip,
        dry_run,
        task_timeout,
        interpreter,
        task_env: BTreeMap::new(),
    };

    let mut task_env = env.vars().clone();
    for (key, value) in ctx.exports()? {
        match value {
            Some(value) => task_env.insert(key, value),
            None => task_env.remove(&key),
        };
    }
    ctx.task_env = task_env;

    Ok(ctx)
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn prepare_log_dir(dir: PathBuf, events: &EventLogger) -> Option<PathBuf> {
    if dir.is_dir() {
        return Some(dir);
    }
    match fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            events.warn(
                "Unable to create log directory; continuing with console logging only.",
                Some(json!({ "log_dir": dir.display().to_string(), "error": e.to_string() })),
            );
            None
        }
    }
}

fn resolve_hostname(args: &ConfigureArgs, env: &EnvSnapshot, events: &EventLogger) -> Option<HostIdentity> {
    if let Some(fqdn) = cli_value(events, "hostname", &args.hostname) {
        let identity = HostIdentity::parse(&fqdn);
        if identity.short.is_none() {
            events.warn("Ignoring empty hostname override.", Some(json!({ "hostname": fqdn })));
        }
        return Some(identity);
    }

    let fqdn = env.non_blank("MCX_FQDN")?;
    let mut identity = HostIdentity::parse(fqdn);
    if let Some(short) = env.non_blank("MCX_SHORT_HOSTNAME") {
        identity.short = Some(short.to_string());
    }
    if let Some(domain) = env.non_blank("MCX_HOSTNAME_DOMAIN") {
        identity.domain = Some(domain.to_string());
    }
    Some(identity)
}

/// `--mount` flags, else `MCX_MOUNT_SPEC`, else the legacy device layout.
fn resolve_mounts(args: &ConfigureArgs, env: &EnvSnapshot, events: &EventLogger) -> Vec<MountEntry> {
    let cli_records: Vec<MountRecord> = args
        .mounts
        .iter()
        .filter_map(|spec| match spec.parse::<MountRecord>() {
            Ok(record) => Some(record),
            Err(reason) => {
                events.warn(
                    &format!("Ignoring invalid --mount definition; {reason}."),
                    Some(json!({ "value": spec })),
                );
                None
            }
        })
        .collect();
    if !cli_records.is_empty() {
        return mounts::normalize(cli_records, events);
    }

    if let Some(raw) = env.non_blank("MCX_MOUNT_SPEC") {
        match mounts::decode_spec(raw) {
            Ok(records) if !records.is_empty() => return mounts::normalize(records, events),
            Ok(_) => events.warn("MCX_MOUNT_SPEC is empty; using legacy device defaults.", None),
            Err(e) => events.warn(
                "Unable to decode MCX_MOUNT_SPEC; using legacy device defaults.",
                Some(json!({ "error": e.to_string() })),
            ),
        }
    }

    let home = match args.home_device.as_deref().map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("omit") => None,
        Some(_) => cli_or_env(events, env, "home-device", &args.home_device, "HOME_DEVICE"),
        None => env.non_blank("HOME_DEVICE").map(str::to_string),
    };
    let devices = LegacyDevices {
        root: cli_or_env(events, env, "root-device", &args.root_device, "ROOT_DEVICE"),
        home,
        boot: env.non_blank("BOOT_DEVICE").map(str::to_string),
        swap: env.non_blank("SWAP_DEVICE").map(str::to_string),
    };
    mounts::normalize(devices.records(), events)
}

/// Seconds as integer or decimal; `0` disables the limit.
fn parse_timeout(raw: &str, events: &EventLogger) -> Option<Duration> {
    match raw.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Ok(secs) if secs == 0.0 => None,
        _ => {
            events.warn(
                "Ignoring invalid task timeout.",
                Some(json!({ "value": raw })),
            );
            None
        }
    }
}
