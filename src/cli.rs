use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::json;

use crate::config::env_flag_enabled;
use crate::events::EventLogger;

/// mcx-configure - turn a freshly cloned image into a unique host
///
/// Runs the distro task tree (`<root>/distros/<distro>/{common,<version>}/{tasks,user.d}`)
/// in lexicographic order. Without options the distro and version are detected from
/// /etc/os-release; MCX_DISTRO_ID and MCX_DISTRO_VERSION provide the same overrides.
#[derive(Parser, Debug)]
#[command(name = "mcx-configure")]
#[command(about = "Run ordered provisioning tasks on a freshly cloned machine image")]
#[command(disable_version_flag = true)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub configure: ConfigureArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summarise a structured log produced by earlier runs
    AnalyzeLog(AnalyzeArgs),
}

/// Options for a provisioning run. String options stay `Option<String>` so that an
/// explicitly empty value can be told apart from an absent one.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigureArgs {
    // Base options
    /// Override distro detection
    #[arg(long, value_name = "ID", help_heading = "Base options")]
    pub distro: Option<String>,

    /// Override version detection (only the major part is used)
    #[arg(long = "version", value_name = "MAJOR", help_heading = "Base options")]
    pub distro_version: Option<String>,

    /// Repository root containing the `distros` task tree
    #[arg(long, value_name = "PATH", help_heading = "Base options")]
    pub template_root: Option<String>,

    /// Interpreter used to execute task scripts
    #[arg(long, value_name = "PATH", help_heading = "Base options")]
    pub interpreter: Option<String>,

    // Networking & identity
    /// Fully-qualified hostname
    #[arg(long, value_name = "FQDN", help_heading = "Networking & identity")]
    pub hostname: Option<String>,

    /// Explicit host IP for /etc/hosts
    #[arg(long, value_name = "IP", help_heading = "Networking & identity")]
    pub host_ip: Option<String>,

    /// Primary interface CIDR block
    #[arg(long, value_name = "CIDR", help_heading = "Networking & identity")]
    pub network_cidr: Option<String>,

    /// Default gateway address
    #[arg(long, value_name = "IP", help_heading = "Networking & identity")]
    pub gateway: Option<String>,

    /// Name of the primary network interface
    #[arg(long, value_name = "NAME", help_heading = "Networking & identity")]
    pub primary_interface: Option<String>,

    /// Template used to render /etc/hosts
    #[arg(long, value_name = "PATH", help_heading = "Networking & identity")]
    pub hosts_template: Option<String>,

    // Storage
    /// Mount declaration; repeat for several mounts
    #[arg(long = "mount", value_name = "MOUNT,DEVICE[,TYPE[,OPTS]]", help_heading = "Storage")]
    pub mounts: Vec<String>,

    /// Device to mount at / (legacy layout)
    #[arg(long, value_name = "PATH", help_heading = "Storage")]
    pub root_device: Option<String>,

    /// Device for /home, or `omit` to skip it (legacy layout)
    #[arg(long, value_name = "PATH|omit", help_heading = "Storage")]
    pub home_device: Option<String>,

    // Post provisioning
    /// Fetch authorized_keys from URI
    #[arg(long, value_name = "URI", help_heading = "Post provisioning")]
    pub ssh_keys_uri: Option<String>,

    /// Expected SHA-256 of the key buffer, or per-URI `URI=HASH` pairs
    #[arg(long, value_name = "HASH|URI=HASH,...", help_heading = "Post provisioning")]
    pub ssh_keys_sha256: Option<String>,

    /// Download and execute a post-configuration script
    #[arg(long = "post-config", value_name = "URI", help_heading = "Post provisioning")]
    pub post_config: Option<String>,

    /// Expected SHA-256 of the post-configuration script
    #[arg(long = "post-config-sha256", value_name = "HASH", help_heading = "Post provisioning")]
    pub post_config_sha256: Option<String>,

    // Execution control
    /// Directory for per-task logs and the default structured log
    #[arg(long, value_name = "PATH", help_heading = "Execution control")]
    pub log_dir: Option<String>,

    /// Structured JSON-lines log target
    #[arg(long, value_name = "PATH", help_heading = "Execution control")]
    pub structured_log: Option<String>,

    /// Comma or whitespace separated task names to skip
    #[arg(long, value_name = "LIST", help_heading = "Execution control")]
    pub skip_tasks: Option<String>,

    /// Report the tasks that would run without spawning them
    #[arg(long, help_heading = "Execution control")]
    pub dry_run: bool,

    /// Terminate a task that runs longer than this many seconds
    #[arg(long, value_name = "SECONDS", help_heading = "Execution control")]
    pub task_timeout: Option<String>,

    /// Distro identifier (lower priority than --distro and MCX_DISTRO_ID)
    #[arg(value_name = "DISTRO")]
    pub positional_distro: Option<String>,

    /// Distro version (lower priority than --version and MCX_DISTRO_VERSION)
    #[arg(value_name = "VERSION")]
    pub positional_version: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// Structured log to read
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,

    /// Write the report here instead of stdout
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    pub format: ReportFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Table,
}

/// A switch given as `--name=value`. Empty and truthy values turn it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchValue {
    pub name: String,
    pub value: String,
    pub enabled: bool,
}

impl SwitchValue {
    fn new(name: String, value: &str) -> Self {
        let enabled = value.trim().is_empty() || env_flag_enabled(Some(value));
        Self {
            name,
            value: value.to_string(),
            enabled,
        }
    }
}

/// Argument vector cleaned up for clap, plus what was dropped or rewritten on the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedArgs {
    pub args: Vec<String>,
    pub ignored: Vec<String>,
    pub switch_values: Vec<SwitchValue>,
}

impl SanitizedArgs {
    /// Warn about every option that was dropped or rewritten.
    pub fn report(&self, events: &EventLogger) {
        for option in &self.ignored {
            events.warn(
                &format!("Ignoring unknown option --{option}."),
                Some(json!({ "option": option })),
            );
        }
        for switch in &self.switch_values {
            let state = if switch.enabled { "on" } else { "off" };
            events.warn(
                &format!(
                    "Option --{} takes no value; treating '{}' as {}.",
                    switch.name, switch.value, state
                ),
                Some(json!({ "option": switch.name, "value": switch.value, "enabled": switch.enabled })),
            );
        }
    }
}

/// Drop unknown `--options` (and a detached value following them), turn a
/// value-taking option given without a value into `--name=`, and reduce
/// `--switch=value` to the bare switch or nothing, so that none of these abort the
/// run. Subcommand invocations are passed through untouched.
pub fn sanitize_args<I>(raw: I) -> SanitizedArgs
where
    I: IntoIterator<Item = String>,
{
    let mut raw = raw.into_iter();
    let mut args: Vec<String> = raw.by_ref().take(1).collect();
    let rest: Vec<String> = raw.collect();

    let cmd = Cli::command();
    if let Some(first) = rest.first() {
        if cmd.get_subcommands().any(|sub| sub.get_name() == first.as_str()) {
            args.extend(rest);
            return SanitizedArgs {
                args,
                ..SanitizedArgs::default()
            };
        }
    }

    let known: HashMap<String, bool> = cmd
        .get_arguments()
        .filter_map(|arg| {
            arg.get_long()
                .map(|long| (long.to_string(), arg.get_action().takes_values()))
        })
        .chain([("help".to_string(), false)])
        .collect();

    let mut ignored = Vec::new();
    let mut switch_values = Vec::new();
    let mut iter = rest.into_iter().peekable();
    while let Some(current) = iter.next() {
        if current == "--" {
            args.push(current);
            args.extend(iter);
            break;
        }

        let Some(body) = current.strip_prefix("--") else {
            args.push(current);
            continue;
        };

        let (name, inline_value) = match body.split_once('=') {
            Some((name, value)) => (name.to_string(), Some(value)),
            None => (body.to_string(), None),
        };
        let has_inline_value = inline_value.is_some();
        let next_is_value = iter.peek().is_some_and(|next| !next.starts_with("--"));

        match known.get(&name) {
            None => {
                if !has_inline_value && next_is_value {
                    iter.next();
                }
                ignored.push(name);
            }
            Some(true) if !has_inline_value && !next_is_value => {
                args.push(format!("--{name}="));
            }
            Some(false) if has_inline_value => {
                let switch = SwitchValue::new(name, inline_value.unwrap_or_default());
                if switch.enabled {
                    args.push(format!("--{}", switch.name));
                }
                switch_values.push(switch);
            }
            Some(_) => args.push(current),
        }
    }

    SanitizedArgs {
        args,
        ignored,
        switch_values,
    }
}

impl Cli {
    /// Parse an already sanitized argument vector.
    pub fn parse_sanitized(args: &SanitizedArgs) -> Self {
        <Self as Parser>::parse_from(&args.args)
    }
}
