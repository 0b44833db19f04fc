mod archive;
mod checksum;
mod config;
mod error;
mod fetch;
mod install;
mod jvm;
mod logs;
mod process;
mod supervisor;
mod version;

use clap::{Parser, Subcommand};
use config::{config_get, config_set, resolve_home, Store};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use error::FgError;
use fetch::{HttpFetcher, RetryPolicy};
use install::{InstallOptions, ListOptions};
use jvm::JavaCommand;
use logs::{DEFAULT_TAIL_LINES, FOLLOW_POLL_INTERVAL};
use process::SystemProcessControl;
use serde::Serialize;
use serde_json::json;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;
use supervisor::{
    StartRequest, StopFilter, StopOptions, DEFAULT_STOP_TIMEOUT, STOP_POLL_INTERVAL,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fg",
    version,
    about = "FHIR Guard version manager and process supervisor"
)]
struct Cli {
    /// Data directory (default: $FG_HOME or ~/.fhir-guard)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and install a server version
    Install {
        version: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_deps: bool,
        #[arg(long)]
        verify: bool,
    },
    Uninstall {
        version: String,
        #[arg(long, short)]
        yes: bool,
    },
    /// Install the given version, or the newest published one
    Update {
        version: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_deps: bool,
        #[arg(long)]
        verify: bool,
    },
    List {
        #[arg(long)]
        remote: bool,
        #[arg(long, conflicts_with = "remote")]
        all: bool,
        #[arg(long)]
        latest: bool,
    },
    Start {
        version: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long = "jvm-args", allow_hyphen_values = true)]
        jvm_args: Option<String>,
        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[arg(long, short)]
        background: bool,
    },
    /// Stop instances; no version (or "all") matches every version
    Stop {
        version: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        force: bool,
        /// Seconds to wait after SIGTERM before killing
        #[arg(long, default_value_t = DEFAULT_STOP_TIMEOUT.as_secs())]
        timeout: u64,
    },
    Status,
    Logs {
        version: Option<String>,
        #[arg(long, short)]
        follow: bool,
        #[arg(long, short = 'n', default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
        #[arg(long)]
        port: Option<u16>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    Path,
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    home: PathBuf,
    json: bool,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing(verbose: bool, log_level: Option<&str>) {
    let level = if verbose {
        "debug"
    } else {
        log_level.unwrap_or("warn")
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fg={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<(), FgError> {
    let cli = Cli::parse();
    let ctx = Context {
        home: resolve_home(cli.home.as_ref()),
        json: cli.json,
    };
    let store = Store::load(&ctx.home);
    init_tracing(
        cli.verbose,
        store.as_ref().ok().map(|store| store.config.log_level.as_str()),
    );

    let result = store.and_then(|mut store| dispatch(&ctx, &mut store, cli.command));
    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_code: Some(err.code().to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{} {err}", style("error:").red().bold());
        }
        std::process::exit(1);
    }
    Ok(())
}

fn dispatch(ctx: &Context, store: &mut Store, command: Commands) -> Result<(), FgError> {
    match command {
        Commands::Install {
            version,
            force,
            skip_deps,
            verify,
        } => handle_install(
            ctx,
            store,
            Some(version),
            InstallOptions {
                force,
                skip_deps,
                verify,
            },
            false,
        ),
        Commands::Update {
            version,
            force,
            skip_deps,
            verify,
        } => handle_install(
            ctx,
            store,
            version,
            InstallOptions {
                force,
                skip_deps,
                verify,
            },
            true,
        ),
        Commands::Uninstall { version, yes } => handle_uninstall(ctx, store, &version, yes),
        Commands::List {
            remote,
            all,
            latest,
        } => handle_list(
            ctx,
            store,
            ListOptions {
                remote,
                all,
                latest,
            },
        ),
        Commands::Start {
            version,
            port,
            host,
            jvm_args,
            env,
            background,
        } => handle_start(
            ctx,
            store,
            StartRequest {
                version,
                port,
                host,
                jvm_args,
                env,
                background,
            },
        ),
        Commands::Stop {
            version,
            port,
            force,
            timeout,
        } => handle_stop(ctx, store, version, port, force, timeout),
        Commands::Status => handle_status(ctx, store),
        Commands::Logs {
            version,
            follow,
            lines,
            port,
        } => handle_logs(ctx, store, version, follow, lines, port),
        Commands::Config { command } => handle_config(ctx, store, command),
    }
}

fn print_warnings(ctx: &Context, warnings: &[String]) {
    if ctx.json {
        return;
    }
    for warning in warnings {
        eprintln!("{} {warning}", style("warning:").yellow().bold());
    }
}

fn handle_install(
    ctx: &Context,
    store: &mut Store,
    version: Option<String>,
    options: InstallOptions,
    update: bool,
) -> Result<(), FgError> {
    let fetcher = HttpFetcher::new(RetryPolicy::ARTIFACT)?;
    let runtime = JavaCommand::from_config(&store.config.java);
    let outcome = if update {
        install::update(store, &fetcher, &runtime, version.as_deref(), options)?
    } else {
        let version = version.unwrap_or_default();
        install::install(store, &fetcher, &runtime, &version, options)?
    };
    print_warnings(ctx, &outcome.warnings);
    let text = if outcome.already_installed {
        format!(
            "version {} is already installed (use --force to reinstall)",
            outcome.version
        )
    } else {
        let mut text = format!(
            "installed version {} ({} bytes) at {}",
            outcome.version,
            outcome.bytes,
            outcome.artifact.display()
        );
        if outcome.dependencies_fetched + outcome.dependencies_skipped > 0 {
            text.push_str(&format!(
                "\ndependencies: {} fetched, {} already present",
                outcome.dependencies_fetched, outcome.dependencies_skipped
            ));
        }
        text
    };
    output(ctx, serde_json::to_value(&outcome)?, text)
}

fn handle_uninstall(
    ctx: &Context,
    store: &mut Store,
    version: &str,
    yes: bool,
) -> Result<(), FgError> {
    version::validate_version(version)?;
    if !yes {
        if !io::stdin().is_terminal() {
            return Err(FgError::Config(
                "uninstall requires --yes when not run interactively".to_string(),
            ));
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Remove FHIR Guard {version} and its files?"))
            .default(false)
            .interact()?;
        if !confirmed {
            return output(
                ctx,
                json!({"version": version, "removed": false}),
                "uninstall cancelled".to_string(),
            );
        }
    }
    let outcome = install::uninstall(store, &SystemProcessControl, version)?;
    print_warnings(ctx, &outcome.warnings);
    output(
        ctx,
        serde_json::to_value(&outcome)?,
        format!("uninstalled version {version}"),
    )
}

fn handle_list(ctx: &Context, store: &Store, options: ListOptions) -> Result<(), FgError> {
    let fetcher = HttpFetcher::new(RetryPolicy::INDEX)?;
    let versions = install::list_versions(store, &fetcher, options)?;
    let text = if versions.is_empty() {
        "no versions found".to_string()
    } else {
        versions
            .iter()
            .map(|entry| {
                let mut line = entry.version.clone();
                if entry.installed && (options.remote || options.all) {
                    line.push_str("  (installed)");
                }
                if let Some(date) = entry.release_date {
                    line.push_str(&format!("  released {}", date.format("%Y-%m-%d")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    output(ctx, json!({ "versions": versions }), text)
}

fn handle_start(ctx: &Context, store: &mut Store, request: StartRequest) -> Result<(), FgError> {
    let runtime = JavaCommand::from_config(&store.config.java);
    let background = request.background;
    let outcome = supervisor::start(store, &SystemProcessControl, &runtime, &request)?;
    print_warnings(ctx, &outcome.warnings);
    let text = if background {
        format!(
            "started {} (pid {})\nlog: {}",
            outcome.key,
            outcome.pid,
            outcome.log_file.display()
        )
    } else {
        format!("{} exited", outcome.key)
    };
    output(ctx, serde_json::to_value(&outcome)?, text)
}

fn handle_stop(
    ctx: &Context,
    store: &mut Store,
    version: Option<String>,
    port: Option<u16>,
    force: bool,
    timeout: u64,
) -> Result<(), FgError> {
    let version = version.filter(|value| value != "all");
    if let Some(version) = version.as_deref() {
        version::validate_version(version)?;
    }
    let filter = StopFilter { version, port };
    let options = StopOptions {
        force,
        timeout: Duration::from_secs(timeout),
        poll_interval: STOP_POLL_INTERVAL,
    };
    let summary = supervisor::stop(store, &SystemProcessControl, &filter, &options);
    print_warnings(ctx, &summary.warnings);
    let text = if summary.instances.is_empty() {
        "no matching instances".to_string()
    } else {
        let mut lines: Vec<String> = summary
            .instances
            .iter()
            .map(|outcome| match &outcome.error {
                None => format!("stopped {} (pid {})", outcome.key, outcome.pid),
                Some(err) => format!("failed {} (pid {}): {err}", outcome.key, outcome.pid),
            })
            .collect();
        lines.push(format!(
            "{} stopped, {} failed",
            summary.stopped, summary.failed
        ));
        lines.join("\n")
    };
    output(ctx, serde_json::to_value(&summary)?, text)?;
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_status(ctx: &Context, store: &mut Store) -> Result<(), FgError> {
    let report = supervisor::status(store, &SystemProcessControl);
    print_warnings(ctx, &report.warnings);
    let text = if report.instances.is_empty() {
        "no running instances".to_string()
    } else {
        let mut lines = vec![format!(
            "{:<18} {:>8} {:>7} {:>10} {:>10}  {}",
            "INSTANCE", "PID", "CPU%", "MEM(MB)", "UPTIME", "COMMAND"
        )];
        for row in &report.instances {
            lines.push(format!(
                "{:<18} {:>8} {:>7.1} {:>10.1} {:>10}  {}",
                row.key, row.pid, row.cpu_percent, row.memory_mb, row.uptime, row.command_line
            ));
        }
        lines.join("\n")
    };
    output(ctx, serde_json::to_value(&report)?, text)
}

fn handle_logs(
    ctx: &Context,
    store: &Store,
    version: Option<String>,
    follow: bool,
    lines: usize,
    port: Option<u16>,
) -> Result<(), FgError> {
    let version = match version {
        Some(version) => {
            version::validate_version(&version)?;
            version
        }
        None => logs::latest_live_version(&store.instances, &SystemProcessControl).ok_or_else(
            || FgError::LogNotFound("no running instance; pass a version".to_string()),
        )?,
    };
    let path = logs::locate_latest_log(&store.paths.log_dir(&version), &version, port)?;
    if follow {
        let mut stdout = io::stdout();
        return logs::follow(&path, lines, FOLLOW_POLL_INTERVAL, &mut stdout);
    }
    let (tail, _) = logs::read_tail(&path, lines)?;
    if ctx.json {
        let text = String::from_utf8_lossy(&tail);
        let tail_lines: Vec<&str> = text.lines().collect();
        return output(ctx, json!({"path": path, "lines": tail_lines}), String::new());
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(&tail)?;
    stdout.flush()?;
    Ok(())
}

fn handle_config(ctx: &Context, store: &mut Store, command: ConfigCommand) -> Result<(), FgError> {
    match command {
        ConfigCommand::Show => {
            let text = serde_yaml::to_string(&store.config)?;
            output(ctx, serde_json::to_value(&store.config)?, text)
        }
        ConfigCommand::Path => {
            let path = store.paths.config_path.clone();
            output(
                ctx,
                json!({"path": path, "home": store.paths.home}),
                path.display().to_string(),
            )
        }
        ConfigCommand::Get { key } => {
            let value = config_get(&store.config, &key)?;
            let text = serde_yaml::to_string(&value)?.trim_end().to_string();
            output(ctx, json!({"key": key, "value": value}), text)
        }
        ConfigCommand::Set { key, value } => {
            let updated = config_set(&store.config, &key, &value)?;
            store.config = updated;
            store.save_config()?;
            let value = config_get(&store.config, &key)?;
            let text = format!("{key} = {}", serde_yaml::to_string(&value)?.trim_end());
            output(ctx, json!({"key": key, "value": value}), text)
        }
    }
}

fn output(ctx: &Context, payload: serde_json::Value, text: String) -> Result<(), FgError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_code: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{text}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), FgError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        assert_eq!(
            parse_env_pair("JAVA_OPTS=-Da=b=c").unwrap(),
            ("JAVA_OPTS".to_string(), "-Da=b=c".to_string())
        );
        assert!(parse_env_pair("NOVALUE").is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn cli_parses_start_flags() {
        let cli = Cli::try_parse_from([
            "fg",
            "start",
            "1.2.3",
            "--port",
            "9090",
            "--jvm-args",
            "-Xmx2g -Dfoo=bar",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "--background",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                version,
                port,
                jvm_args,
                env,
                background,
                ..
            } => {
                assert_eq!(version, "1.2.3");
                assert_eq!(port, Some(9090));
                assert_eq!(jvm_args.as_deref(), Some("-Xmx2g -Dfoo=bar"));
                assert_eq!(env.len(), 2);
                assert!(background);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_defaults_logs_and_stop() {
        let cli = Cli::try_parse_from(["fg", "logs"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Logs {
                lines: DEFAULT_TAIL_LINES,
                follow: false,
                ..
            }
        ));
        let cli = Cli::try_parse_from(["fg", "--json", "stop", "all"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Stop { timeout: 30, .. }));
    }
}
