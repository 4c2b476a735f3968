//! `ysfn` - build a stream function, run it in its runtime and bridge it to
//! the dispatcher.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ysfn::{
    BridgeConfig, BridgeError, CommandRuntime, DefinitionSource, DevRemoteConnector,
    NodejsRuntime, PackageManager, SfnRuntime, Supervisor, TaggedFrame, WrapperTemplate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeKind {
    Nodejs,
    Command,
}

#[derive(Debug, PartialEq)]
struct Args {
    /// TypeScript entry file, or the run command line for `--runtime command`.
    entry: String,
    runtime: RuntimeKind,
    package_manager: PackageManager,
    template: Option<PathBuf>,
    work_dir: PathBuf,
    install: Option<String>,
    compile: Option<String>,
    definition_file: Option<PathBuf>,
    definition: Option<DefinitionSource>,
    accept_timeout: Option<Duration>,
    dev_events: Vec<TaggedFrame>,
    dev_interval: Option<Duration>,
}

fn print_usage() {
    eprintln!("Usage: ysfn run <entry> [options]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <entry>                    TypeScript entry file, or the run command line");
    eprintln!("                             for --runtime command");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --runtime <kind>           nodejs or command [default: nodejs]");
    eprintln!("  --package-manager <pm>     pnpm or npm [default: pnpm]");
    eprintln!("  --template <file>          Wrapper template used to generate .wrapper.ts");
    eprintln!("  --work-dir <dir>           Working directory for --runtime command [default: .]");
    eprintln!("  --install <cmd>            Dependency install command (--runtime command)");
    eprintln!("  --compile <cmd>            Compile command (--runtime command)");
    eprintln!("  --definition-file <file>   Definition file in the working directory (--runtime command)");
    eprintln!("  --definition <source>      in-band or work-dir [default: in-band]");
    eprintln!("  --accept-timeout <secs>    Fail if the child does not connect in time");
    eprintln!("  --dev-event <tag:payload>  Event replayed by the dev remote (repeatable)");
    eprintln!("  --dev-interval <secs>      Delay between dev events [default: 2]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  YOMO_SFN_NAME, YOMO_SFN_ZIPPER, YOMO_SFN_CREDENTIAL,");
    eprintln!("  YSFN_ACCEPT_TIMEOUT_SECS, YSFN_SHUTDOWN_GRACE_SECS,");
    eprintln!("  YSFN_LOG (debug|info|warn|error), RUST_LOG, LOG_FORMAT=json");
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    match run(args).await {
        Ok(termination) => {
            tracing::debug!(?termination, "Exiting");
        }
        Err(e) => {
            match e.downcast_ref::<BridgeError>() {
                Some(bridge) => eprintln!("error: {}", bridge.diagnostic()),
                None => eprintln!("error: {e:#}"),
            }
            process::exit(1);
        }
    }
}

/// Initialize tracing. `RUST_LOG` wins over `YSFN_LOG`; `LOG_FORMAT=json`
/// switches to JSON lines. Logs go to stderr so the child's stdout stays
/// readable.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("YSFN_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("ysfn={level},ysfn_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_seconds(flag: &str, value: &str) -> Result<Duration, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| format!("{flag} expects a number of seconds, got '{value}'"))
}

fn parse_dev_event(value: &str) -> Result<TaggedFrame, String> {
    let (tag, payload) = value
        .split_once(':')
        .ok_or_else(|| format!("--dev-event expects <tag>:<payload>, got '{value}'"))?;
    let tag = tag
        .parse::<u32>()
        .map_err(|_| format!("--dev-event tag must be a u32, got '{tag}'"))?;
    Ok(TaggedFrame::new(tag, payload.as_bytes().to_vec()))
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut rest = args.iter().skip(1);
    match rest.next().map(String::as_str) {
        Some("run") => {}
        Some("--help" | "-h") | None => return Err(String::new()),
        Some(other) => return Err(format!("unknown command: {other}")),
    }

    let mut entry: Option<String> = None;
    let mut parsed = Args {
        entry: String::new(),
        runtime: RuntimeKind::Nodejs,
        package_manager: PackageManager::default(),
        template: None,
        work_dir: PathBuf::from("."),
        install: None,
        compile: None,
        definition_file: None,
        definition: None,
        accept_timeout: None,
        dev_events: Vec::new(),
        dev_interval: None,
    };

    while let Some(arg) = rest.next() {
        let mut value = |flag: &str| {
            rest.next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--runtime" => {
                parsed.runtime = match value("--runtime")?.as_str() {
                    "nodejs" => RuntimeKind::Nodejs,
                    "command" => RuntimeKind::Command,
                    other => {
                        return Err(format!(
                            "invalid runtime '{other}', expected 'nodejs' or 'command'"
                        ));
                    }
                }
            }
            "--package-manager" => {
                parsed.package_manager = value("--package-manager")?.parse()?;
            }
            "--template" => parsed.template = Some(PathBuf::from(value("--template")?)),
            "--work-dir" => parsed.work_dir = PathBuf::from(value("--work-dir")?),
            "--install" => parsed.install = Some(value("--install")?),
            "--compile" => parsed.compile = Some(value("--compile")?),
            "--definition-file" => {
                parsed.definition_file = Some(PathBuf::from(value("--definition-file")?));
            }
            "--definition" => parsed.definition = Some(value("--definition")?.parse()?),
            "--accept-timeout" => {
                let v = value("--accept-timeout")?;
                parsed.accept_timeout = Some(parse_seconds("--accept-timeout", &v)?);
            }
            "--dev-event" => parsed.dev_events.push(parse_dev_event(&value("--dev-event")?)?),
            "--dev-interval" => {
                let v = value("--dev-interval")?;
                parsed.dev_interval = Some(parse_seconds("--dev-interval", &v)?);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if entry.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                entry = Some(arg.to_string());
            }
        }
    }

    parsed.entry = entry.ok_or("missing required argument: <entry>")?;

    match parsed.runtime {
        RuntimeKind::Nodejs => {
            if parsed.install.is_some() || parsed.compile.is_some() {
                return Err("--install and --compile require --runtime command".to_string());
            }
        }
        RuntimeKind::Command => {
            if parsed.template.is_some() {
                return Err("--template requires --runtime nodejs".to_string());
            }
        }
    }
    Ok(parsed)
}

fn build_runtime(args: &Args, config: &BridgeConfig) -> anyhow::Result<Arc<dyn SfnRuntime>> {
    match args.runtime {
        RuntimeKind::Nodejs => {
            let mut runtime = NodejsRuntime::new(&args.entry)?
                .with_package_manager(args.package_manager);
            if let Some(path) = &args.template {
                let template = WrapperTemplate::from_file(path)
                    .with_context(|| format!("failed to read template {}", path.display()))?;
                let name = match &config.function_name {
                    Some(name) => name.clone(),
                    None => PathBuf::from(&args.entry)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                };
                runtime = runtime.with_wrapper(template, name);
            }
            Ok(Arc::new(runtime))
        }
        RuntimeKind::Command => {
            let mut runtime = CommandRuntime::from_command_line(&args.work_dir, &args.entry)
                .context("run command line is empty")?;
            if let Some(line) = &args.install {
                runtime = runtime.with_install_line(line);
            }
            if let Some(line) = &args.compile {
                runtime = runtime.with_compile_line(line);
            }
            if let Some(file) = &args.definition_file {
                runtime = runtime.with_definition_file(file);
            }
            Ok(Arc::new(runtime))
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ysfn::Termination> {
    let mut config = BridgeConfig::from_env()?;
    if args.accept_timeout.is_some() {
        config = config.with_accept_timeout(args.accept_timeout);
    }
    if let Some(source) = args.definition {
        config = config.with_definition_source(source);
    }
    tracing::debug!(?config, "Loaded configuration");

    let runtime = build_runtime(&args, &config)?;

    let mut connector = DevRemoteConnector::new(args.dev_events.clone());
    if let Some(interval) = args.dev_interval {
        connector = connector.with_interval(interval);
    }

    let supervisor = Supervisor::new(runtime, Arc::new(connector), config);
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            shutdown.trigger();
        }
    });

    Ok(supervisor.run().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("ysfn")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_nodejs_defaults() {
        let args = parse_args(&argv(&["run", "src/app.ts"])).unwrap();
        assert_eq!(args.entry, "src/app.ts");
        assert_eq!(args.runtime, RuntimeKind::Nodejs);
        assert_eq!(args.package_manager, PackageManager::Pnpm);
        assert_eq!(args.definition, None);
        assert!(args.dev_events.is_empty());
    }

    #[test]
    fn parses_dev_events_and_timeouts() {
        let args = parse_args(&argv(&[
            "run",
            "app.ts",
            "--dev-event",
            "1:ping",
            "--dev-event",
            "2:a:b",
            "--dev-interval",
            "0.5",
            "--accept-timeout",
            "30",
            "--definition",
            "work-dir",
        ]))
        .unwrap();
        assert_eq!(
            args.dev_events,
            vec![
                TaggedFrame::new(1, &b"ping"[..]),
                TaggedFrame::new(2, &b"a:b"[..])
            ]
        );
        assert_eq!(args.dev_interval, Some(Duration::from_millis(500)));
        assert_eq!(args.accept_timeout, Some(Duration::from_secs(30)));
        assert_eq!(args.definition, Some(DefinitionSource::WorkDir));
    }

    #[test]
    fn parses_command_runtime() {
        let args = parse_args(&argv(&[
            "run",
            "python3 app.py",
            "--runtime",
            "command",
            "--work-dir",
            "fn",
            "--install",
            "pip install -r requirements.txt",
        ]))
        .unwrap();
        assert_eq!(args.runtime, RuntimeKind::Command);
        assert_eq!(args.entry, "python3 app.py");
        assert_eq!(args.work_dir, PathBuf::from("fn"));
        assert_eq!(
            args.install.as_deref(),
            Some("pip install -r requirements.txt")
        );
    }

    #[test]
    fn usage_errors() {
        let err = |a: &[&str]| parse_args(&argv(a)).unwrap_err();

        assert_eq!(err(&[]), "");
        insta::assert_snapshot!(err(&["serve"]), @"unknown command: serve");
        insta::assert_snapshot!(err(&["run"]), @"missing required argument: <entry>");
        insta::assert_snapshot!(err(&["run", "a.ts", "--bogus"]), @"unknown flag: --bogus");
        insta::assert_snapshot!(err(&["run", "a.ts", "--runtime"]), @"--runtime requires a value");
        insta::assert_snapshot!(
            err(&["run", "a.ts", "--dev-event", "x:ping"]),
            @"--dev-event tag must be a u32, got 'x'"
        );
        insta::assert_snapshot!(
            err(&["run", "a.ts", "--accept-timeout", "-1"]),
            @"--accept-timeout expects a number of seconds, got '-1'"
        );
        insta::assert_snapshot!(
            err(&["run", "a.ts", "--install", "npm ci"]),
            @"--install and --compile require --runtime command"
        );
    }

    #[test]
    fn unsupported_entry_is_rejected_before_running() {
        let args = parse_args(&argv(&["run", "main.go"])).unwrap();
        let err = build_runtime(&args, &BridgeConfig::default())
            .err()
            .unwrap();
        insta::assert_snapshot!(
            err.to_string(),
            @"only TypeScript entry files are supported, got main.go"
        );
    }
}
