//! nsirun - build and run self-contained application images
//!
//! ## Usage
//!
//! ```sh
//! nsirun build <config.yaml> [--output <file>]
//! nsirun run <image.nsi> [--mem <limit>] [--env KEY=VALUE]... [--id <id>] [--strict]
//! nsirun inspect <image.nsi>
//! ```
//!
//! `run` exits with the container's exit code (`128 + signo` when the
//! container died from a signal). Logging goes to stderr and is filtered
//! by `NSIRUN_LOG` (default `info`).

use nsirun::sandbox::LaunchSpec;
use nsirun::{Image, IntegrityPolicy, build_image, load_image, sandbox};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Build {
        config: PathBuf,
        output: Option<PathBuf>,
    },
    Run {
        image: PathBuf,
        memory_limit: Option<String>,
        env: Vec<String>,
        id: Option<String>,
        strict: bool,
    },
    Inspect {
        image: PathBuf,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "build" => {
            if args.len() < 3 {
                return Err("build requires <config.yaml>".to_string());
            }
            let config = PathBuf::from(&args[2]);
            let mut output = None;
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--output" | "-o" => {
                        if i + 1 < args.len() {
                            output = Some(PathBuf::from(&args[i + 1]));
                            i += 2;
                        } else {
                            return Err("--output requires a path".to_string());
                        }
                    }
                    other => return Err(format!("unknown build option: {}", other)),
                }
            }
            Ok(Command::Build { config, output })
        }
        "run" => {
            if args.len() < 3 {
                return Err("run requires <image.nsi>".to_string());
            }
            let image = PathBuf::from(&args[2]);
            let mut memory_limit = None;
            let mut env = Vec::new();
            let mut id = None;
            let mut strict = false;
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--mem" | "-m" => {
                        if i + 1 < args.len() {
                            memory_limit = Some(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--mem requires a value".to_string());
                        }
                    }
                    "--env" | "-e" => {
                        if i + 1 < args.len() {
                            env.push(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--env requires KEY=VALUE".to_string());
                        }
                    }
                    "--id" | "-g" => {
                        if i + 1 < args.len() {
                            id = Some(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--id requires a value".to_string());
                        }
                    }
                    "--strict" => {
                        strict = true;
                        i += 1;
                    }
                    other => return Err(format!("unknown run option: {}", other)),
                }
            }
            Ok(Command::Run {
                image,
                memory_limit,
                env,
                id,
                strict,
            })
        }
        "inspect" => {
            if args.len() < 3 {
                return Err("inspect requires <image.nsi>".to_string());
            }
            Ok(Command::Inspect {
                image: PathBuf::from(&args[2]),
            })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_build(config: PathBuf, output: Option<PathBuf>) -> Result<(), String> {
    let built = build_image(&config, output.as_deref()).map_err(|e| e.to_string())?;
    eprintln!("Built image {}", built.image_path.display());
    Ok(())
}

/// Parses `KEY=VALUE` entries. Malformed entries are reported and
/// skipped, not fatal.
fn parse_env_overrides(entries: &[String]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.insert(key.to_string(), value.to_string());
            }
            _ => eprintln!("warning: ignoring invalid env var format: {}", entry),
        }
    }
    env
}

fn state_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".nsirun"))
        .unwrap_or_else(|| PathBuf::from(".nsirun"))
}

fn cmd_run(
    image: PathBuf,
    memory_limit: Option<String>,
    env: Vec<String>,
    id: Option<String>,
    strict: bool,
) -> Result<i32, String> {
    let container_id =
        id.unwrap_or_else(|| format!("nsi-{}", uuid::Uuid::now_v7().simple()));
    let policy = if strict {
        IntegrityPolicy::Strict
    } else {
        IntegrityPolicy::Warn
    };

    let rootfs_dir = state_root().join("rootfs").join(&container_id);
    let loaded = load_image(&image, &rootfs_dir, policy).map_err(|e| e.to_string())?;

    let mut spec = LaunchSpec::from_header(&loaded.header, loaded.rootfs, container_id);
    spec.env_override = parse_env_overrides(&env);
    spec.memory_limit = memory_limit;

    sandbox::launch(&spec).map_err(|e| e.to_string())
}

fn cmd_inspect(image: PathBuf) -> Result<(), String> {
    let image = Image::open(&image).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(image.header()).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn cmd_version() {
    println!("nsirun version {}", env!("CARGO_PKG_VERSION"));
    println!(
        "image format: {} v{}",
        String::from_utf8_lossy(&nsirun::constants::IMAGE_MAGIC),
        nsirun::constants::IMAGE_FORMAT_VERSION
    );
}

fn cmd_help() {
    println!(
        r#"nsirun - build and run self-contained application images

USAGE:
    nsirun <command> [options]

COMMANDS:
    build <config.yaml>      Build an image from a source tree
    run <image.nsi>          Run an image in an isolated sandbox
    inspect <image.nsi>      Print an image's header as JSON
    version                  Show version info
    help                     Show this help

OPTIONS:
    --output, -o <file>      (build) Output path for the image
    --mem, -m <limit>        (run) memory.max value: bytes or 'max'
    --env, -e KEY=VALUE      (run) Environment override, repeatable
    --id, -g <id>            (run) Container id (also the hostname)
    --strict                 (run) Fail on payload hash mismatch

EXAMPLES:
    nsirun build app.yaml
    nsirun run h-0.1.nsi --mem 268435456 --env MODE=debug
    nsirun inspect h-0.1.nsi
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("NSIRUN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logging();

    match parse_args() {
        Ok(Command::Build { config, output }) => match cmd_build(config, output) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        },
        Ok(Command::Run {
            image,
            memory_limit,
            env,
            id,
            strict,
        }) => match cmd_run(image, memory_limit, env, id, strict) {
            // The container's exit code is the tool's exit code.
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        },
        Ok(Command::Inspect { image }) => match cmd_inspect(image) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        },
        Ok(Command::Version) => {
            cmd_version();
            ExitCode::SUCCESS
        }
        Ok(Command::Help) => {
            cmd_help();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
