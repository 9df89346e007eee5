mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use walkdir::WalkDir;

use nullweave_engine::{scan_unit, Engine};
use nullweave_ir::{disasm, Unit};

/// Suffix of compiled unit files inside a container tree.
const UNIT_EXT: &str = "nwu";

/// Build a long version string: "0.1.0 (abc12345)"
fn long_version() -> &'static str {
    // Use Box::leak to get a 'static str — fine for a one-time allocation
    let s = format!("{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    Box::leak(s.into_boxed_str())
}

#[derive(Parser)]
#[command(name = "nullweave")]
#[command(about = "Rewrites marked operation chains in compiled units to be null-safe")]
#[command(version, long_version = long_version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite marker calls into null-propagating guards
    Rewrite {
        /// A .nwu file or a container directory
        input: PathBuf,
        /// Output file or directory (mirrors the input layout)
        output: PathBuf,
        /// On a per-unit failure, pass the original bytes through instead
        /// of aborting
        #[arg(long)]
        keep_going: bool,
        /// Dump each rewritten unit's disassembly to the log
        #[arg(long)]
        trace: bool,
        /// Extra excluded namespace prefix (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// List the routines whose bodies contain marker calls
    Scan {
        /// .nwu files or container directories
        inputs: Vec<PathBuf>,
        /// Emit one JSON object per unit instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print a unit's disassembly
    Dump {
        /// A .nwu file
        input: PathBuf,
    },
    /// Write a default nullweave.toml into the current directory
    Init,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let debug = matches!(&cli.command, Commands::Rewrite { trace: true, .. });
    // Log to stderr so stdout stays clean for scan --json and dump output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    match cli.command {
        Commands::Rewrite {
            input,
            output,
            keep_going,
            trace,
            exclude,
        } => run_rewrite(&input, &output, keep_going, trace, &exclude),
        Commands::Scan { inputs, json } => run_scan(&inputs, json),
        Commands::Dump { input } => run_dump(&input),
        Commands::Init => run_init(),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    rewritten: usize,
    unchanged: usize,
    failed: usize,
    /// Non-unit container entries copied through as-is.
    copied: usize,
}

fn format_summary(s: &Summary) -> String {
    let base = format!(
        "{} rewritten, {} unchanged, {} failed",
        s.rewritten, s.unchanged, s.failed
    );
    if s.copied > 0 {
        format!("{base}, {} other entries copied", s.copied)
    } else {
        base
    }
}

fn run_rewrite(
    input: &Path,
    output: &Path,
    keep_going: bool,
    trace: bool,
    extra_exclude: &[String],
) -> ExitCode {
    let start = if input.is_dir() {
        input.to_path_buf()
    } else {
        input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    };
    let cfg = config::load_config(&start);
    let keep_going = keep_going || cfg.rewrite.keep_going;
    let engine = Engine::new(cfg.to_options(trace, extra_exclude));

    let result = if input.is_dir() {
        rewrite_tree(&engine, input, output, keep_going)
    } else {
        rewrite_file(&engine, input, output, keep_going)
    };

    match result {
        Ok(summary) => {
            println!("{}", format_summary(&summary));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Rewrite a single unit file into `output`.
fn rewrite_file(
    engine: &Engine,
    input: &Path,
    output: &Path,
    keep_going: bool,
) -> anyhow::Result<Summary> {
    let bytes = std::fs::read(input).with_context(|| format!("read {}", input.display()))?;
    // A unit names itself in its header; fall back to the file stem when the
    // header cannot be decoded so the error still points somewhere.
    let name = embedded_unit_name(&bytes, input);
    let mut summary = Summary::default();
    let out_bytes = process_unit(engine, &name, bytes, keep_going, &mut summary)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(output, out_bytes).with_context(|| format!("write {}", output.display()))?;
    Ok(summary)
}

/// Walk a container tree, rewriting every `.nwu` entry and copying everything
/// else through unchanged, mirroring the layout under `output`.
fn rewrite_tree(
    engine: &Engine,
    input: &Path,
    output: &Path,
    keep_going: bool,
) -> anyhow::Result<Summary> {
    let mut summary = Summary::default();
    for entry in WalkDir::new(input).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(input)
            .with_context(|| format!("walk {}", entry.path().display()))?;
        let dest = output.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some(UNIT_EXT) {
            std::fs::copy(entry.path(), &dest)
                .with_context(|| format!("copy {}", entry.path().display()))?;
            summary.copied += 1;
            continue;
        }
        let name = unit_name_from_rel(rel);
        if engine.options().is_excluded(&name) {
            // Excluded namespaces pass through without even being read.
            std::fs::copy(entry.path(), &dest)
                .with_context(|| format!("copy {}", entry.path().display()))?;
            summary.unchanged += 1;
            continue;
        }
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("read {}", entry.path().display()))?;
        let out_bytes = process_unit(engine, &name, bytes, keep_going, &mut summary)?;
        std::fs::write(&dest, out_bytes).with_context(|| format!("write {}", dest.display()))?;
    }
    Ok(summary)
}

/// Run one unit through the engine. On failure, either abort or (with
/// keep-going) log and return the original bytes untouched.
fn process_unit(
    engine: &Engine,
    name: &str,
    bytes: Vec<u8>,
    keep_going: bool,
    summary: &mut Summary,
) -> anyhow::Result<Vec<u8>> {
    match engine.rewrite_unit(name, &bytes) {
        Ok(Some(out)) => {
            summary.rewritten += 1;
            Ok(out)
        }
        Ok(None) => {
            summary.unchanged += 1;
            Ok(bytes)
        }
        Err(e) if keep_going => {
            tracing::warn!(unit = name, error = %e, "passing original bytes through");
            summary.failed += 1;
            Ok(bytes)
        }
        Err(e) => Err(e.into()),
    }
}

/// "app/main.nwu" becomes "app/main", with platform separators normalized.
fn unit_name_from_rel(rel: &Path) -> String {
    let s = rel.to_string_lossy().replace('\\', "/");
    match s.strip_suffix(".nwu") {
        Some(stripped) => stripped.to_string(),
        None => s,
    }
}

fn embedded_unit_name(bytes: &[u8], path: &Path) -> String {
    match Unit::decode(bytes) {
        Ok(unit) => unit.name_str().to_string(),
        Err(_) => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<unit>".to_string()),
    }
}

fn run_scan(inputs: &[PathBuf], json: bool) -> ExitCode {
    if inputs.is_empty() {
        eprintln!("Give at least one .nwu file or directory to scan");
        return ExitCode::from(2);
    }
    match scan_paths(inputs, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn scan_paths(inputs: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file()
                    && entry.path().extension().and_then(|e| e.to_str()) == Some(UNIT_EXT)
                {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(input.clone());
        }
    }

    for path in files {
        let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let unit =
            Unit::decode(&bytes).with_context(|| format!("decode {}", path.display()))?;
        let flagged =
            scan_unit(&unit).with_context(|| format!("scan {}", path.display()))?;
        if json {
            let pairs: Vec<_> = flagged
                .iter()
                .map(|(routine, signature)| {
                    serde_json::json!({ "routine": routine, "signature": signature })
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({ "unit": unit.name_str(), "flagged": pairs })
            );
        } else {
            for (routine, signature) in &flagged {
                println!("{}: {routine} {signature}", unit.name_str());
            }
        }
    }
    Ok(())
}

fn run_dump(input: &Path) -> ExitCode {
    match dump_unit(input) {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn dump_unit(input: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(input).with_context(|| format!("read {}", input.display()))?;
    let unit = Unit::decode(&bytes).with_context(|| format!("decode {}", input.display()))?;
    Ok(disasm::render_unit(&unit)?)
}

fn run_init() -> ExitCode {
    let config_path = "nullweave.toml";
    if Path::new(config_path).exists() {
        eprintln!("nullweave.toml already exists");
        return ExitCode::from(2);
    }

    match std::fs::write(config_path, config::DEFAULT_CONFIG_TOML) {
        Ok(()) => {
            println!("Created nullweave.toml");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nullweave_ir::VERSION_MODERN;

    #[test]
    fn unit_names_come_from_the_relative_path() {
        assert_eq!(unit_name_from_rel(Path::new("app/main.nwu")), "app/main");
        assert_eq!(
            unit_name_from_rel(Path::new("core\\fmt\\Writer.nwu")),
            "core/fmt/Writer"
        );
        assert_eq!(unit_name_from_rel(Path::new("plain")), "plain");
    }

    #[test]
    fn single_files_use_the_embedded_unit_name() {
        let unit = Unit::new(VERSION_MODERN, "app/main");
        let bytes = unit.encode();
        assert_eq!(
            embedded_unit_name(&bytes, Path::new("/tmp/whatever.nwu")),
            "app/main"
        );
    }

    #[test]
    fn undecodable_files_fall_back_to_the_file_stem() {
        assert_eq!(
            embedded_unit_name(&[0xde, 0xad], Path::new("dir/broken.nwu")),
            "broken"
        );
    }

    #[test]
    fn summary_line_mentions_copies_only_when_present() {
        let mut s = Summary {
            rewritten: 3,
            unchanged: 97,
            failed: 0,
            copied: 0,
        };
        assert_eq!(format_summary(&s), "3 rewritten, 97 unchanged, 0 failed");
        s.copied = 2;
        assert_eq!(
            format_summary(&s),
            "3 rewritten, 97 unchanged, 0 failed, 2 other entries copied"
        );
    }
}
