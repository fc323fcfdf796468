//! CLI entrypoint for the poolmalloc harness.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use poolmalloc_core::{Allocator, AllocatorConfig, EventLevel, JsonLinesSink};
use poolmalloc_harness::{StressConfig, run_stress};

/// Stress and inspection tooling for poolmalloc.
#[derive(Debug, Parser)]
#[command(name = "poolmalloc-harness")]
#[command(about = "Stress workloads and reporting for poolmalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Markdown,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<Level> for EventLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace => Self::Trace,
            Level::Debug => Self::Debug,
            Level::Info => Self::Info,
            Level::Warn => Self::Warn,
            Level::Error => Self::Error,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a multi-threaded allocate/free workload and report on it.
    Stress {
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Allocations per thread.
        #[arg(long, default_value_t = 10_000)]
        iterations: usize,
        /// Smallest request size in bytes.
        #[arg(long, default_value_t = 1)]
        min_size: usize,
        /// Largest request size in bytes.
        #[arg(long, default_value_t = 2048)]
        max_size: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF", value_parser = parse_seed)]
        seed: u64,
        /// Keep one block allocated every N iterations (0 = never).
        #[arg(long, default_value_t = 0)]
        keep_every: usize,
        /// Most blocks a worker holds at once.
        #[arg(long, default_value_t = 64)]
        max_live: usize,
        /// Report format.
        #[arg(long, value_enum, default_value = "markdown")]
        format: Format,
        /// Write allocator events as JSON lines to this path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Minimum level written to the event log.
        #[arg(long, value_enum, default_value = "info")]
        log_level: Level,
        /// Run maintenance once after the workload.
        #[arg(long)]
        cleanup: bool,
    },
    /// Print the configuration resolved from POOLMALLOC_* variables as JSON.
    Config,
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|e| format!("invalid seed {raw:?}: {e}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            iterations,
            min_size,
            max_size,
            seed,
            keep_every,
            max_live,
            format,
            log,
            log_level,
            cleanup,
        } => {
            let workload = StressConfig {
                threads,
                iterations,
                min_size,
                max_size,
                seed,
                keep_every,
                max_live,
            };
            let config = AllocatorConfig::from_env()?;

            let sink = match &log {
                Some(path) => Some(Arc::new(JsonLinesSink::new(
                    BufWriter::new(File::create(path)?),
                    log_level.into(),
                ))),
                None => None,
            };
            let mut builder = Allocator::builder(config);
            if let Some(sink) = &sink {
                builder = builder.event_sink(sink.clone());
            }
            let allocator = builder.build()?;

            let report = run_stress(&allocator, &workload)?;
            if cleanup {
                let pass = allocator.cleanup();
                eprintln!(
                    "maintenance pass {}: evicted {} blocks ({} bytes)",
                    pass.pass, pass.evicted_blocks, pass.evicted_bytes
                );
            }
            drop(allocator);

            if let (Some(sink), Some(path)) = (sink, log) {
                sink.flush()?;
                if sink.write_errors() > 0 {
                    eprintln!(
                        "{} events could not be written to {}",
                        sink.write_errors(),
                        path.display()
                    );
                }
            }

            match format {
                Format::Markdown => print!("{}", report.to_markdown()),
                Format::Json => println!("{}", report.to_json()),
            }
            if !report.is_clean() {
                return Err("stress run found allocator misbehavior".into());
            }
        }
        Command::Config => {
            let config = AllocatorConfig::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_parse_as_decimal_or_hex() {
        assert_eq!(parse_seed("42"), Ok(42));
        assert_eq!(parse_seed("1_000"), Ok(1000));
        assert_eq!(parse_seed("0xDEAD_BEEF"), Ok(0xDEAD_BEEF));
        assert_eq!(parse_seed("0Xff"), Ok(255));
    }

    #[test]
    fn malformed_seeds_are_rejected() {
        for raw in ["", "0x", "seed", "0xZZ", "-1", "18446744073709551616"] {
            let err = parse_seed(raw).unwrap_err();
            assert!(err.contains("invalid seed"), "{raw}: {err}");
        }
    }

    #[test]
    fn stress_flags_reach_the_workload() {
        let cli = Cli::try_parse_from([
            "harness", "stress", "--threads", "2", "--seed", "0x10", "--format", "json",
        ])
        .unwrap();
        match cli.command {
            Command::Stress {
                threads,
                seed,
                format,
                ..
            } => {
                assert_eq!(threads, 2);
                assert_eq!(seed, 16);
                assert!(matches!(format, Format::Json));
            }
            Command::Config => panic!("expected stress"),
        }
    }
}
