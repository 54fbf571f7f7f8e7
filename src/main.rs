use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use mend::agent::{RepairAgent, RunResult, RunStatus};
use mend::config::{self, Config};
use mend::llm::OpenRouterClient;
use mend::telemetry::{JsonlSink, NullSink};
use mend::testing::{detect_project_type, CommandTestRunner};
use mend::vcs::GitVcs;

#[derive(Parser, Debug)]
#[command(
    name = "mend",
    about = "An autonomous repair agent that turns failing tests green",
    version
)]
struct Args {
    /// Path to the repository (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Iteration budget for this run
    #[arg(short = 'n', long)]
    max_iterations: Option<usize>,

    /// Wall-clock budget for this run, in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Skip the LLM critic review pass
    #[arg(long)]
    no_critic: bool,

    /// Don't write telemetry events to .mend/events.jsonl
    #[arg(long)]
    quiet: bool,

    /// Configure the OpenRouter API key and exit
    #[arg(long)]
    setup: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.setup {
        config::setup_api_key_interactive().map_err(|e| anyhow!(e))?;
        return Ok(());
    }

    let mut config = Config::load();
    if let Some(n) = args.max_iterations {
        config.max_iterations = n;
    }
    if let Some(t) = args.timeout {
        config.timeout_secs = t;
    }
    if args.no_critic {
        config.critic_enabled = false;
    }

    let api_key = match config.get_api_key() {
        Some(key) => key,
        None => config::setup_api_key_interactive().map_err(|e| anyhow!(e))?,
    };

    let path = args
        .path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", args.path.display()))?;

    let project = detect_project_type(&path);
    eprintln!("  Repairing {} ({} project)", path.display(), project.name());

    let llm = OpenRouterClient::new(api_key)?;
    let runner = CommandTestRunner::new(&path, Duration::from_secs(config.test_timeout_secs));
    let vcs = GitVcs::open(&path)?;

    let result = if args.quiet {
        let sink = NullSink;
        RepairAgent::new(&path, &config, &llm, &runner, &vcs, &sink).run()
    } else {
        let sink = JsonlSink::create(&path);
        eprintln!("  Telemetry: .mend/events.jsonl (run {})", sink.run_id());
        RepairAgent::new(&path, &config, &llm, &runner, &vcs, &sink).run()
    };

    print_summary(&result);

    if result.status != RunStatus::Success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    eprintln!();
    match result.status {
        RunStatus::Success => {
            eprintln!(
                "  + All tests green after {} iteration(s), {} patch(es) committed",
                result.iterations_used,
                result.patches_applied.len()
            );
        }
        RunStatus::Timeout => {
            eprintln!(
                "  Timed out after {} iteration(s); {} test(s) still failing",
                result.iterations_used,
                result.remaining_failures.len()
            );
        }
        RunStatus::MaxIterationsReached => {
            eprintln!(
                "  Iteration budget exhausted; {} test(s) still failing",
                result.remaining_failures.len()
            );
        }
        RunStatus::SafetyViolation => {
            eprintln!("  Stopped: repeated safety rejections, no safe patch found");
        }
        RunStatus::FatalError => {
            eprintln!("  Stopped: unrecoverable error (see .mend/events.jsonl)");
        }
    }
    for test in &result.remaining_failures {
        eprintln!("    still failing: {}", test.id);
    }
}
