use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use zeroclick_domain::{timestamp_now, RunMode};
use zeroclick_provider::{CompletionClient, ScriptedLlm, TaskRoutedLlm};
use zeroclick_runner::fixtures::{scaffold_fixtures, OBFUSCATION_VARIANTS};
use zeroclick_runner::logger::LogDetail;
use zeroclick_runner::{MemoryBackend, Runner, RunnerConfig};

#[derive(Debug, Parser)]
#[command(name = "zeroclick")]
#[command(about = "Memory poisoning attack-chain simulator for multi-agent pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the eight-stage demo pipeline once.
    Run(RunArgs),
    /// Clear state, runs, and artifacts under the root.
    Reset(ResetArgs),
    /// Run every obfuscation variant and produce a comparison report.
    ObfTest(ObfTestArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, default_value = "sqlite")]
    memory: String,
    #[arg(long, default_value = "poisoned")]
    fixture: String,
    #[arg(long, default_value = "vulnerable")]
    mode: String,
    #[arg(long, default_value = "live")]
    llm: String,
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[arg(long, default_value_t = false)]
    no_banner: bool,
    #[arg(long, default_value_t = 0.25)]
    pace: f64,
    #[arg(long, default_value = "rich")]
    log_detail: String,
}

#[derive(Debug, Args)]
struct ResetArgs {
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[arg(long, default_value_t = false)]
    confirm: bool,
}

#[derive(Debug, Args)]
struct ObfTestArgs {
    #[arg(long, default_value = "sqlite")]
    memory: String,
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Reset(args) => reset_command(&args),
        Commands::ObfTest(args) => obf_test_command(&args),
    }
}

fn run_command(args: &RunArgs) -> Result<()> {
    let config = RunnerConfig {
        mode: parse_mode(&args.mode)?,
        memory_backend: parse_backend(&args.memory)?,
        fixture: args.fixture.clone(),
        root: args.root.clone(),
        banner: !args.no_banner,
        pace: parse_pace(args.pace),
        log_detail: parse_log_detail(&args.log_detail)?,
    };

    // Builtin fixtures are written up front so the first run works out of
    // the box; a custom fixture name that is absent still fails with the
    // distinct missing-input error.
    scaffold_fixtures(&args.root.join("web_fixtures"))?;

    let llm = build_llm(&args.llm)?;
    let summary = Runner::new(config).run(llm.as_ref())?;

    println!(
        "run_id={} mode={} fixture={} decision={} response_status={}",
        summary.run_id,
        summary.mode.as_str(),
        summary.fixture_file,
        summary.policy.decision.as_str(),
        summary
            .response
            .as_ref()
            .map_or("none", |response| response.status.as_str()),
    );
    match summary.pwned_path() {
        Some(path) => println!("Artifacts: pwned.txt written -> {}", path.display()),
        None => println!("Artifacts: pwned.txt not present"),
    }

    Ok(())
}

fn reset_command(args: &ResetArgs) -> Result<()> {
    if !args.confirm {
        return Err(anyhow!("refusing to reset without --confirm"));
    }
    let config = RunnerConfig {
        root: args.root.clone(),
        ..RunnerConfig::default()
    };
    Runner::new(config).reset()?;
    println!("Reset complete");
    Ok(())
}

fn obf_test_command(args: &ObfTestArgs) -> Result<()> {
    let memory_backend = parse_backend(&args.memory)?;
    scaffold_fixtures(&args.root.join("web_fixtures"))?;

    println!("{}", "=".repeat(60));
    println!("Obfuscation Test Runner");
    println!("{}", "=".repeat(60));
    println!();

    let llm = ScriptedLlm::new();
    let mut results: Vec<serde_json::Value> = Vec::new();

    for fixture in OBFUSCATION_VARIANTS {
        println!("Running fixture: {fixture}");
        let config = RunnerConfig {
            mode: RunMode::Vulnerable,
            memory_backend,
            fixture: (*fixture).to_string(),
            root: args.root.clone(),
            banner: false,
            pace: Duration::ZERO,
            log_detail: LogDetail::Minimal,
        };

        let (success, method, error) = match Runner::new(config).run(&llm) {
            Ok(summary) => (
                summary.pwned_path().is_some(),
                summary.obfuscation_method,
                None,
            ),
            Err(err) => (false, None, Some(err.to_string())),
        };

        println!("  Result: {}", if success { "SUCCESS" } else { "FAILED" });
        if let Some(method) = &method {
            println!("  Obfuscation detected: {method}");
        }
        if let Some(error) = &error {
            println!("  Error: {error}");
        }
        println!();

        results.push(json!({
            "fixture": fixture,
            "success": success,
            "obfuscation_method": method,
            "error": error,
        }));
    }

    print_report(&args.root, &results)
}

fn print_report(root: &Path, results: &[serde_json::Value]) -> Result<()> {
    println!();
    println!("{}", "=".repeat(60));
    println!("Test Results Summary");
    println!("{}", "=".repeat(60));
    println!();
    println!("{:<20} {:<10} {:<20}", "Fixture", "Success", "Obfuscation");
    println!("{}", "-".repeat(60));

    let mut successful = 0_usize;
    let mut method_counts: BTreeMap<String, usize> = BTreeMap::new();
    for result in results {
        let fixture = result["fixture"].as_str().unwrap_or("?");
        let success = result["success"].as_bool().unwrap_or(false);
        if success {
            successful += 1;
        }
        let method = result["obfuscation_method"].as_str().unwrap_or("N/A");
        if method != "N/A" {
            *method_counts.entry(method.to_string()).or_insert(0) += 1;
        }
        let success_label = if success { "YES" } else { "NO" };
        println!("{fixture:<20} {success_label:<10} {method:<20}");
    }

    let total = results.len();
    #[allow(clippy::cast_precision_loss)]
    let rate = if total > 0 {
        successful as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    println!();
    println!("{}", "=".repeat(60));
    println!("Attack Success Rate");
    println!("{}", "=".repeat(60));
    println!("Successful attacks: {successful}/{total} ({rate:.1}%)");
    println!();

    println!("{}", "=".repeat(60));
    println!("Obfuscation Techniques Detected");
    println!("{}", "=".repeat(60));
    if method_counts.is_empty() {
        println!("  No obfuscation methods detected");
    } else {
        for (method, count) in &method_counts {
            println!("  {method}: {count} time(s)");
        }
    }
    println!();

    let results_path = root.join("obfuscation_test_results.json");
    let report = json!({
        "timestamp": timestamp_now()?,
        "results": results,
        "summary": {
            "total": total,
            "successful": successful,
            "success_rate": rate,
            "obfuscation_counts": method_counts,
        },
    });
    std::fs::write(&results_path, serde_json::to_string_pretty(&report)?)?;
    println!("Detailed results saved to: {}", results_path.display());

    Ok(())
}

fn build_llm(raw: &str) -> Result<Box<dyn CompletionClient>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "live" => Ok(Box::new(TaskRoutedLlm::from_env()?)),
        "scripted" => Ok(Box::new(ScriptedLlm::new())),
        other => Err(anyhow!("invalid llm '{other}'; use 'live' or 'scripted'")),
    }
}

fn parse_mode(raw: &str) -> Result<RunMode> {
    RunMode::parse(raw)
        .ok_or_else(|| anyhow!("invalid mode '{raw}'; use 'vulnerable' or 'defended'"))
}

fn parse_backend(raw: &str) -> Result<MemoryBackend> {
    MemoryBackend::parse(raw)
        .ok_or_else(|| anyhow!("invalid memory backend '{raw}'; use 'sqlite' or 'jsonl'"))
}

fn parse_log_detail(raw: &str) -> Result<LogDetail> {
    LogDetail::parse(raw)
        .ok_or_else(|| anyhow!("invalid log detail '{raw}'; use 'minimal' or 'rich'"))
}

fn parse_pace(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}
