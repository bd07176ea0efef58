//! Parallel agent task orchestrator.
//!
//! Runs a file of tasks concurrently, each in its own git worktree, gated by a
//! risk mode. Run state lives under `<repo>/.orchestrator/`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use orchestrator::commands::{
    self, RepoOptions, RunOptions, assess_tasks, format_result_line, format_totals,
};
use orchestrator::core::risk::RiskMode;
use orchestrator::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run agent tasks in parallel across pooled git worktrees"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct RepoArgs {
    /// Repository whose worktrees are pooled.
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    /// Config file (default: `<repo>/.orchestrator/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Parent directory for pooled worktrees.
    #[arg(long)]
    worktree_dir: Option<PathBuf>,
}

impl RepoArgs {
    fn options(&self) -> RepoOptions {
        RepoOptions {
            repo: self.repo.clone(),
            config: self.config.clone(),
            worktree_dir: self.worktree_dir.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Execute a task file. Exits 0 only if every task completed.
    Run {
        /// JSON task file.
        #[arg(long)]
        tasks: PathBuf,
        #[command(flatten)]
        repo: RepoArgs,
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Risk mode: conservative, standard, aggressive, autonomous.
        #[arg(long, default_value = "conservative", value_parser = parse_mode)]
        yolo: RiskMode,
        /// Write the run report as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run tasks sequentially, skipping those whose `depends_on` did not complete.
        #[arg(long)]
        workflow: bool,
        /// Leave pooled worktrees in place after the run.
        #[arg(long)]
        keep_workspaces: bool,
        /// Ask on the terminal before running tasks the risk gate would reject.
        #[arg(long)]
        interactive: bool,
    },
    /// Print pooled workspace ids.
    List {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Destroy all pooled workspaces and their branches.
    Cleanup {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Write a sample task file.
    Init {
        #[arg(default_value = "tasks.json")]
        output: PathBuf,
    },
    /// Score each task's risk and show whether it would be auto-approved.
    Assess {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long, default_value = "conservative", value_parser = parse_mode)]
        yolo: RiskMode,
    },
}

fn parse_mode(raw: &str) -> Result<RiskMode, String> {
    raw.parse()
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            tasks,
            repo,
            max_concurrent,
            yolo,
            output,
            workflow,
            keep_workspaces,
            interactive,
        } => {
            let options = RunOptions {
                repo: repo.options(),
                tasks,
                mode: yolo,
                max_concurrent,
                output,
                workflow,
                keep_workspaces,
                interactive,
            };
            let report = commands::run(&options).await?;
            for result in &report.results {
                println!("{}", format_result_line(result));
            }
            println!("{}", format_totals(&report));
            Ok(if report.all_succeeded() {
                exit_codes::OK
            } else {
                exit_codes::FAILED
            })
        }
        Command::List { repo } => {
            match commands::list(&repo.options()) {
                Ok(pooled) => {
                    for worktree in pooled {
                        println!("{}", worktree.id);
                    }
                }
                Err(err) => eprintln!("{err:#}"),
            }
            Ok(exit_codes::OK)
        }
        Command::Cleanup { repo } => {
            let report = commands::cleanup(&repo.options())?;
            println!(
                "removed {} workspace(s), {} failure(s)",
                report.removed, report.failed
            );
            Ok(if report.failed == 0 {
                exit_codes::OK
            } else {
                exit_codes::PARTIAL
            })
        }
        Command::Init { output } => {
            commands::init(&output)?;
            println!("wrote {}", output.display());
            Ok(exit_codes::OK)
        }
        Command::Assess { tasks, yolo } => {
            for row in assess_tasks(&tasks, yolo)? {
                let mut flags = Vec::new();
                if row.destructive {
                    flags.push("destructive");
                }
                if row.production {
                    flags.push("production");
                }
                println!(
                    "{:<24} risk {:.2}  {}  {}",
                    row.name,
                    row.score,
                    if row.auto_approved {
                        "auto-approve"
                    } else {
                        "needs confirmation"
                    },
                    flags.join(",")
                );
            }
            Ok(exit_codes::OK)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "orchestrator",
            "run",
            "--tasks",
            "tasks.json",
            "--repo",
            "/tmp/repo",
            "--max-concurrent",
            "2",
            "--yolo",
            "aggressive",
            "--workflow",
        ]);
        let Command::Run {
            tasks,
            repo,
            max_concurrent,
            yolo,
            workflow,
            keep_workspaces,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(tasks, PathBuf::from("tasks.json"));
        assert_eq!(repo.repo, PathBuf::from("/tmp/repo"));
        assert_eq!(max_concurrent, Some(2));
        assert_eq!(yolo, RiskMode::Aggressive);
        assert!(workflow);
        assert!(!keep_workspaces);
    }

    #[test]
    fn run_defaults_to_conservative() {
        let cli = Cli::parse_from(["orchestrator", "run", "--tasks", "t.json"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                yolo: RiskMode::Conservative,
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_mode() {
        let parsed =
            Cli::try_parse_from(["orchestrator", "run", "--tasks", "t.json", "--yolo", "reckless"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_cleanup_with_worktree_dir() {
        let cli = Cli::parse_from(["orchestrator", "cleanup", "--worktree-dir", "/tmp/wt"]);
        let Command::Cleanup { repo } = cli.command else {
            panic!("expected cleanup");
        };
        assert_eq!(repo.worktree_dir, Some(PathBuf::from("/tmp/wt")));
        assert_eq!(repo.repo, PathBuf::from("."));
    }
}
