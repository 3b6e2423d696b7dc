use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use fitrun::catalogue::{read_config_file, read_id_file, CatalogueRun};
use fitrun::file_handler::StateConfig;
use fitrun::fitter::CommandFitter;
use fitrun::ledger::Ledger;
use fitrun::logging::init_tracing;
use fitrun::maintenance::{RunMaintenance, DEFAULT_STALE_GRACE};
use fitrun::merger::BatchMerger;
use fitrun::worker::{Worker, WorkerConfig, WorkerReport};
use fitrun::FitRunError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "fitrun", about = "Coordinate resumable per-object fits across independent workers")]
struct Cli {
    /// State directory; defaults to FITRUN_STATE_DIR or ./fitrun_state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or resume a run from an ID list and fit it
    Start {
        #[arg(long)]
        run: String,
        /// File with one object ID per line
        #[arg(long)]
        ids: PathBuf,
        /// JSON fit configuration handed to every fit
        #[arg(long)]
        config: Option<PathBuf>,
        /// Worker threads in this process
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Join an existing run as one more worker
    Work {
        #[arg(long)]
        run: String,
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Fold completed results into summary.jsonl
    Merge {
        #[arg(long)]
        run: String,
        /// Regenerate from the ledger, dropping rows it no longer knows
        #[arg(long)]
        rebuild: bool,
    },
    /// Stop the run's workers and return claimed objects to the pool
    Clean {
        #[arg(long)]
        run: String,
        /// Delete the whole run afterwards
        #[arg(long)]
        purge: bool,
        /// Heartbeat age past which a worker's pid is no longer signalled
        #[arg(long, default_value_t = DEFAULT_STALE_GRACE.as_secs())]
        grace_secs: u64,
    },
    Status {
        #[arg(long)]
        run: String,
        #[arg(long)]
        json: bool,
    },
    /// Reset claims whose workers look dead
    Reap {
        #[arg(long)]
        run: String,
        #[arg(long, default_value_t = DEFAULT_STALE_GRACE.as_secs())]
        grace_secs: u64,
        /// Report stale claims without resetting them
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct WorkArgs {
    /// Completions between summary merges
    #[arg(long)]
    batch_size: Option<usize>,
    /// Random start delay upper bound in milliseconds
    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,
    /// Fit program, called as `PROGRAM [ARGS...] <id>`
    #[arg(last = true, required = true, num_args = 1..)]
    program: Vec<String>,
}

impl WorkArgs {
    fn worker_config(&self) -> Result<WorkerConfig, FitRunError> {
        let mut config = WorkerConfig::from_env()?;
        if let Some(batch_size) = self.batch_size {
            config.merge_every = batch_size;
        }
        config.start_jitter = Duration::from_millis(self.jitter_ms);
        config.validate()?;
        Ok(config)
    }

    fn fitter(&self) -> Result<CommandFitter, FitRunError> {
        let (program, args) = self
            .program
            .split_first()
            .ok_or_else(|| FitRunError::Config("missing fit program".into()))?;
        Ok(CommandFitter::new(program.clone(), args.to_vec()))
    }
}

fn main() -> ExitCode {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let state = match &cli.state_dir {
        Some(dir) => StateConfig::custom(dir.clone()),
        None => StateConfig::from_env(),
    };

    match run(&state, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fitrun failed");
            eprintln!("fitrun: {}", err);
            if err.is_storage() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(state: &StateConfig, command: Command) -> Result<(), FitRunError> {
    match command {
        Command::Start { run, ids, config, workers, work } => {
            let ids = read_id_file(&ids)?;
            let config = read_config_file(config.as_deref())?;
            let run = CatalogueRun::create_or_resume(state, &run, ids, config)?;
            run_workers(&run, &work, workers.max(1))
        }
        Command::Work { run, work } => {
            let run = CatalogueRun::open(state, &run)?;
            run_workers(&run, &work, 1)
        }
        Command::Merge { run, rebuild } => {
            let run = CatalogueRun::open(state, &run)?;
            let merger = BatchMerger::new(Ledger::new(run.paths().clone()));
            let report = if rebuild { merger.rebuild()? } else { merger.merge()? };
            println!(
                "{}: {} rows ({} added{})",
                run.paths().summary_path().display(),
                report.rows,
                report.added,
                if report.written { "" } else { ", unchanged" }
            );
            Ok(())
        }
        Command::Clean { run, purge, grace_secs } => {
            let run = CatalogueRun::open(state, &run)?;
            let maintenance =
                RunMaintenance::new(run.paths().clone()).with_grace(Duration::from_secs(grace_secs));
            let report = if purge { maintenance.purge()? } else { maintenance.clean()? };
            println!(
                "evicted {} workers ({} signalled), reset {} claims{}",
                report.evicted_workers.len(),
                report.signalled,
                report.reset_claims.len(),
                if purge { ", run deleted" } else { "" }
            );
            Ok(())
        }
        Command::Status { run, json } => {
            let run = CatalogueRun::open(state, &run)?;
            let report = RunMaintenance::new(run.paths().clone()).report_status()?;
            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("run:       {}", run.name());
                println!("total:     {}", report.total);
                println!("completed: {}", report.completed);
                println!("failed:    {}", report.failed);
                println!("claimed:   {}", report.claimed);
                println!("unclaimed: {}", report.unclaimed);
            }
            Ok(())
        }
        Command::Reap { run, grace_secs, dry_run } => {
            let run = CatalogueRun::open(state, &run)?;
            let maintenance = RunMaintenance::new(run.paths().clone());
            let grace = Duration::from_secs(grace_secs);
            let stale = if dry_run { maintenance.stale_claims(grace)? } else { maintenance.reset_stale(grace)? };
            for claim in &stale {
                println!("{}\t{}\t{:?}", claim.lease.id, claim.lease.owner, claim.reason);
            }
            println!("{} stale claims{}", stale.len(), if dry_run { "" } else { " reset" });
            Ok(())
        }
    }
}

fn run_workers(run: &CatalogueRun, work: &WorkArgs, workers: usize) -> Result<(), FitRunError> {
    let config = work.worker_config()?;
    let fitter = work.fitter()?;

    let reports: Vec<Result<WorkerReport, FitRunError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let worker = Worker::new(run, config.clone());
                let fitter = &fitter;
                scope.spawn(move || worker.run(fitter))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(FitRunError::Config("worker thread panicked".into())))
            })
            .collect()
    });

    let mut first_err = None;
    for report in reports {
        match report {
            Ok(report) => println!(
                "{}: claimed {}, completed {}, failed {}, exit {:?}",
                report.token, report.claimed, report.completed, report.failed, report.exit
            ),
            Err(err) => {
                // Storage errors decide the exit code, so they win over anything else
                if first_err.as_ref().map_or(true, |prev: &FitRunError| err.is_storage() && !prev.is_storage()) {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
