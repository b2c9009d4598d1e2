//
// cli.rs
// Study-Anonymizer-rs
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the pipeline, ledger and web server.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::anonymize::AnonymizationPolicy;
use crate::config::Settings;
use crate::ledger::SequenceLedger;
use crate::models::{StudyMetadata, StudyPaths, StudyReport};
use crate::pipeline::{PipelineOptions, RunControl, StatusEvent, StudyPipeline};
use crate::{scan, web};

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "study-anonymizer")]
#[command(about = "Copy, anonymize and ledger DICOM studies", long_about = None)]
pub struct Cli {
    /// JSON settings file with default directories and worker count
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Directory holding the per-project ledger files
    #[arg(long, global = true)]
    pub ledger_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy and anonymize a study, then record it in the project ledger
    Study {
        #[arg(short, long)]
        source: PathBuf,
        #[arg(long)]
        originals: Option<PathBuf>,
        #[arg(long)]
        anonymized: Option<PathBuf>,
        #[arg(short, long)]
        project: String,
        #[arg(short, long)]
        modality: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Existing patient sequence (PatN); omit to allocate the next free one
        #[arg(long)]
        patient_seq: Option<String>,
        /// Study number shown to the operator; the ledger's next number wins on conflict
        #[arg(long)]
        study_number: Option<u32>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        strip_private_tags: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Suggest the next free patient sequence for a project
    NextPatient {
        #[arg(short, long)]
        project: String,
    },
    /// Suggest the next study number for a patient
    NextStudy {
        #[arg(short, long)]
        project: String,
        #[arg(long)]
        patient_seq: String,
    },
    /// Search patients by last name (empty query lists all)
    Search {
        #[arg(short, long)]
        project: String,
        #[arg(short, long, default_value = "")]
        query: String,
    },
    /// List every study recorded for a project
    Ledger {
        #[arg(short, long)]
        project: String,
    },
    /// List the records a study run would pick up
    Scan { directory: PathBuf },
    /// Start the web server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
}

pub async fn run() -> anyhow::Result<()> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.ledger_dir {
        settings.ledger_dir = Some(dir);
    }
    let ledger = Arc::new(SequenceLedger::new(settings.ledger_dir()));

    match cli.command {
        Commands::Study {
            source,
            originals,
            anonymized,
            project,
            modality,
            first_name,
            last_name,
            patient_seq,
            study_number,
            workers,
            strip_private_tags,
            json,
        } => {
            if workers == Some(0) {
                bail!("Number of workers must be greater than zero");
            }
            let patient_seq = match patient_seq {
                Some(seq) => seq,
                None => ledger.next_patient_number(&project)?,
            };
            let metadata = StudyMetadata::new(
                &project,
                &modality,
                &first_name,
                &last_name,
                &patient_seq,
                study_number,
            )?;
            let paths = StudyPaths {
                source_root: source,
                originals_root: originals.unwrap_or_else(|| settings.originals_root()),
                anonymized_root: anonymized.unwrap_or_else(|| settings.anonymized_root()),
            };
            let options = PipelineOptions {
                workers: workers.unwrap_or_else(|| settings.workers()),
                policy: AnonymizationPolicy {
                    strip_private_tags: strip_private_tags || settings.strip_private_tags(),
                },
            };
            let pipeline = StudyPipeline::new(Arc::clone(&ledger), options);
            let report = run_study(pipeline, metadata, paths, json).await?;
            if !report.is_success() {
                bail!("Study finished with status {:?}", report.status);
            }
        }
        Commands::NextPatient { project } => {
            println!("{}", ledger.next_patient_number(&project)?);
        }
        Commands::NextStudy {
            project,
            patient_seq,
        } => {
            println!("{}", ledger.next_study_number(&project, &patient_seq)?);
        }
        Commands::Search { project, query } => {
            let matches = ledger.search_by_surname(&project, &query)?;
            if matches.is_empty() {
                println!("No patients found.");
            }
            for m in matches {
                println!("{}", m.display_label);
            }
        }
        Commands::Ledger { project } => {
            let rows = ledger.rows(&project)?;
            println!("Ledger {:?} | {} study row(s)", ledger.ledger_path(&project)?, rows.len());
            for row in rows {
                println!(
                    "  {} | {} {} | {} | {} #{}",
                    row.patient_id,
                    row.first_name,
                    row.last_name,
                    row.study_date,
                    row.patient_seq,
                    row.study_number
                );
            }
        }
        Commands::Scan { directory } => {
            let summary = scan::scan(&directory)?;
            println!(
                "Found {} record(s), {} unparseable candidate(s), {} unreadable entries in {:?}",
                summary.records.len(),
                summary.rejected.len(),
                summary.unreadable.len(),
                directory
            );
            for path in summary.records {
                println!("  {}", path.display());
            }
        }
        Commands::Serve { host, port } => web::start_server(&host, port, ledger).await?,
    }

    Ok(())
}

async fn run_study(
    pipeline: StudyPipeline,
    metadata: StudyMetadata,
    paths: StudyPaths,
    json: bool,
) -> anyhow::Result<StudyReport> {
    let (tx, rx) = mpsc::channel();
    let control = RunControl::with_events(tx);

    // Ctrl-C stops the run between records; records already started finish.
    let cancel = control.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let printer = std::thread::spawn(move || {
        for event in rx {
            if let StatusEvent::Status(message) = event {
                eprintln!("{message}");
            }
        }
    });

    let report = tokio::task::spawn_blocking(move || pipeline.run(&metadata, &paths, &control))
        .await
        .context("Study worker panicked")??;
    let _ = printer.join();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report)
}

fn print_report(report: &StudyReport) {
    println!("{}", "=".repeat(80));
    println!("Study {} ({:?})", report.pseudonym, report.status);
    println!("{}", "=".repeat(80));
    println!("  Study number: {}", report.study_number);
    println!("  Study date:   {}", report.study_date);
    println!("  Discovered:   {}", report.discovered);
    println!("  Excluded:     {}", report.excluded);
    println!("  Copied:       {}", report.copied);
    println!("  Anonymized:   {}", report.anonymized);
    println!("  Failed:       {}", report.failed);
    if report.skipped > 0 {
        println!("  Skipped:      {}", report.skipped);
    }
    println!(
        "  Ledger:       {}",
        if report.ledger_written {
            "written".to_string()
        } else {
            report
                .ledger_error
                .clone()
                .unwrap_or_else(|| "not written".to_string())
        }
    );
    println!("  Originals:    {}", report.originals_dir.display());
    println!("  Anonymized:   {}", report.anonymized_dir.display());
    for failure in &report.failures {
        println!("  ! {failure}");
    }
}
