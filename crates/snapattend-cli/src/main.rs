use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use snapattend_core::cipher::key_fingerprint;
use snapattend_core::{FileKeyProvider, KeyProvider};
use snapattend_pipeline::{
    session, spawn_engine, AttendanceTarget, BatchReport, CancelFlag, Config, EngineError, ImageReport, Pipeline,
    PipelineError,
};
use snapattend_store::SqliteStore;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "snapattend", about = "Photo-based classroom attendance")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize students in a photo (or folder of photos) and mark attendance
    Process(ProcessArgs),
    /// Register a student's face from a photo
    Enroll {
        /// Student number (unique key)
        #[arg(long)]
        number: String,
        #[arg(long)]
        name: String,
        /// Photo containing the student's face
        #[arg(short, long)]
        image: PathBuf,
        /// Also enroll into every active classroom
        #[arg(long)]
        all_classrooms: bool,
    },
    /// Show the active session of a classroom
    Session {
        #[arg(short, long)]
        classroom: i64,
    },
    /// Create the database tables and the template key
    Init,
}

#[derive(Args)]
struct ProcessArgs {
    /// Single image to process
    #[arg(short, long, conflicts_with = "folder", required_unless_present = "folder")]
    image: Option<PathBuf>,
    /// Folder of images to process
    #[arg(short, long)]
    folder: Option<PathBuf>,
    /// Classroom whose active session receives attendance
    #[arg(short, long, conflicts_with = "session")]
    classroom: Option<i64>,
    /// Explicit session id
    #[arg(short, long)]
    session: Option<i64>,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("configuration error")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Process(args) => process(&config, args).await,
        Commands::Enroll { number, name, image, all_classrooms } => {
            let (pipeline, _store) = Pipeline::from_config(&config)?;
            let engine = spawn_engine(pipeline)?;
            match engine.enroll(number.clone(), name.clone(), image.clone(), all_classrooms).await {
                Ok(report) => println!(
                    "Enrolled {name} ({number}) as student {} [{} face(s) found, {} classroom(s) added]",
                    report.student_id, report.faces_found, report.classrooms_added
                ),
                Err(e) => {
                    tracing::error!(student_number = %number, image = %image.display(), error = %e, "enrollment failed");
                    println!("Enrollment of {name} ({number}) failed: {e}");
                }
            }
            Ok(())
        }
        Commands::Session { classroom } => {
            let store = SqliteStore::open(&config.db_path)?;
            let now = chrono::Local::now().naive_local();
            match session::resolve_active_session(&store, classroom, now)? {
                Some(s) => println!(
                    "Session {} ({} {}-{})",
                    s.session_id, s.date, s.start_time, s.end_time
                ),
                None => println!("No active session for classroom {classroom}"),
            }
            Ok(())
        }
        Commands::Init => {
            SqliteStore::open(&config.db_path)?;
            println!("Database: {}", config.db_path.display());
            let key = FileKeyProvider::load_or_generate(&config.key_path).context("configuration error")?;
            println!("Key:      {} (fingerprint {})", key.path().display(), key_fingerprint(key.key()));
            Ok(())
        }
    }
}

async fn process(config: &Config, args: ProcessArgs) -> Result<()> {
    let (pipeline, _store) = Pipeline::from_config(config)?;
    let engine = spawn_engine(pipeline)?;

    let now = chrono::Local::now().naive_local();
    let target = match engine.resolve_target(args.classroom, args.session, now).await {
        Ok(target) => target,
        Err(EngineError::Pipeline(PipelineError::NoActiveSession(classroom))) => {
            tracing::warn!(classroom, "no active session; recognizing without recording attendance");
            AttendanceTarget::classroom(classroom)
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot resolve attendance target");
            println!("Nothing processed: {e}");
            return Ok(());
        }
    };
    if let Some(s) = &target.session {
        tracing::info!(session = s.session_id, classroom = s.classroom_id, "recording attendance");
    }

    if let Some(dir) = args.folder {
        let cancel = CancelFlag::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping after the current image");
                on_signal.cancel();
            }
        });

        let batch = match engine.process_folder(dir.clone(), target, cancel).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "folder not processed");
                println!("{}: {e}", dir.display());
                return Ok(());
            }
        };
        if args.json {
            println!("{}", serde_json::to_string_pretty(&batch)?);
        } else {
            print_batch(&batch);
        }
    } else if let Some(path) = args.image {
        let report = engine.process_image(path, target).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_image(&report);
        }
    }
    Ok(())
}

fn display(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_else(|| "<image>".into())
}

fn print_image(report: &ImageReport) {
    println!("{}: {} face(s)", display(report.source.as_deref()), report.results.len());
    if let Some(e) = &report.detection_error {
        println!("  detection failed: {e}");
    }
    for r in &report.results {
        match (r.student_id, r.confidence) {
            (Some(id), Some(c)) => println!("  {} (student {id}, confidence {c:.2})", r.name),
            _ => println!("  {}", r.name),
        }
    }
    if !report.recorded.is_empty() {
        println!("  marked present: {:?}", report.recorded);
    }
    for f in &report.record_failures {
        println!("  NOT recorded: student {} ({})", f.student_id, f.error);
    }
    if !report.excluded_candidates.is_empty() {
        println!("  excluded (unreadable template): {:?}", report.excluded_candidates);
    }
    if let Some(p) = &report.annotated_path {
        println!("  saved {}", p.display());
    }
}

fn print_batch(batch: &BatchReport) {
    for report in &batch.images {
        print_image(report);
    }
    println!();
    println!(
        "{} image(s), {} without detection, {} face(s): {} recognized, {} unknown",
        batch.images.len(),
        batch.detection_failures,
        batch.total_faces,
        batch.recognized,
        batch.unknown
    );
    for tally in batch.students.values() {
        println!("  {:>6}  {:<24} {} detection(s)", tally.student_id, tally.name, tally.detections);
    }
    if batch.cancelled {
        println!("(cancelled before all images were processed)");
    }
}
