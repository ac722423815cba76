use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use gallery_intake::config::Config;
use gallery_intake::db::{Database, DirectorySnapshot, NewQueueItem, PhotoStatus, SubmissionSource};
use gallery_intake::export::{export_catalogue, ExportFormat};
use gallery_intake::fingerprint::{FingerprintStore, KnownFingerprints};
use gallery_intake::logging::{self, LogTarget};
use gallery_intake::pipeline::{review_face, run_workers, Pipeline};

struct Args {
    config_path: Option<PathBuf>,
    command: String,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;
    let mut rest = Vec::new();

    let mut i = 1;
    while i < args.len() {
        if command.is_some() {
            rest.push(args[i].clone());
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("gallery-intake {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
            other => command = Some(other.to_string()),
        }
        i += 1;
    }

    match command {
        Some(command) => Args {
            config_path,
            command,
            rest,
        },
        None => {
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"gallery-intake - catalogue submitted photos

USAGE:
    gallery-intake [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    init                              Create the database and storage root
    enqueue <PATH>...                 Queue files or directories of photos
        --source NAME                 email, upload, sync or bot (default upload)
        --submitter ID                Submitting member id
        --email ADDRESS               Submitter email, resolved to a member
        --priority N                  Higher runs first (default 0)
        --skip-known                  Do not queue files already catalogued
    process [--limit N] [--workers N] Process pending submissions
    retry                             Fail abandoned items, then requeue failed items
                                      below the attempt limit
    cleanup [--days N]                Purge old completed items
    stats                             Show queue and catalogue counts
    check <PATH>...                   Report files whose content is already catalogued
    import-directory <FILE>           Load members, events and embeddings from JSON
    export <FILE> [--format json|csv] [--status STATUS]
                                      Export the catalogue
    rematch <PHOTO_ID>                Re-run face matching for a photo
    set-status <PHOTO_ID> <STATUS> [--by NAME]
                                      awaiting_review, restricted, public or rejected
    confirm-face <FACE_ID> (--member ID | --guest) [--by NAME] [--save-embedding]
                                      Record who a detected face is

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    GALLERY_INTAKE_CONFIG   Path to config file (overrides default location)
    GALLERY_INTAKE_LOG      Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/gallery-intake/config.toml

See also: gallery-intake-daemon --help"#
    );
}

/// Remove `name` and its value from `rest`, if present.
fn take_option(rest: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    match rest.iter().position(|a| a == name) {
        Some(pos) => {
            if pos + 1 >= rest.len() {
                bail!("{} requires a value", name);
            }
            let value = rest.remove(pos + 1);
            rest.remove(pos);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn take_flag(rest: &mut Vec<String>, name: &str) -> bool {
    match rest.iter().position(|a| a == name) {
        Some(pos) => {
            rest.remove(pos);
            true
        }
        None => false,
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, name: &str) -> Result<Option<T>> {
    match value {
        Some(v) => match v.parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => bail!("{} expects a number, got '{}'", name, v),
        },
        None => Ok(None),
    }
}

/// Whatever is left after options are taken must be positional.
fn positionals(rest: Vec<String>) -> Result<Vec<String>> {
    if let Some(unknown) = rest.iter().find(|a| a.starts_with("--")) {
        bail!("Unknown option: {}", unknown);
    }
    Ok(rest)
}

fn single(rest: Vec<String>, what: &str) -> Result<String> {
    let mut values = positionals(rest)?;
    if values.len() != 1 {
        bail!("Expected exactly one {}", what);
    }
    Ok(values.remove(0))
}

fn open_database(config: &Config) -> Result<Database> {
    let db = Database::open(&config.database.path)?;
    db.initialize()?;
    Ok(db)
}

fn is_image(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Expand files and directories into the image files they contain.
fn collect_images(paths: &[String], extensions: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        let path = Path::new(path);
        if path.is_file() {
            files.push(path.to_path_buf());
            continue;
        }
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && is_image(entry.path(), extensions) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files
}

fn main() -> Result<()> {
    let args = parse_args();
    logging::init(LogTarget::Stderr)?;

    let config = match args.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let mut rest = args.rest;
    match args.command.as_str() {
        "init" => cmd_init(&config),
        "enqueue" => cmd_enqueue(&config, &mut rest),
        "process" => cmd_process(config, &mut rest),
        "retry" => {
            let db = open_database(&config)?;
            let abandoned = db.fail_stale_processing(config.queue.stale_processing_minutes)?;
            if abandoned > 0 {
                warn!(abandoned, "Failed submissions abandoned while processing");
            }
            let count = db.retry_failed(config.queue.max_attempts)?;
            println!("Requeued {} failed item(s)", count);
            Ok(())
        }
        "cleanup" => {
            let days = parse_number(take_option(&mut rest, "--days")?, "--days")?
                .unwrap_or(config.queue.completed_retention_days);
            let db = open_database(&config)?;
            let count = db.cleanup_completed(days)?;
            println!("Removed {} completed item(s) older than {} day(s)", count, days);
            Ok(())
        }
        "stats" => cmd_stats(&config),
        "check" => cmd_check(&config, rest),
        "import-directory" => {
            let file = single(rest, "directory file")?;
            let snapshot = DirectorySnapshot::from_file(Path::new(&file))?;
            let db = open_database(&config)?;
            let counts = db.import_directory(&snapshot)?;
            println!(
                "Imported {} member(s), {} event(s), {} registration(s), {} embedding(s)",
                counts.members, counts.events, counts.registrations, counts.embeddings
            );
            Ok(())
        }
        "export" => cmd_export(&config, &mut rest),
        "rematch" => {
            let photo_id = single(rest, "photo id")?;
            let db = open_database(&config)?;
            let pipeline = Pipeline::from_config(config);
            let summary = pipeline.rematch_photo(&db, &photo_id)?;
            println!("{} face(s) found, {} matched", summary.faces, summary.matched);
            Ok(())
        }
        "set-status" => cmd_set_status(&config, &mut rest),
        "confirm-face" => cmd_confirm_face(&config, &mut rest),
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    }
}

fn cmd_init(config: &Config) -> Result<()> {
    open_database(config)?;
    std::fs::create_dir_all(&config.storage.root)
        .with_context(|| format!("Failed to create {}", config.storage.root.display()))?;
    println!("Database: {}", config.database.path.display());
    println!("Storage:  {}", config.storage.root.display());
    Ok(())
}

fn cmd_enqueue(config: &Config, rest: &mut Vec<String>) -> Result<()> {
    let source: SubmissionSource = match take_option(rest, "--source")? {
        Some(s) => s.parse().map_err(anyhow::Error::msg)?,
        None => SubmissionSource::Upload,
    };
    let submitter = take_option(rest, "--submitter")?;
    let email = take_option(rest, "--email")?;
    let priority = parse_number(take_option(rest, "--priority")?, "--priority")?.unwrap_or(0);
    let skip_known = take_flag(rest, "--skip-known");
    let paths = positionals(std::mem::take(rest))?;
    if paths.is_empty() {
        bail!("enqueue needs at least one path");
    }

    let db = open_database(config)?;
    let files = collect_images(&paths, &config.queue.image_extensions);
    let known = if skip_known {
        Some(KnownFingerprints::load(&db)?)
    } else {
        None
    };

    let mut queued = 0;
    let mut skipped = 0;
    for file in files {
        if let Some(ref known) = known {
            let (duplicate, _) = known.is_duplicate(&file);
            if duplicate {
                info!(path = %file.display(), "Already catalogued, not queued");
                skipped += 1;
                continue;
            }
        }

        let path = file.canonicalize().unwrap_or(file);
        let mut item = NewQueueItem::new(path, source);
        item.submitter_member_id = submitter.clone();
        item.submitter_email = email.clone();
        item.priority = priority;
        db.enqueue(&item)?;
        queued += 1;
    }

    println!("Queued {} photo(s), skipped {}", queued, skipped);
    Ok(())
}

fn cmd_process(config: Config, rest: &mut Vec<String>) -> Result<()> {
    let limit = parse_number(take_option(rest, "--limit")?, "--limit")?.unwrap_or(config.queue.batch_size);
    let workers = parse_number(take_option(rest, "--workers")?, "--workers")?.unwrap_or(config.queue.workers);
    positionals(std::mem::take(rest))?;

    // Make sure the schema exists before workers open their own connections.
    open_database(&config)?;
    let db_path = config.database.path.clone();
    let pipeline = Pipeline::from_config(config);
    let stats = run_workers(&pipeline, &db_path, workers, limit)?;

    println!(
        "Processed {}: {} catalogued, {} duplicate(s), {} failed",
        stats.processed, stats.catalogued, stats.duplicates, stats.failed
    );
    Ok(())
}

fn cmd_stats(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let stats = db.queue_stats()?;
    println!("Queue:");
    println!("  pending     {}", stats.pending);
    println!("  processing  {}", stats.processing);
    println!("  completed   {}", stats.completed);
    println!("  failed      {}", stats.failed);
    if let Some(ref oldest) = stats.oldest_pending {
        println!("  oldest pending submitted {}", oldest);
    }
    println!("Catalogued photos: {}", db.photo_count()?);
    Ok(())
}

fn cmd_check(config: &Config, rest: Vec<String>) -> Result<()> {
    let paths = positionals(rest)?;
    if paths.is_empty() {
        bail!("check needs at least one path");
    }
    let db = open_database(config)?;
    let files = collect_images(&paths, &config.queue.image_extensions);
    let duplicates = FingerprintStore::new(&db).check_batch(&files)?;

    let mut found: Vec<_> = duplicates.into_iter().collect();
    found.sort();
    for (path, photo_id) in &found {
        println!("{}\t{}", path.display(), photo_id);
    }
    println!("{} of {} file(s) already catalogued", found.len(), files.len());
    Ok(())
}

fn cmd_export(config: &Config, rest: &mut Vec<String>) -> Result<()> {
    let format = match take_option(rest, "--format")? {
        Some(f) => f.parse().map_err(anyhow::Error::msg)?,
        None => ExportFormat::Json,
    };
    let status: Option<PhotoStatus> = match take_option(rest, "--status")? {
        Some(s) => Some(s.parse().map_err(anyhow::Error::msg)?),
        None => None,
    };
    let output = single(std::mem::take(rest), "output file")?;

    let db = open_database(config)?;
    let count = export_catalogue(&db, Path::new(&output), format, status)?;
    println!("Exported {} photo(s) to {}", count, output);
    Ok(())
}

fn cmd_set_status(config: &Config, rest: &mut Vec<String>) -> Result<()> {
    let reviewer = take_option(rest, "--by")?;
    let values = positionals(std::mem::take(rest))?;
    let (photo_id, status) = match values.as_slice() {
        [photo_id, status] => (photo_id, status),
        _ => bail!("set-status expects a photo id and a status"),
    };
    let status: PhotoStatus = status.parse().map_err(anyhow::Error::msg)?;

    let db = open_database(config)?;
    if !db.update_photo_status(photo_id, status, reviewer.as_deref())? {
        bail!("Photo {} not found", photo_id);
    }
    println!("{} is now {}", photo_id, status.as_str());
    Ok(())
}

fn cmd_confirm_face(config: &Config, rest: &mut Vec<String>) -> Result<()> {
    let member = take_option(rest, "--member")?;
    let guest = take_flag(rest, "--guest");
    let save_embedding = take_flag(rest, "--save-embedding");
    let reviewer = take_option(rest, "--by")?.unwrap_or_else(|| "cli".to_string());
    let face_id: i64 = parse_number(Some(single(std::mem::take(rest), "face id")?), "face id")?
        .context("face id required")?;

    if member.is_some() == guest {
        bail!("confirm-face needs either --member or --guest");
    }

    let db = open_database(config)?;
    if !review_face(&db, face_id, member.as_deref(), &reviewer, guest)? {
        bail!("Face {} not found", face_id);
    }

    if let (true, Some(ref member_id)) = (save_embedding, &member) {
        match db.save_confirmed_embedding(face_id, member_id) {
            Ok(_) => info!(face_id, member_id = %member_id, "Saved confirmed embedding"),
            Err(e) => warn!(face_id, error = %e, "Could not save confirmed embedding"),
        }
    }
    println!("Face {} confirmed", face_id);
    Ok(())
}
