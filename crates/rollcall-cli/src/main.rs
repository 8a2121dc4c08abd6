use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    CacheConfig, EmbeddingCache, EmbeddingExtractor, FaceMatchingEngine, MatchingConfig,
    OnnxExtractor, SessionContext, DEFAULT_RECOGNITION_THRESHOLD,
};
use rollcall_store::{NewStudent, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance administration CLI")]
struct Cli {
    /// SQLite database (default: $ROLLCALL_DB_PATH or $XDG_DATA_HOME/rollcall/rollcall.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or update a student and their reference photo
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Class identifier (case-insensitive)
        #[arg(long)]
        class: String,
        /// Reference photo (JPEG or PNG)
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// Extract signatures for students whose photo has none yet
    Precompute {
        /// Limit to one class
        #[arg(long)]
        class: Option<String>,
    },
    /// List the students of a class
    Roster {
        #[arg(long)]
        class: String,
        #[arg(long)]
        json: bool,
    },
    /// List attendance recorded for a session
    Attendance {
        #[arg(long)]
        session: String,
        #[arg(long)]
        json: bool,
    },
    /// Match a photo against a class roster without recording anything
    Match {
        #[arg(long)]
        class: String,
        #[arg(long)]
        photo: PathBuf,
        /// Largest accepted cosine distance
        #[arg(long, default_value_t = DEFAULT_RECOGNITION_THRESHOLD)]
        threshold: f32,
    },
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("rollcall.db")
}

fn load_extractor(model_dir: Option<PathBuf>) -> Result<OnnxExtractor> {
    let dir = model_dir
        .or_else(|| std::env::var("ROLLCALL_MODEL_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(rollcall_core::default_model_dir);
    OnnxExtractor::load(&dir).with_context(|| format!("failed to load models from {}", dir.display()))
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read photo {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            class,
            photo,
        } => {
            let reference_image = photo.as_deref().map(read_photo).transpose()?;
            store
                .enroll_student(NewStudent {
                    id: id.clone(),
                    display_name: name.clone(),
                    class_id: class,
                    reference_image,
                })
                .await?;
            println!("Enrolled {name} ({id})");
        }
        Commands::Precompute { class } => {
            let extractor = load_extractor(cli.model_dir)?;
            let pending = store.pending_signatures(class.as_deref()).await?;
            if pending.is_empty() {
                println!("All reference photos already have signatures");
                return Ok(());
            }

            let (mut saved, mut faceless, mut failed) = (0usize, 0usize, 0usize);
            for (student_id, image) in pending {
                match extractor.extract(&image) {
                    Ok(Some(signature)) => {
                        store.save_signature(&student_id, &signature).await?;
                        saved += 1;
                    }
                    Ok(None) => {
                        println!("  {student_id}: no face in reference photo");
                        faceless += 1;
                    }
                    Err(e) => {
                        tracing::warn!(%student_id, error = %e, "signature extraction failed");
                        failed += 1;
                    }
                }
            }
            println!("Saved {saved} signature(s); {faceless} without a face, {failed} failed");
        }
        Commands::Roster { class, json } => {
            let roster = store.list_roster(&class).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&roster)?);
            } else if roster.is_empty() {
                println!("No students in class {class}");
            } else {
                for s in &roster {
                    let photo = if s.has_reference_image { "photo" } else { "no photo" };
                    let sig = if s.has_signature { ", signature" } else { "" };
                    println!("{:<16} {:<32} ({photo}{sig})", s.id, s.display_name);
                }
            }
        }
        Commands::Attendance { session, json } => {
            let records = store.list_attendance(&session).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance recorded for session {session}");
            } else {
                for r in &records {
                    let name = r.display_name.as_deref().unwrap_or("?");
                    println!("{:<16} {:<32} {:<8} {}", r.student_id, name, r.status.as_str(), r.marked_at);
                }
            }
        }
        Commands::Match {
            class,
            photo,
            threshold,
        } => {
            let image = read_photo(&photo)?;
            let extractor: Arc<dyn EmbeddingExtractor> = Arc::new(load_extractor(cli.model_dir)?);
            let global = Arc::new(store.load_precomputed().await?);
            let cache = Arc::new(EmbeddingCache::new(extractor.clone(), global, CacheConfig::default()));
            let engine = FaceMatchingEngine::new(
                Arc::new(store),
                extractor,
                cache,
                MatchingConfig {
                    recognition_threshold: threshold,
                    ..MatchingConfig::default()
                },
            );
            let Ok(session) = SessionContext::new("cli-match", "", &class, None, None) else {
                bail!("class identifier is empty");
            };
            let result = engine.recognize(&session, &image).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
