mod config;
mod engine;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use engine::{Job, JobOutput};
use facematch_core::{
    CancelFlag, FaceDetector, FacePipeline, FaceRecognizer, MemoryStore, NewIdentity, RecognizeOptions, VectorStore,
};
use facematch_store::MilvusStore;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facematch", about = "Face detection, enrollment and recognition against a vector store")]
struct Cli {
    /// TOML configuration file; FACEMATCH_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the most prominent face of an image
    Register {
        image: PathBuf,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        person_id: String,
        #[arg(short, long, default_value = "")]
        remark: String,
    },
    /// Search enrolled faces for the most prominent face of each image
    Recognize {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Minimum similarity in [0, 1]
        #[arg(short, long)]
        threshold: Option<f32>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Detect faces without touching the vector store
    Detect {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove one enrolled face
    Delete { face_id: String },
    /// Remove every face enrolled for a person
    DeletePerson { person_id: String },
    /// Drop and recreate the face collection
    Reset {
        /// Confirm removal of all enrolled faces
        #[arg(long)]
        yes: bool,
    },
    /// List enrolled faces
    List {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Look up enrolled faces by person or name
    Query {
        #[arg(short, long, conflicts_with = "name", required_unless_present = "name")]
        person_id: Option<String>,
        #[arg(short, long)]
        name: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Register {
            image,
            name,
            person_id,
            remark,
        } => {
            let pipeline = build_pipeline(&config, Box::new(connect_store(&config)?))?;
            let job = Job::Register {
                image: read_image(&image)?,
                identity: NewIdentity {
                    person_id,
                    name,
                    remark,
                },
            };
            let outputs = run_jobs(&config, pipeline, vec![(image, job)])?;
            print_outputs(outputs)
        }
        Commands::Recognize {
            images,
            threshold,
            top_k,
        } => {
            let pipeline = build_pipeline(&config, Box::new(connect_store(&config)?))?;
            let options = RecognizeOptions { threshold, top_k };
            let jobs = images
                .into_iter()
                .map(|path| Ok((path.clone(), Job::Recognize { image: read_image(&path)?, options })))
                .collect::<Result<Vec<_>>>()?;
            print_outputs(run_jobs(&config, pipeline, jobs)?)
        }
        Commands::Detect { images } => {
            let store = MemoryStore::new(config.matching.metric, config.recognizer.feature_dim);
            let pipeline = build_pipeline(&config, Box::new(store))?;
            let jobs = images
                .into_iter()
                .map(|path| Ok((path.clone(), Job::Detect { image: read_image(&path)? })))
                .collect::<Result<Vec<_>>>()?;
            print_outputs(run_jobs(&config, pipeline, jobs)?)
        }
        Commands::Delete { face_id } => {
            connect_store(&config)?.delete_face(&face_id)?;
            tracing::info!(face_id = %face_id, "face deleted");
            print_json(&json!({ "deleted": face_id }))
        }
        Commands::DeletePerson { person_id } => {
            connect_store(&config)?.delete_person(&person_id)?;
            tracing::info!(person_id = %person_id, "person deleted");
            print_json(&json!({ "deleted_person": person_id }))
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset removes every enrolled face; pass --yes to confirm");
            }
            connect_store(&config)?.reset()?;
            tracing::warn!(collection = %config.milvus.collection, "collection reset");
            print_json(&json!({ "reset": config.milvus.collection }))
        }
        Commands::List { limit } => print_json(&json!(connect_store(&config)?.list(limit)?)),
        Commands::Query { person_id, name } => {
            let store = connect_store(&config)?;
            let records = match (person_id, name) {
                (Some(person_id), _) => store.query_by_person(&person_id)?,
                (None, Some(name)) => store.query_by_name(&name)?,
                (None, None) => bail!("either --person-id or --name is required"),
            };
            print_json(&json!(records))
        }
    }
}

fn connect_store(config: &Config) -> Result<MilvusStore> {
    MilvusStore::connect(config.milvus.clone())
        .with_context(|| format!("connecting to vector store at {}", config.milvus.endpoint))
}

/// Load both models and assemble a pipeline. Fails fast if either model is unusable.
fn build_pipeline(config: &Config, store: Box<dyn VectorStore>) -> Result<Arc<FacePipeline>> {
    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(&detector_path, config.session, config.detector.clone())
        .with_context(|| format!("loading detector from {}", detector_path.display()))?;
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let recognizer_path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&recognizer_path, config.session, config.recognizer.clone())
        .with_context(|| format!("loading recognizer from {}", recognizer_path.display()))?;
    tracing::info!(path = %recognizer_path.display(), "ArcFace recognizer loaded");

    Ok(Arc::new(FacePipeline::new(
        detector,
        recognizer,
        config.alignment.clone(),
        config.matching,
        store,
    )))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

/// Fan jobs out over the worker pool and collect one JSON result per input, in order.
fn run_jobs(config: &Config, pipeline: Arc<FacePipeline>, jobs: Vec<(PathBuf, Job)>) -> Result<Vec<Value>> {
    let cancel = CancelFlag::new();
    install_ctrl_c(cancel.clone())?;

    let (handle, workers) = engine::spawn_engine(pipeline, config.workers, config.queue_capacity, cancel)?;

    let mut pending = Vec::with_capacity(jobs.len());
    for (path, job) in jobs {
        pending.push((path, handle.submit(job)?));
    }
    drop(handle);

    let results = pending
        .into_iter()
        .map(|(path, reply)| match reply.wait() {
            Ok(output) => render(&path, output),
            Err(e) => {
                tracing::error!(image = %path.display(), error = %e, "request failed");
                json!({ "image": path.display().to_string(), "error": e.to_string() })
            }
        })
        .collect();

    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
    Ok(results)
}

fn render(path: &Path, output: JobOutput) -> Value {
    let image = path.display().to_string();
    match output {
        JobOutput::Registered(reg) => json!({
            "image": image,
            "record": reg.record,
            "face": reg.face,
            "faces_detected": reg.faces_detected,
        }),
        JobOutput::Recognized(rec) => json!({
            "image": image,
            "face": rec.face,
            "faces_detected": rec.faces_detected,
            "matches": rec.matches,
        }),
        JobOutput::Detected(faces) => json!({
            "image": image,
            "faces": faces,
        }),
    }
}

fn print_outputs(outputs: Vec<Value>) -> Result<()> {
    let failed = outputs.iter().filter(|v| v.get("error").is_some()).count();
    print_json(&Value::Array(outputs))?;
    if failed > 0 {
        bail!("{failed} request(s) failed");
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Trip `cancel` on Ctrl-C. Requests observe it at their next stage boundary.
fn install_ctrl_c(cancel: CancelFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    std::thread::Builder::new()
        .name("facematch-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling outstanding requests");
                    cancel.cancel();
                }
            });
        })
        .context("spawning signal thread")?;
    Ok(())
}
