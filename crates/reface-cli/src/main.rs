use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reface_core::{ImageRef, JobOptions, JobOutput, JobRequest, JobRunner, OutputFormat, ProcessType};
use reface_models::{ManagerConfig, ModelLocator, ModelResourceManager, OnnxCapabilities, OnnxSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BUS_NAME: &str = "org.reface.Engine1";
const OBJECT_PATH: &str = "/org/reface/Engine1";

#[derive(Parser)]
#[command(name = "reface", about = "Face identity transfer from the command line")]
struct Cli {
    /// Model directory searched before the default locations
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Compositing {
    /// Skip face restoration
    #[arg(long)]
    no_restore: bool,
    /// Keep the target's mouth region
    #[arg(long)]
    mouth_blend: bool,
    /// Match the swapped face's colour to the target
    #[arg(long)]
    color_correct: bool,
}

impl Compositing {
    fn options(&self, output: &Path) -> JobOptions {
        let output_format = match output.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => OutputFormat::Png,
            _ => OutputFormat::Jpeg,
        };
        JobOptions {
            use_restoration: !self.no_restore,
            mouth_region_blend: self.mouth_blend,
            color_correction: self.color_correct,
            output_format,
            ..JobOptions::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Put the source face onto the main face of the target
    Swap {
        #[arg(short, long)]
        source: PathBuf,
        #[arg(short, long)]
        target: PathBuf,
        /// Output image (.png or .jpg)
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        compositing: Compositing,
    },
    /// Swap several faces of the target at once
    Multi {
        #[arg(short, long)]
        target: PathBuf,
        /// Face mapping, e.g. face_0=alice.jpg (repeatable)
        #[arg(short, long = "map", value_parser = parse_mapping)]
        mappings: Vec<(String, PathBuf)>,
        /// Source for every face when no mapping is given
        #[arg(short, long, conflicts_with = "mappings")]
        source: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        compositing: Compositing,
    },
    /// List the faces in an image with their face_N ids
    Detect {
        image: PathBuf,
    },
    /// Swap the source face into every frame of a directory
    Frames {
        #[arg(short, long)]
        source: PathBuf,
        /// Directory of frame images
        #[arg(short, long)]
        input: PathBuf,
        /// Directory for processed frames
        #[arg(short, long)]
        output: PathBuf,
        /// Write frames as PNG instead of JPEG
        #[arg(long)]
        png: bool,
    },
    /// Send a JSON job file to refaced
    Submit {
        job: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Show where each model resolves
    Models,
}

fn parse_mapping(s: &str) -> Result<(String, PathBuf), String> {
    let (id, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected face_N=PATH, got {s:?}"))?;
    if id.is_empty() || path.is_empty() {
        return Err(format!("expected face_N=PATH, got {s:?}"));
    }
    Ok((id.to_string(), PathBuf::from(path)))
}

fn locator(models_dir: Option<PathBuf>) -> ModelLocator {
    match models_dir {
        Some(dir) => ModelLocator::with_override(Some(dir)),
        None => ModelLocator::from_env(),
    }
}

fn run_local(models_dir: Option<PathBuf>, request: &JobRequest) -> JobOutput {
    let manager = Arc::new(ModelResourceManager::new(locator(models_dir), ManagerConfig::default()));
    let caps = OnnxCapabilities::new(manager, OnnxSettings::default());
    tracing::debug!(kind = %request.process_type, "running job in-process");
    JobRunner::new(caps.capabilities()).run(request, None)
}

/// Write an inline result to `path` and print the rest of the output.
fn finish(mut output: JobOutput, path: Option<&Path>) -> Result<()> {
    if let (Some(path), Some(result)) = (path, output.result.take()) {
        let bytes = ImageRef(result).bytes()?;
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    if !output.success {
        bail!("{}", output.error.unwrap_or_else(|| "job failed".into()));
    }
    Ok(())
}

async fn call_daemon(method: &str, body: &str) -> Result<String> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let reply = if method == "Status" {
        conn.call_method(Some(BUS_NAME), OBJECT_PATH, Some(BUS_NAME), method, &())
            .await
    } else {
        conn.call_method(Some(BUS_NAME), OBJECT_PATH, Some(BUS_NAME), method, &(body,))
            .await
    }
    .with_context(|| format!("calling refaced {method}"))?;
    Ok(reply.body().deserialize::<String>()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Swap {
            source,
            target,
            output,
            compositing,
        } => {
            let mut request = JobRequest::new(ProcessType::SingleImage);
            request.source = Some(ImageRef::path(&source));
            request.target = Some(ImageRef::path(&target));
            request.options = compositing.options(&output);
            finish(run_local(cli.models_dir, &request), Some(&output))?;
        }
        Commands::Multi {
            target,
            mappings,
            source,
            output,
            compositing,
        } => {
            let mut request = JobRequest::new(ProcessType::MultiImage);
            request.target = Some(ImageRef::path(&target));
            request.source = source.as_deref().map(ImageRef::path);
            request.face_mappings = mappings
                .into_iter()
                .map(|(id, path)| (id, ImageRef::path(path)))
                .collect();
            if request.source.is_none() && request.face_mappings.is_empty() {
                bail!("give --source or at least one --map face_N=PATH");
            }
            request.options = compositing.options(&output);
            finish(run_local(cli.models_dir, &request), Some(&output))?;
        }
        Commands::Detect { image } => {
            let mut request = JobRequest::new(ProcessType::DetectFaces);
            request.target = Some(ImageRef::path(&image));
            finish(run_local(cli.models_dir, &request), None)?;
        }
        Commands::Frames {
            source,
            input,
            output,
            png,
        } => {
            std::fs::create_dir_all(&output).with_context(|| format!("creating {}", output.display()))?;
            let mut request = JobRequest::new(ProcessType::Video);
            request.source = Some(ImageRef::path(&source));
            request.target = Some(ImageRef::path(&input));
            request.output_dir = Some(output);
            if png {
                request.options.output_format = OutputFormat::Png;
            }
            finish(run_local(cli.models_dir, &request), None)?;
        }
        Commands::Submit { job } => {
            let json = std::fs::read_to_string(&job).with_context(|| format!("reading {}", job.display()))?;
            JobRequest::from_json(&json).context("invalid job file")?;
            let reply = call_daemon("Process", &json).await?;
            let output: JobOutput = serde_json::from_str(&reply)?;
            finish(output, None)?;
        }
        Commands::Status => {
            let status = call_daemon("Status", "").await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Models => {
            let locator = locator(cli.models_dir);
            println!("search roots:");
            for root in locator.roots() {
                println!("  {}", root.display());
            }
            let groups = [
                ("required", reface_models::REQUIRED_MODELS),
                ("optional", reface_models::OPTIONAL_MODELS),
            ];
            for (kind, names) in groups {
                for name in names {
                    match locator.locate(name) {
                        Ok(path) => println!("{kind:8} {name:28} {}", path.display()),
                        Err(_) => println!("{kind:8} {name:28} missing"),
                    }
                }
            }
        }
    }

    Ok(())
}
