use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use studio_core::history::HistoryRecord;
use studio_core::params::{
    AspectRatio, GenerationMode, GenerationParameters, ImageRef, LoraEntry, Resolution,
};
use studio_session::{OptionKind, SessionEvent, StudioConfig, StudioManager};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "studio")]
#[command(about = "Drive a ComfyUI server: generate, edit and animate images, browse history")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend address, overrides COMFYUI_SERVER
    #[arg(short, long, global = true)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Text to image
    Generate {
        prompt: String,

        #[command(flatten)]
        common: JobArgs,

        /// Aspect ratio (1:1, 9:16, 16:9, 3:4, 4:3, 2:3, 3:2)
        #[arg(long)]
        aspect: Option<String>,

        /// Style text appended to the prompt
        #[arg(long)]
        style: Option<String>,
    },

    /// Edit one to three images with a prompt
    Edit {
        prompt: String,

        #[command(flatten)]
        common: JobArgs,

        #[command(flatten)]
        images: ImageArgs,

        /// Aspect ratio of the output
        #[arg(long)]
        aspect: Option<String>,
    },

    /// Animate one image into a short clip
    Video {
        prompt: String,

        #[command(flatten)]
        common: JobArgs,

        #[command(flatten)]
        images: ImageArgs,

        /// Resolution preset (480p, 480p-landscape, 720p, 720p-landscape)
        #[arg(long, default_value = "480p")]
        resolution: String,

        /// Clip length in seconds
        #[arg(long, default_value = "3")]
        duration: u32,

        /// Run the interpolation stage
        #[arg(long)]
        extend: bool,
    },

    /// Show or clear the shared history log
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,
    },

    /// Delete a generated file and its history records
    Delete {
        /// Output filename as listed by `history`
        filename: String,
    },

    /// List server-side choices (loras, models, images, samplers, schedulers)
    List { kind: OptionKind },

    /// Saved prompts
    Prompts {
        #[command(subcommand)]
        action: Option<PromptAction>,
    },

    /// Toggle a favourite, or list favourites when no filename is given
    Favourite { filename: Option<String> },

    /// Stop the running job on the server
    Interrupt,

    /// Unload models and free VRAM
    Free,

    /// Check that the backend answers
    Ping,
}

#[derive(Subcommand)]
enum HistoryAction {
    List,
    Clear,
}

#[derive(Subcommand)]
enum PromptAction {
    List,
    Add { text: String },
    Remove { text: String },
}

#[derive(clap::Args)]
struct JobArgs {
    #[arg(long, default_value = "")]
    negative: String,

    /// Random when omitted
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    steps: Option<u32>,

    /// LoRA as NAME or NAME:STRENGTH, repeatable
    #[arg(long = "lora")]
    loras: Vec<String>,
}

#[derive(clap::Args)]
struct ImageArgs {
    /// Local image to upload, repeatable
    #[arg(short, long = "image")]
    images: Vec<PathBuf>,

    /// Image already in the server's input folder, repeatable
    #[arg(long = "server-image")]
    server_images: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studio=info,studio_session=info,studio_comfyui=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = StudioConfig::from_env()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let manager = StudioManager::start(config).await?;
    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &Arc<StudioManager>, command: Commands) -> Result<()> {
    match command {
        Commands::Generate {
            prompt,
            common,
            aspect,
            style,
        } => {
            let mut params = job_params(GenerationMode::Generate, prompt, common)?;
            if let Some(aspect) = aspect {
                params.resolution = Resolution::Aspect(aspect.parse::<AspectRatio>()?);
            }
            params.style_suffix = style;
            generate(manager, params).await
        }
        Commands::Edit {
            prompt,
            common,
            images,
            aspect,
        } => {
            let mut params = job_params(GenerationMode::Edit, prompt, common)?;
            params.input_images = images.into_refs();
            if let Some(aspect) = aspect {
                params.resolution = Resolution::Aspect(aspect.parse::<AspectRatio>()?);
            }
            generate(manager, params).await
        }
        Commands::Video {
            prompt,
            common,
            images,
            resolution,
            duration,
            extend,
        } => {
            let mut params = job_params(GenerationMode::Video, prompt, common)?;
            params.input_images = images.into_refs();
            params.resolution = Resolution::Preset(resolution);
            params.video.duration_seconds = duration;
            params.video.extend = extend;
            generate(manager, params).await
        }
        Commands::History { action } => match action.unwrap_or(HistoryAction::List) {
            HistoryAction::List => {
                let page = manager.load_history().await?;
                if page.skipped > 0 {
                    eprintln!("{} unreadable item(s) skipped", page.skipped);
                }
                for entry in page.entries {
                    println!(
                        "{}  {:<8} {}  {}",
                        entry.record.id,
                        entry.record.mode.map(|m| m.as_str()).unwrap_or("-"),
                        entry.record.filename,
                        entry.image_url
                    );
                }
                Ok(())
            }
            HistoryAction::Clear => {
                manager.clear_history().await?;
                println!("History cleared");
                Ok(())
            }
        },
        Commands::Delete { filename } => {
            let record = find_record(manager, &filename).await?;
            let outcome = manager.delete_artifact(&record).await?;
            println!("{filename}: {outcome:?}");
            Ok(())
        }
        Commands::List { kind } => {
            for option in manager.list_options(kind).await? {
                println!("{option}");
            }
            Ok(())
        }
        Commands::Prompts { action } => match action.unwrap_or(PromptAction::List) {
            PromptAction::List => {
                for prompt in manager.prompts().list().await? {
                    println!("{}", prompt.text);
                }
                Ok(())
            }
            PromptAction::Add { text } => {
                if !manager.prompts().add(&text).await? {
                    println!("Already saved");
                }
                Ok(())
            }
            PromptAction::Remove { text } => {
                if !manager.prompts().remove(&text).await? {
                    println!("No such prompt");
                }
                Ok(())
            }
        },
        Commands::Favourite { filename: None } => {
            for filename in manager.favourites().list().await? {
                println!("{filename}");
            }
            Ok(())
        }
        Commands::Favourite {
            filename: Some(filename),
        } => {
            let starred = manager.favourites().toggle(&filename).await?;
            println!("{filename}: {}", if starred { "starred" } else { "unstarred" });
            Ok(())
        }
        Commands::Interrupt => {
            manager.interrupt().await;
            Ok(())
        }
        Commands::Free => {
            manager.free_memory().await;
            Ok(())
        }
        Commands::Ping => {
            manager
                .check_connection()
                .await
                .with_context(|| "Backend is not reachable")?;
            println!("ok");
            Ok(())
        }
    }
}

/// Submit and wait for the session to end. Ctrl-C interrupts the job.
async fn generate(manager: &Arc<StudioManager>, params: GenerationParameters) -> Result<()> {
    let mut events = manager.subscribe();
    let prompt_id = manager.generate(params).await?;
    tracing::info!(prompt_id = %prompt_id, "Queued");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.interrupt().await;
                bail!("Interrupted");
            }
            event = events.recv() => event,
        };

        match event {
            Ok(SessionEvent::Progress { percent, .. }) => {
                eprintln!("{percent:>3}%");
            }
            Ok(SessionEvent::PhaseChanged { phase, .. }) => {
                eprintln!("{phase:?}");
            }
            Ok(SessionEvent::Finished { entry }) => {
                println!("{}", serde_json::to_string_pretty(&entry)?);
                return Ok(());
            }
            Ok(SessionEvent::Failed { message, .. }) => bail!(message),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event receiver lagged");
            }
            Err(RecvError::Closed) => bail!("Session closed before the job finished"),
        }
    }
}

fn job_params(mode: GenerationMode, prompt: String, args: JobArgs) -> Result<GenerationParameters> {
    let mut params = GenerationParameters::new(mode, prompt);
    params.negative_prompt = args.negative;
    params.seed = args
        .seed
        .unwrap_or_else(|| uuid::Uuid::new_v4().as_u64_pair().0 >> 1);
    if let Some(steps) = args.steps {
        params.steps = steps;
    }
    params.loras = args
        .loras
        .iter()
        .map(|raw| parse_lora(raw))
        .collect::<Result<_>>()?;
    Ok(params)
}

fn parse_lora(raw: &str) -> Result<LoraEntry> {
    match raw.rsplit_once(':') {
        Some((name, strength)) => {
            let strength = strength
                .parse::<f64>()
                .with_context(|| format!("Bad LoRA strength in '{raw}'"))?;
            Ok(LoraEntry::new(name, strength))
        }
        None => Ok(LoraEntry::new(raw, 1.0)),
    }
}

impl ImageArgs {
    fn into_refs(self) -> Vec<ImageRef> {
        self.images
            .into_iter()
            .map(ImageRef::Local)
            .chain(self.server_images.into_iter().map(ImageRef::Server))
            .collect()
    }
}

async fn find_record(manager: &StudioManager, filename: &str) -> Result<HistoryRecord> {
    manager
        .load_history()
        .await?
        .entries
        .into_iter()
        .map(|entry| entry.record)
        .find(|record| record.filename == filename)
        .with_context(|| format!("{filename} is not in the history log"))
}
