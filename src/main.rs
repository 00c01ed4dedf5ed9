use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chatreel::api::{build_router, AppState};
use chatreel::config::Settings;
use chatreel::conversation::{Conversation, VoiceSelection};
use chatreel::dialogue::{DialogueRequest, OpenAiDialogue, DEFAULT_MESSAGE_COUNT, DEFAULT_STYLE};
use chatreel::encoding::FfmpegEncoder;
use chatreel::jobs::{JobRunner, JobStore};
use chatreel::pipeline::{ChatPainterFactory, Pipeline, RenderRequest, Script, Services, SCROLL_KEY};
use chatreel::probe::FfprobeDuration;
use chatreel::reveal::plan_reveal;
use chatreel::speech::OpenAiSpeech;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CHATREEL_GIT_HASH"),
    ")"
);

#[derive(Debug, Parser)]
#[command(name = "chatreel", version = VERSION)]
#[command(about = "Render text-message conversations into voiced chat videos")]
struct Cli {
    /// YAML settings file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP job API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Render a conversation JSON file to a video.
    Render {
        convo: PathBuf,
        #[command(flatten)]
        people: People,
    },
    /// Generate a dialogue and render it.
    Generate {
        /// What the conversation should be about.
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, default_value = DEFAULT_STYLE)]
        style: String,
        #[arg(long, default_value_t = DEFAULT_MESSAGE_COUNT)]
        messages: usize,
        #[command(flatten)]
        people: People,
    },
    /// Print the layout and reveal plan of a conversation as JSON.
    Plan { convo: PathBuf },
}

#[derive(Debug, clap::Args)]
struct People {
    #[arg(long, default_value = "Alice")]
    contact_name: String,
    #[arg(long, default_value = "")]
    contact_gender: String,
    #[arg(long, default_value = "")]
    your_gender: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => run_serve(settings, host, port).await,
        Commands::Render { convo, people } => {
            let conversation = Conversation::load_json(&convo)?;
            run_render(settings, people, Script::Turns(conversation)).await
        }
        Commands::Generate {
            prompt,
            style,
            messages,
            people,
        } => {
            let request = DialogueRequest {
                contact_name: people.contact_name.clone(),
                self_name: settings.layout.self_sender.clone(),
                messages,
                style,
                topic: prompt,
            };
            run_render(settings, people, Script::Generate(request)).await
        }
        Commands::Plan { convo } => run_plan(&settings, &convo),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn live_services(settings: &Settings) -> Result<Services> {
    let api_key = settings.require_api_key()?;
    Ok(Services {
        renderer: Arc::new(ChatPainterFactory::new(settings)),
        speech: Arc::new(OpenAiSpeech::new(&settings.speech, api_key)?),
        probe: Arc::new(FfprobeDuration),
        encoder: Arc::new(FfmpegEncoder::new(settings.encoder.clone())),
        dialogue: Some(Arc::new(OpenAiDialogue::new(&settings.dialogue, api_key)?)),
    })
}

async fn run_serve(mut settings: Settings, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    let services = live_services(&settings)?;
    let address = format!("{}:{}", settings.server.host, settings.server.port);
    let settings = Arc::new(settings);

    let runner = JobRunner::new(JobStore::new(), Pipeline::new(Arc::clone(&settings), services));
    let app = build_router(AppState { runner });

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(
        address = %address,
        output_dir = %settings.paths.output_dir.display(),
        version = VERSION,
        "chatreel listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_render(settings: Settings, people: People, script: Script) -> Result<()> {
    let services = live_services(&settings)?;
    let voices = VoiceSelection::from_genders(&people.your_gender, &people.contact_gender, &settings.speech);
    let pipeline = Pipeline::new(Arc::new(settings), services);
    let request = RenderRequest {
        contact_name: people.contact_name,
        voices,
        script,
    };

    let report = |stage: chatreel::pipeline::Stage| {
        eprintln!("[{:>3}%] {:?}", stage.progress(), stage);
    };
    let output = match pipeline.run(request, SCROLL_KEY, &report).await {
        Ok(output) => output,
        Err(error) => {
            println!("{}", serde_json::to_string(&error.envelope())?);
            return Err(error.into());
        }
    };
    println!("Wrote {}", output.display());
    Ok(())
}

fn run_plan(settings: &Settings, convo: &Path) -> Result<()> {
    let conversation = Conversation::load_json(convo)?;
    let plan = plan_reveal(&conversation, &settings.layout, &settings.reveal);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
