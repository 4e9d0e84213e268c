use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use itertools::Itertools;
use serde::Deserialize;
use structopt::StructOpt;

use crosschat::{
    BackoffPolicy, ConversationEvent, ConversationSettings, EndpointError, GenerationOptions,
    OllamaEndpoint, Outcome, Persona, Speaker, SpeakerInfo, TranscriptHeader, TranscriptWriter,
    list_models, orchestrator,
};

const DEFAULT_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_TOPIC: &str =
    "Discuss whether our universe could reside inside a black hole: pros, cons, and implications.";

#[derive(Deserialize, Debug, Default)]
struct Environment {
    crosschat_first_url: Option<String>,
    crosschat_second_url: Option<String>,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "crosschat",
    about = "Cross-chat between two Ollama endpoints, taking turns on a topic"
)]
struct Args {
    /// Base URL of the first endpoint
    #[structopt(long)]
    first_url: Option<String>,

    /// Base URL of the second endpoint
    #[structopt(long)]
    second_url: Option<String>,

    /// Model to run on the first endpoint
    #[structopt(long)]
    first_model: Option<String>,

    /// Model to run on the second endpoint
    #[structopt(long)]
    second_model: Option<String>,

    /// Display name of the first persona
    #[structopt(long)]
    first_name: Option<String>,

    /// Display name of the second persona
    #[structopt(long)]
    second_name: Option<String>,

    /// Topic for the two personas to discuss
    #[structopt(short, long)]
    topic: Option<String>,

    /// Total number of turns
    #[structopt(long, default_value = "50")]
    turns: usize,

    /// Which persona speaks first (first or second)
    #[structopt(long, default_value = "first")]
    first_speaker: Speaker,

    /// Sampling temperature
    #[structopt(long, default_value = "0.7")]
    temperature: f32,

    /// Delay between turns, in seconds
    #[structopt(long, default_value = "0.4")]
    delay: f64,

    /// HTTP timeout per generation call, in seconds
    #[structopt(long, default_value = "180")]
    timeout: u64,

    /// Retries after a generation timeout
    #[structopt(long, default_value = "3")]
    retries: u32,

    /// Base delay of the exponential retry backoff, in seconds
    #[structopt(long, default_value = "1.5")]
    retry_backoff: f64,

    /// Max tokens to generate per reply
    #[structopt(long, default_value = "300")]
    num_predict: u32,

    /// Most recent turns included as context in each request
    #[structopt(long, default_value = "10")]
    history_window: usize,

    /// Transcript path or directory; a unique filename is always derived
    #[structopt(long, parse(from_os_str))]
    logfile: Option<PathBuf>,

    /// Optional TOML settings file; flags take precedence
    #[structopt(short = "c", long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// List the models available on both endpoints and exit
    #[structopt(long)]
    list_models: bool,

    /// Pull models that are missing from their endpoint before starting
    #[structopt(long)]
    pull: bool,
}

#[derive(Deserialize, Debug, Default)]
struct FileConfig {
    first: Option<SideConfig>,
    second: Option<SideConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct SideConfig {
    url: Option<String>,
    model: Option<String>,
    name: Option<String>,
}

struct Side {
    name: String,
    url: String,
    model: String,
}

fn resolve_side(
    which: &str,
    default_name: &str,
    url: Option<String>,
    env_url: Option<String>,
    model: Option<String>,
    name: Option<String>,
    config: SideConfig,
) -> anyhow::Result<Side> {
    let url = url
        .or(env_url)
        .or(config.url)
        .unwrap_or_else(|| DEFAULT_URL.to_owned());
    let model = model.or(config.model).with_context(|| {
        format!(
            "no model selected for the {which} endpoint; \
             pass --{which}-model or set [{which}].model in the settings file"
        )
    })?;
    let name = name
        .or(config.name)
        .unwrap_or_else(|| default_name.to_owned());
    Ok(Side {
        name,
        url: url.trim_end_matches('/').to_owned(),
        model,
    })
}

/// Verify the selected model is present on its node, pulling it when asked to.
async fn ensure_model(side: &Side, pull: bool, options: &GenerationOptions) -> anyhow::Result<()> {
    let models = list_models(&side.url)
        .await
        .with_context(|| format!("failed to list models on {}", side.url))?;
    if models.iter().any(|model| model == &side.model) {
        return Ok(());
    }
    if !pull {
        return Err(EndpointError::ModelNotFound {
            model: side.model.clone(),
            url: side.url.clone(),
        }
        .into());
    }

    println!("Pulling {} on {}…", side.model, side.url);
    let endpoint = OllamaEndpoint::new(&side.url, &side.model, options.clone());
    let progress = endpoint.pull();
    let mut progress = std::pin::pin!(progress);
    while let Some(update) = progress.next().await {
        println!("  {}", update.context("model pull failed")?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let environment = envy::from_env::<Environment>()?;
    let args = Args::from_args();

    let config: FileConfig = match &args.config {
        Some(path) => toml::from_str(
            &tokio::fs::read_to_string(path)
                .await
                .context("Failed to read settings file")?,
        )
        .context("Failed to parse settings TOML")?,
        None => FileConfig::default(),
    };

    let first = resolve_side(
        "first",
        "Bob",
        args.first_url,
        environment.crosschat_first_url,
        args.first_model,
        args.first_name,
        config.first.unwrap_or_default(),
    );
    let second = resolve_side(
        "second",
        "Jane",
        args.second_url,
        environment.crosschat_second_url,
        args.second_model,
        args.second_name,
        config.second.unwrap_or_default(),
    );

    if args.list_models {
        // Listing does not need a model selection, so a missing model is not
        // an error here; fall back to whatever URLs the sides resolved to.
        let first_url = first.as_ref().map_or(DEFAULT_URL, |side| side.url.as_str());
        let second_url = second
            .as_ref()
            .map_or(DEFAULT_URL, |side| side.url.as_str());
        for (label, url) in [("first", first_url), ("second", second_url)] {
            let models = list_models(url)
                .await
                .with_context(|| format!("failed to list models on {url}"))?;
            println!("{label} ({url}): {}", models.iter().join(", "));
        }
        return Ok(());
    }

    let first = first?;
    let second = second?;

    let options = GenerationOptions {
        temperature: args.temperature,
        num_predict: args.num_predict,
        timeout: Duration::from_secs(args.timeout),
        backoff: BackoffPolicy {
            max_attempts: args.retries + 1,
            base_delay: Duration::from_secs_f64(args.retry_backoff.max(0.0)),
            multiplier: 2.0,
        },
    };

    ensure_model(&first, args.pull, &options).await?;
    ensure_model(&second, args.pull, &options).await?;

    let topic = args.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_owned());
    let log_path = crosschat::derive_log_path(args.logfile.as_deref(), &first.model, &second.model);
    let header = TranscriptHeader {
        topic: topic.clone(),
        first: SpeakerInfo {
            name: first.name.clone(),
            url: first.url.clone(),
            model: first.model.clone(),
        },
        second: SpeakerInfo {
            name: second.name.clone(),
            url: second.url.clone(),
            model: second.model.clone(),
        },
        settings: format!(
            "turns={} temperature={} num_predict={} history_window={} delay={}s",
            args.turns, args.temperature, args.num_predict, args.history_window, args.delay
        ),
    };
    let writer = TranscriptWriter::create(&log_path, &header)
        .with_context(|| format!("failed to create transcript at {}", log_path.display()))?;

    println!("=== Cross-chat starting ===");
    println!("{}: {}  model={}", first.name, first.url, first.model);
    println!("{}: {}  model={}", second.name, second.url, second.model);
    println!("Topic: {topic}");
    println!("Transcript: {}", log_path.display());
    println!();

    let settings = ConversationSettings {
        topic,
        max_turns: args.turns,
        turn_delay: Duration::from_secs_f64(args.delay.max(0.0)),
        history_window: args.history_window,
        first_speaker: args.first_speaker,
    };
    let personas = [
        Persona {
            name: first.name,
            backend: OllamaEndpoint::new(&first.url, &first.model, options.clone()),
        },
        Persona {
            name: second.name,
            backend: OllamaEndpoint::new(&second.url, &second.model, options),
        },
    ];

    let mut handle = orchestrator::start(settings, personas, writer);
    let canceller = handle.canceller();

    let outcome = loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(ConversationEvent::TurnCompleted(turn)) => {
                    println!("[{} / {}]\n{}\n", turn.speaker, turn.model, turn.text);
                }
                Some(ConversationEvent::Finished(outcome)) => break outcome,
                None => break Outcome::Failed("conversation loop dropped its events".to_owned()),
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stop requested; finishing the current turn…");
                canceller.cancel();
            }
        }
    };
    handle.join().await;

    match outcome {
        Outcome::Completed => println!("=== Cross-chat complete ==="),
        Outcome::Cancelled => println!("=== Cross-chat cancelled; partial transcript kept ==="),
        Outcome::Failed(reason) => anyhow::bail!(reason),
    }
    Ok(())
}
