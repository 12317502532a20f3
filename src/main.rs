//! llmcore CLI - text generation on top of a generation session
//!
//! Loads a model through `ModelBuilder`, then streams or prints a completion.

use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use rs_llmcore::{GenerationConfig, GenerationSession, ModelBuilder};

#[derive(Parser)]
#[command(name = "llmcore")]
#[command(author, version, about = "Stateful text generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Model file or directory
    #[arg(short, long)]
    model: PathBuf,

    /// Model type (detected from config.json if omitted)
    #[arg(long)]
    model_type: Option<String>,

    /// Model file inside the directory, when it holds several
    #[arg(long)]
    model_file: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a prompt
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        /// Input prompt
        #[arg(short, long)]
        prompt: String,

        /// Maximum new tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Top-k sampling
        #[arg(long)]
        top_k: Option<i32>,

        /// Top-p sampling threshold
        #[arg(long)]
        top_p: Option<f32>,

        /// Sampling temperature (0.0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,

        /// Repetition penalty (1.0 = disabled)
        #[arg(long)]
        repetition_penalty: Option<f32>,

        /// Tokens considered for the repetition penalty (-1 = whole context)
        #[arg(long, allow_hyphen_values = true)]
        last_n_tokens: Option<i32>,

        /// Sampling seed (-1 = time based)
        #[arg(long, allow_hyphen_values = true)]
        seed: Option<i64>,

        /// Tokens per evaluation batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Evaluation threads (-1 = auto)
        #[arg(long, allow_hyphen_values = true)]
        threads: Option<i32>,

        /// Stop sequence (repeatable)
        #[arg(long)]
        stop: Vec<String>,

        /// Print the whole completion at the end instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Show information about a model
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_llmcore=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            prompt,
            max_tokens,
            top_k,
            top_p,
            temperature,
            repetition_penalty,
            last_n_tokens,
            seed,
            batch_size,
            threads,
            stop,
            no_stream,
        } => {
            let (mut session, mut config) = load(&model)?;

            if let Some(v) = max_tokens {
                config.max_new_tokens = v;
            }
            if let Some(v) = top_k {
                config.top_k = v;
            }
            if let Some(v) = top_p {
                config.top_p = v;
            }
            if let Some(v) = temperature {
                config.temperature = v;
            }
            if let Some(v) = repetition_penalty {
                config.repetition_penalty = v;
            }
            if let Some(v) = last_n_tokens {
                config.last_n_tokens = v;
            }
            if let Some(v) = seed {
                config.seed = v;
            }
            if let Some(v) = batch_size {
                config.batch_size = v;
            }
            if let Some(v) = threads {
                config.threads = v;
            }
            if !stop.is_empty() {
                config.stop = stop;
            }

            generate(&mut session, &prompt, &config, !no_stream)?;
        }

        Commands::Info { model } => {
            let (session, config) = load(&model)?;
            show_info(&session, &config)?;
        }
    }

    Ok(())
}

fn load(args: &ModelArgs) -> anyhow::Result<(GenerationSession, GenerationConfig)> {
    let mut builder = ModelBuilder::new(&args.model);
    if let Some(model_type) = &args.model_type {
        builder = builder.model_type(model_type.as_str());
    }
    if let Some(model_file) = &args.model_file {
        builder = builder.model_file(model_file.as_str());
    }
    Ok(builder.build()?)
}

fn generate(
    session: &mut GenerationSession,
    prompt: &str,
    config: &GenerationConfig,
    stream: bool,
) -> anyhow::Result<()> {
    let pb = if !stream {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
        Some(pb)
    } else {
        None
    };

    let mut output = String::new();
    let mut stdout = io::stdout();
    for fragment in session.stream(prompt, config)? {
        let fragment = fragment?;
        if let Some(pb) = &pb {
            output.push_str(&fragment);
            pb.set_message(format!("{} characters", output.len()));
            pb.tick();
        } else {
            print!("{}", fragment);
            stdout.flush()?;
        }
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
        print!("{}", output);
    }
    println!();

    Ok(())
}

fn show_info(session: &GenerationSession, config: &GenerationConfig) -> anyhow::Result<()> {
    println!("Model Information");
    println!("=================");
    println!("Model type: {}", session.model_type());
    println!("Context length: {}", session.context_length());
    println!("Vocab size: {}", session.vocab_size());
    println!(
        "EOS token: {} ({:?})",
        session.eos_token(),
        session.detokenize(session.eos_token())
    );
    println!("Special tokens: {:?}", session.vocabulary().special_tokens());
    if let Some(marker) = session.model_type().eos_marker() {
        println!("Extra EOS marker: {:?}", marker);
    }

    println!("\nGeneration Defaults");
    println!("===================");
    println!("{}", serde_json::to_string_pretty(config)?);

    Ok(())
}
