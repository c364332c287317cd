// chat-inference/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use anyhow::Context;
    use chat_inference::{
        append_with_retry,
        chat_templates::EngineKind,
        config::{Config, GenerationConfig},
        metrics,
        model_runtime::{gguf_metadata, router::engine_for, FormatDetector, LoadConfig, ModelFormat},
        telemetry, GenerationRequest, InMemoryMemoryStore, InferenceService, MemoryStore, Message,
    };
    use clap::{Parser, Subcommand};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;

    #[derive(Parser)]
    #[command(name = "chat-inference")]
    #[command(about = "Run local chat models through llama.cpp or a transformers runtime")]
    #[command(version)]
    struct Cli {
        #[command(subcommand)]
        command: Commands,
    }

    #[derive(Subcommand)]
    enum Commands {
        /// Detect a model file's format and owning engine
        Detect { path: PathBuf },

        /// List registered templates
        Templates {
            #[arg(short, long)]
            engine: Option<EngineKind>,
        },

        /// Show which template a model name resolves to
        Resolve {
            model_name: String,

            #[arg(short, long, default_value = "llama-cpp")]
            engine: EngineKind,
        },

        /// Report engine availability and capabilities
        Status,

        /// Chat with a model. Without --prompt, reads turns from stdin.
        Chat {
            path: PathBuf,

            #[arg(short, long)]
            prompt: Option<String>,

            #[arg(short, long)]
            system: Option<String>,

            #[arg(long, default_value = "512")]
            max_tokens: u32,

            #[arg(short, long, default_value = "0.7")]
            temperature: f32,

            /// Print prometheus metrics on exit
            #[arg(long)]
            metrics: bool,
        },
    }

    pub async fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        telemetry::init_tracing("warn");

        let cfg = Config::from_env()?;

        match cli.command {
            Commands::Detect { path } => cmd_detect(&path),
            Commands::Templates { engine } => {
                let service = InferenceService::new(cfg);
                let engines = engine.map(|e| vec![e]).unwrap_or_else(|| EngineKind::ALL.to_vec());
                for engine in engines {
                    println!("{}:", engine);
                    for name in service.registry().list(engine) {
                        println!("  {}", name);
                    }
                }
                Ok(())
            }
            Commands::Resolve { model_name, engine } => {
                let service = InferenceService::new(cfg);
                let template = service.registry().resolve(&model_name, engine);
                println!("{} -> {} (priority {})", model_name, template.name, template.priority);
                println!("stop tokens: {:?}", template.stop_tokens);
                Ok(())
            }
            Commands::Status => {
                let service = InferenceService::new(cfg);
                for status in service.engine_status().await {
                    println!(
                        "{:<13} {:<12} available={} streaming={} gpu={} formats={:?}",
                        status.engine.tag(),
                        status.name,
                        status.available,
                        status.capabilities.streaming,
                        status.capabilities.gpu,
                        status.capabilities.formats
                    );
                }
                Ok(())
            }
            Commands::Chat {
                path,
                prompt,
                system,
                max_tokens,
                temperature,
                metrics: print_metrics,
            } => {
                let generation = GenerationConfig {
                    max_tokens,
                    temperature,
                    system_prompt: system.unwrap_or_default(),
                    ..GenerationConfig::default()
                };
                let load = LoadConfig::from_config(&cfg);
                let service = Arc::new(InferenceService::new(cfg));
                let result = cmd_chat(&service, &path, &load, generation, prompt).await;

                service.clear_all_models().await;
                if print_metrics {
                    print!("{}", metrics::render());
                }
                result
            }
        }
    }

    fn cmd_detect(path: &Path) -> anyhow::Result<()> {
        let format = FormatDetector::detect(path)?;
        let engine = engine_for(format)
            .map(|e| e.tag())
            .unwrap_or("none");
        println!("{}: {} (engine: {})", path.display(), format, engine);

        if format == ModelFormat::Gguf {
            match gguf_metadata::read(path) {
                Ok(meta) => {
                    println!("  GGUF v{}", meta.version);
                    if let Some(name) = &meta.name {
                        println!("  name: {}", name);
                    }
                    if let Some(arch) = &meta.architecture {
                        println!("  architecture: {}", arch);
                    }
                    if let Some(ctx) = meta.context_length {
                        println!("  context length: {}", ctx);
                    }
                }
                Err(e) => println!("  header unreadable: {:#}", e),
            }
        }
        Ok(())
    }

    async fn cmd_chat(
        service: &Arc<InferenceService>,
        path: &Path,
        load: &LoadConfig,
        generation: GenerationConfig,
        prompt: Option<String>,
    ) -> anyhow::Result<()> {
        let record = service.load_model(path, load).await?;
        eprintln!("Loaded {} ({}, template {})", record.id, record.engine, record.template_name);

        // Ctrl-C stops the running generation; with nothing running it exits.
        let current: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        {
            let service = service.clone();
            let current = current.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    let running = current.lock().ok().and_then(|mut c| c.take());
                    match running {
                        Some(id) => {
                            service.stop_generation(&id);
                        }
                        None => std::process::exit(130),
                    }
                }
            });
        }

        let store = InMemoryMemoryStore::new();
        let session = "cli";

        let mut turns: Vec<String> = Vec::new();
        let interactive = prompt.is_none();
        if let Some(prompt) = prompt {
            turns.push(prompt);
        }
        let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();

        loop {
            let message = match turns.pop() {
                Some(message) => message,
                None if interactive => {
                    eprint!("> ");
                    std::io::stderr().flush().ok();
                    match stdin.next_line().await.context("reading stdin")? {
                        Some(line) if line.trim().is_empty() => continue,
                        Some(line) => line,
                        None => break,
                    }
                }
                None => break,
            };

            let handle = service.begin_generation(&record.id);
            if let Ok(mut slot) = current.lock() {
                *slot = Some(handle.id.clone());
            }

            let request = GenerationRequest {
                config: generation.clone(),
                history: store.history(session),
                on_token: Some(Arc::new(|token: &str| {
                    print!("{}", token);
                    std::io::stdout().flush().ok();
                })),
                handle: Some(handle),
                model_path: None,
            };
            let outcome = service.generate(&record.id, &message, request).await;
            if let Ok(mut slot) = current.lock() {
                slot.take();
            }
            let outcome = outcome?;
            println!();

            if outcome.stopped || outcome.invalid {
                eprintln!("{}", outcome.text);
            }
            eprintln!(
                "[{} tokens, {:.1} tok/s]",
                outcome.tokens, outcome.timings.tokens_per_second
            );

            append_with_retry(&store, session, Message::user(message), 3, Duration::from_millis(50)).await?;
            append_with_retry(&store, session, Message::assistant(outcome.text), 3, Duration::from_millis(50)).await?;
        }

        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
