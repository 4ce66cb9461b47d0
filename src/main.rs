//! # Research Deck CLI (`deck`)
//!
//! ## Usage
//!
//! ```bash
//! deck --config ./config/deck.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `deck research "<topic>"` | Stream a research report |
//! | `deck outline <file>` | Turn a research report into a slide outline |
//! | `deck compile <file>` | Compile an outline into a deck |
//! | `deck run "<topic>"` | Research, outline and compile in one go |
//! | `deck exec <file>` | Run one R code file through the artifact pipeline |
//! | `deck templates list` | List deck templates |
//! | `deck templates sample <n>` | Pick random templates |
//! | `deck serve` | Start the HTTP server |
//!
//! When the config file does not exist, built-in defaults are used.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};

use research_deck::config::{self, Config};
use research_deck::logging;
use research_deck::models::{CodeKind, Outline, ResearchDocument};
use research_deck::pipeline::Pipeline;
use research_deck::server;
use research_deck::templates::{contrast_ratio, parse_hex_color, TemplateRegistry};

/// Research Deck: topic → research report → outline → slide deck.
#[derive(Parser)]
#[command(
    name = "deck",
    about = "Turn a research topic into a themed slide deck",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/deck.toml")]
    config: PathBuf,

    /// Show debug logs.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Only show errors.
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a research report on a topic.
    ///
    /// Text is printed as it arrives unless `--out` is given.
    Research {
        topic: String,

        /// Write the report to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Turn a research report into a slide outline.
    Outline {
        /// Research report (markdown). Use `-` for stdin.
        file: PathBuf,

        /// Topic the report covers (used in the prompt).
        #[arg(long, default_value = "")]
        topic: String,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Compile an outline into a deck.
    Compile {
        /// Outline file (markdown). Use `-` for stdin.
        file: PathBuf,

        /// Template name. Defaults to `[compile].default_template`.
        #[arg(long)]
        template: Option<String>,

        /// Emit deck markdown instead of rendering it.
        #[arg(long)]
        markdown: bool,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Research, outline and compile a topic in one go.
    Run {
        topic: String,

        #[arg(long)]
        template: Option<String>,

        /// Where to write the deck. Defaults to stdout.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Also save the research report and outline next to `--out`.
        #[arg(long, requires = "out")]
        keep_intermediate: bool,
    },

    /// Run an R code file and print its output.
    Exec {
        file: PathBuf,

        /// `plot`, `table` or `generic`. Inferred from the code when omitted.
        #[arg(long)]
        kind: Option<CodeKind>,
    },

    /// Template catalog.
    Templates {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List templates with their contrast ratio.
    List {
        /// Only templates with contrast ≥ 4.5.
        #[arg(long)]
        readable: bool,
    },
    /// Pick `count` random templates.
    Sample { count: usize },
}

fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

fn write_output(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn print_chunk(delta: &str) {
    print!("{}", delta);
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.quiet, cli.verbose)?;

    // Commands that don't talk to the LLM or runtime
    if let Commands::Templates { action } = &cli.command {
        let registry = TemplateRegistry::builtin();
        let templates: Vec<_> = match action {
            TemplateAction::List { readable: true } => registry.readable(),
            TemplateAction::List { readable: false } => registry.all().iter().collect(),
            TemplateAction::Sample { count } => registry.random_sample(*count),
        };
        for t in templates {
            let ratio = match (parse_hex_color(t.text_color), parse_hex_color(t.background_color)) {
                (Some(fg), Some(bg)) => contrast_ratio(fg, bg),
                _ => 0.0,
            };
            println!(
                "{:<12} theme={:<8} bg={} fg={} contrast={:.2}",
                t.name, t.theme, t.background_color, t.text_color, ratio
            );
        }
        return Ok(());
    }

    let cfg = load_or_default(&cli.config)?;

    match cli.command {
        Commands::Templates { .. } => {}
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Research { topic, out } => {
            let pipeline = Pipeline::from_config(&cfg)?;
            let document = if out.is_some() {
                pipeline.conduct_research(&topic, None).await?
            } else {
                let mut sink = print_chunk;
                let doc = pipeline.conduct_research(&topic, Some(&mut sink)).await?;
                println!();
                doc
            };
            if let Some(path) = out {
                write_output(Some(&path), &document.raw_text)?;
            }
        }
        Commands::Outline { file, topic, out } => {
            let pipeline = Pipeline::from_config(&cfg)?;
            let text = read_input(&file)?;
            let document = ResearchDocument::from_text(topic, text);
            let outline = pipeline.generate_outline(&document, None).await?;
            write_output(out.as_deref(), &outline.normalized_text)?;
        }
        Commands::Compile {
            file,
            template,
            markdown,
            out,
        } => {
            let pipeline = Pipeline::from_config(&cfg)?;
            let Some(template) = pipeline.resolve_template(template.as_deref()) else {
                bail!(
                    "Unknown template: {}. Run `deck templates list` to see available templates.",
                    template.as_deref().unwrap_or(cfg.compile.default_template.as_str())
                );
            };
            let text = read_input(&file)?;
            let outline = Outline::from_text(file.display().to_string(), &text);
            let deck = if markdown {
                pipeline.assemble_deck(&outline, template).await?
            } else {
                pipeline.compile_deck(&outline, template).await?
            };
            write_output(out.as_deref(), &deck)?;
        }
        Commands::Run {
            topic,
            template,
            out,
            keep_intermediate,
        } => {
            let pipeline = Pipeline::from_config(&cfg)?;
            let mut sink = |delta: &str| eprint!("{}", delta);
            let run = pipeline
                .run(&topic, template.as_deref(), Some(&mut sink))
                .await?;
            eprintln!();

            if keep_intermediate {
                if let Some(path) = &out {
                    std::fs::write(path.with_extension("research.md"), &run.document.raw_text)?;
                    std::fs::write(path.with_extension("outline.md"), &run.outline.normalized_text)?;
                }
            }
            write_output(out.as_deref(), &run.deck)?;
        }
        Commands::Exec { file, kind } => {
            let pipeline = Pipeline::from_config(&cfg)?;
            let code = read_input(&file)?;
            let kind = kind.unwrap_or_else(|| research_deck::compile::classify_kind("{r}", &code));
            let artifact = pipeline.execute(&code, kind).await?;
            eprintln!(
                "{} {} ({} bytes)",
                artifact.content_hash,
                artifact.mime_type.as_str(),
                artifact.size_bytes
            );
            println!("{}", artifact.payload_text());
        }
    }

    Ok(())
}
