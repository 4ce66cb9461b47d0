//! # Research Deck
//!
//! Turn a research topic into a slide deck.
//!
//! A topic goes to an LLM, which streams back a research report. The report
//! is restructured into a slide outline under a fixed grammar, R code blocks
//! in the outline are executed and replaced by their plots and tables, and
//! the result is styled with a template and rendered into slides.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │  topic  │──▶│ research  │──▶│ outline  │──▶│  compile  │──▶│  render  │
//! └─────────┘   │ (LLM SSE) │   │ (LLM +   │   │ (R blocks │   │ (marp /  │
//!               └───────────┘   │ normalize)│  │ + theme)  │   │ passthru)│
//!                               └──────────┘   └─────┬─────┘   └──────────┘
//!                                                    │
//!                                          ┌─────────▼─────────┐
//!                                          │ gateway → cache   │
//!                                          │        → Rscript  │
//!                                          └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! deck research "grid-scale batteries" --out report.md
//! deck outline report.md --out outline.md
//! deck compile outline.md --template midnight --out deck.html
//! deck run "grid-scale batteries" --template midnight --out deck.html
//! deck serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed errors for each pipeline stage |
//! | [`models`] | Core data types |
//! | [`llm`] | Streaming chat-completions client |
//! | [`research`] | Research prompt and report accumulation |
//! | [`markdown`] | Line classification shared by the text passes |
//! | [`outline`] | Outline prompt and normalization |
//! | [`cache`] | Size-bounded content-addressed artifact cache |
//! | [`runtime`] | `Rscript` invocation |
//! | [`gateway`] | Cache-first code execution |
//! | [`compile`] | Code substitution, slide breaks, directives |
//! | [`render`] | Slide renderers |
//! | [`templates`] | Template catalog and contrast filtering |
//! | [`pipeline`] | Service facade used by the CLI and server |
//! | [`server`] | HTTP API |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache;
pub mod compile;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod markdown;
pub mod models;
pub mod outline;
pub mod pipeline;
pub mod render;
pub mod research;
pub mod runtime;
pub mod server;
pub mod templates;
