//! imagi CLI - run, preview and encode imagiCharm scripts.
//!
//! This is the main binary entry point. See the `imagi` library for the
//! core functionality.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use imagi::commands::{self, script::TextArgs};
use imagi::env::Environment;
use imagi::preview::PreviewStyle;
use imagi::Config;
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Version of this binary.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "imagi")]
#[command(version = VERSION)]
#[command(about = "Run and encode imagiCharm LED matrix scripts")]
struct Cli {
    /// How matrices are drawn in the terminal
    #[arg(long, value_enum, global = true, default_value_t = Style::Color)]
    style: Style,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Style {
    Color,
    Ascii,
}

impl From<Style> for PreviewStyle {
    fn from(style: Style) -> Self {
        match style {
            Style::Color => Self::Color,
            Style::Ascii => Self::Ascii,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and show its final frame
    Run {
        /// Path to the Lua script
        file: String,
    },
    /// Run a script and play its animation in the terminal
    Play {
        /// Path to the Lua script
        file: String,
    },
    /// Run a script and print the packets sent to the accessory
    Packets {
        /// Path to the Lua script
        file: String,
        /// Use the indoor (9-level) brightness profile
        #[arg(long)]
        indoor: bool,
    },
    /// Print the scrolling-text packet for a message
    Text {
        /// Text to scroll (ASCII; other characters become '?')
        text: String,
        /// Text colour name
        #[arg(long, default_value = "white")]
        color: String,
        /// Background colour name
        #[arg(long, default_value = "black")]
        back: String,
        /// Milliseconds per scroll step
        #[arg(long)]
        duration: Option<u32>,
        /// Times to scroll; 0 repeats forever
        #[arg(long = "loop", default_value_t = 0)]
        loop_count: u32,
        /// Use the indoor (9-level) brightness profile
        #[arg(long)]
        indoor: bool,
    },
    /// Render documentation snippets through the snippet cache
    Docs {
        /// Markdown file containing `lua imagi-grid` / `lua imagi-anim` fences
        file: String,
        /// Cache file (defaults to the configured cache path)
        #[arg(long)]
        cache: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::current();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(environment.default_log_filter()),
    )
    .format_timestamp_secs()
    .init();
    log::debug!("imagi {VERSION} starting ({environment})");

    let cli = Cli::parse();
    let style = PreviewStyle::from(cli.style);

    match cli.command {
        Commands::Run { file } => commands::run(&file, style).await?,
        Commands::Play { file } => commands::play(&file, style).await?,
        Commands::Packets { file, indoor } => commands::packets(&file, indoor).await?,
        Commands::Text {
            text,
            color,
            back,
            duration,
            loop_count,
            indoor,
        } => {
            commands::text(TextArgs {
                text,
                color,
                back,
                duration_ms: duration,
                loop_count,
                indoor,
            })
            .await?;
        }
        Commands::Docs { file, cache } => commands::render_docs(&file, cache.as_deref()).await?,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
