mod cmd;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "w3tcm", version, about = "W3TC minify helper - keeps combined JavaScript in emission order")]
struct Cli {
    /// Site root holding w3tcm.json (defaults to the current directory)
    #[arg(long, global = true)]
    site: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded host event traces, one request per file
    Replay {
        traces: Vec<PathBuf>,
        /// Keep the store and output directory untouched
        #[arg(long)]
        dry_run: bool,
    },
    /// Guess whether JavaScript files are already minified
    Classify { files: Vec<PathBuf> },
    /// Print a JavaScript file with comments, strings and regex literals removed
    Sanitize { file: PathBuf },
    /// Show the mode, stored templates and notices
    Status,
    /// Clear the store and the generated configuration document
    Reset,
    /// Toggle auto minify mode
    ToggleAuto,
    /// Trace one extension point
    MonitorFilter {
        filter: String,
        #[arg(long)]
        off: bool,
    },
    /// Stop tracing all extension points
    ClearMonitor,
    /// Answer an order warning for a template
    SkipTemplate {
        #[arg(long)]
        theme: String,
        #[arg(long)]
        template: String,
        #[arg(long)]
        notice_id: String,
        /// Mark the template safe to minify instead of skipping it
        #[arg(long)]
        minify: bool,
    },
    /// Replace a failed combined-file response
    Recover {
        #[arg(long)]
        status: u16,
        #[arg(long)]
        uri: String,
        #[arg(long)]
        ext: Option<String>,
        sources: Vec<PathBuf>,
    },
    /// Delete extracted inline scripts
    Purge,
    /// Serve the diagnostic dump pages
    Serve {
        #[arg(long, default_value_t = 3100)]
        port: u16,
    },
}

pub async fn run() {
    let cli = Cli::parse();

    let result = match cmd::load_site(cli.site.as_deref()) {
        Ok(site) => match cli.command {
            Commands::Replay { traces, dry_run } => cmd::replay::run(&site, &traces, dry_run),
            Commands::Classify { files } => cmd::analyze::classify(&site, &files),
            Commands::Sanitize { file } => cmd::analyze::sanitize(&file),
            Commands::Status => cmd::admin::status(&site),
            Commands::Reset => cmd::admin::reset(&site),
            Commands::ToggleAuto => cmd::admin::toggle_auto(site),
            Commands::MonitorFilter { filter, off } => cmd::admin::monitor_filter(site, &filter, !off),
            Commands::ClearMonitor => cmd::admin::clear_monitor(site),
            Commands::SkipTemplate {
                theme,
                template,
                notice_id,
                minify,
            } => cmd::admin::skip_template(&site, &theme, &template, &notice_id, !minify),
            Commands::Recover {
                status,
                uri,
                ext,
                sources,
            } => cmd::recover::run(&site, status, uri, ext, &sources),
            Commands::Purge => cmd::admin::purge(&site),
            Commands::Serve { port } => w3tcm_diag::start(site, port).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
