use clap::{Parser, Subcommand};
use preview_sandbox::dependencies::detect;
use preview_sandbox::document::error_document;
use preview_sandbox::policy::build_policy;
use preview_sandbox::sanitizer::sanitize_with_report;
use preview_sandbox::{server, EngineConfig, PreviewEngine, SourceBundle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Preview Sandbox - isolated previews for generated front-end code
#[derive(Parser)]
#[command(name = "preview-sandbox")]
#[command(version = "0.1.0")]
#[command(about = "Sandboxed preview engine for generated front-end code", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a preview document from a file or directory
    Preview {
        /// Source file or bundle directory
        path: PathBuf,
        /// Write the assembled HTML here instead of printing the result
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List the catalog dependencies a bundle would load
    Detect { path: PathBuf },
    /// Print the sanitized entry source
    Sanitize { path: PathBuf },
    /// Print the content-security policy for a bundle
    Policy { path: PathBuf },
    /// Serve the control API and the preview origin
    Serve {
        /// Optional bundle to preview on startup
        path: Option<PathBuf>,
        #[command(flatten)]
        origins: ServeOrigins,
    },
}

/// Listener ports and public origins. Unset values come from the config file.
#[derive(clap::Args, Debug, Default)]
struct ServeOrigins {
    /// Control API port
    #[arg(short, long)]
    port: Option<u16>,
    /// Public control origin if it differs from the bound address
    #[arg(long)]
    base_url: Option<String>,
    /// Preview origin port
    #[arg(long)]
    preview_port: Option<u16>,
    /// Public preview origin if it differs from the bound address
    #[arg(long)]
    preview_url: Option<String>,
}

impl ServeOrigins {
    /// Apply the flags over `config`. A bare port only rewrites an origin the
    /// user did not configure; an explicit URL always wins.
    fn apply(&self, mut config: EngineConfig, configured: bool) -> EngineConfig {
        match (&self.base_url, self.port) {
            (Some(url), _) => config = config.with_base_url(url.clone()),
            (None, Some(port)) if !configured => {
                config = config.with_base_url(format!("http://127.0.0.1:{}", port))
            }
            _ => {}
        }
        match (&self.preview_url, self.preview_port) {
            (Some(url), _) => config = config.with_preview_url(url.clone()),
            (None, Some(port)) if !configured => {
                config = config.with_preview_url(format!("http://127.0.0.1:{}", port))
            }
            _ => {}
        }
        config
    }

    /// Ports to bind: the explicit flag, else the port of the configured origin.
    fn bind_ports(&self, config: &EngineConfig) -> Result<(u16, u16), Box<dyn std::error::Error>> {
        let control = match self.port {
            Some(port) => port,
            None => config.base_url()?.port_or_known_default().ok_or("control origin has no port")?,
        };
        let preview = match self.preview_port {
            Some(port) => port,
            None => config
                .preview_url()?
                .port_or_known_default()
                .ok_or("preview origin has no port")?,
        };
        Ok((control, preview))
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Preview { path, out } => run_preview(config, &path, out.as_deref()),
        Commands::Detect { path } => show_dependencies(&path),
        Commands::Sanitize { path } => show_sanitized(&path),
        Commands::Policy { path } => show_policy(&path),
        Commands::Serve { path, origins } => {
            run_server(config, cli.config.is_some(), path.as_deref(), &origins)
        }
    };

    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Detection runs over the entry, the only file a preview embeds.
fn entry_text(bundle: &SourceBundle) -> Result<&str, Box<dyn std::error::Error>> {
    let entry = bundle.entry().ok_or("bundle has no script entry")?;
    Ok(&entry.content)
}

fn run_preview(
    config: EngineConfig,
    path: &Path,
    out: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = SourceBundle::load(path)?;
    info!("Loaded {} file(s) from {}", bundle.len(), path.display());

    let engine = PreviewEngine::with_config(config)?;
    let result = engine.generate_preview(&bundle);

    let Some(out) = out else {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    };

    let html = if result.is_ready() {
        let handle = result.url.rsplit('/').next().unwrap_or_default();
        engine
            .document(handle)
            .map(|doc| doc.html.to_string())
            .ok_or("hosted document disappeared")?
    } else {
        error_document(result.error.as_deref().unwrap_or("Preview failed"), None)
    };
    std::fs::write(out, html)?;

    println!("\n{}", "=".repeat(60));
    println!("Status: {:?}", result.status);
    if let Some(id) = &result.sandbox_id {
        println!("Sandbox: {}", id);
    }
    println!("Sandbox attribute: {}", result.sandbox_attribute);
    println!("Dependencies: {}", result.dependencies.join(", "));
    if !result.omitted_files.is_empty() {
        println!("Not embedded: {}", result.omitted_files.join(", "));
    }
    if let Some(error) = &result.error {
        println!("Error: {}", error);
    }
    println!("Written to: {}", out.display());
    println!("{}", "=".repeat(60));

    Ok(())
}

fn show_dependencies(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = SourceBundle::load(path)?;
    let dependencies = detect(entry_text(&bundle)?);

    println!("\n{}", "=".repeat(60));
    println!("Detected Dependencies");
    println!("{}", "=".repeat(60));

    if dependencies.is_empty() {
        println!("No catalog dependencies detected.");
    }
    for dependency in &dependencies {
        println!("\n{}@{} ({:?})", dependency.name, dependency.version, dependency.asset_type);
        for url in dependency.urls() {
            println!("  {}", url);
        }
    }

    println!("\n{}", "=".repeat(60));
    Ok(())
}

fn show_sanitized(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = SourceBundle::load(path)?;
    let report = sanitize_with_report(entry_text(&bundle)?);

    for finding in &report.findings {
        eprintln!("blocked {} x{}", finding.rule, finding.count);
    }
    println!("{}", report.text);
    Ok(())
}

fn show_policy(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = SourceBundle::load(path)?;
    let policy = build_policy(&detect(entry_text(&bundle)?));
    println!("{}", policy.render());
    Ok(())
}

fn run_server(
    config: EngineConfig,
    configured: bool,
    path: Option<&Path>,
    origins: &ServeOrigins,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = origins.apply(config, configured);
    let (control_port, preview_port) = origins.bind_ports(&config)?;
    let engine = PreviewEngine::with_config(config)?;

    if let Some(path) = path {
        let result = engine.generate_preview(&SourceBundle::load(path)?);
        match (&result.sandbox_id, &result.error) {
            (Some(id), _) => info!("Preview {} available at {}", id, result.url),
            (None, Some(error)) => error!("Initial preview failed: {}", error),
            (None, None) => {}
        }
    }

    let control_addr = SocketAddr::from(([127, 0, 0, 1], control_port));
    let preview_addr = SocketAddr::from(([127, 0, 0, 1], preview_port));
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::serve(engine, control_addr, preview_addr))?;
    Ok(())
}
