use std::{fmt::Debug, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use image::ImageFormat;
use log::{debug, info};

use facegen::{
    GenerationService, GenerationServiceBuilder, Settings, WeightSource, WeightStore,
    api::{self, AppState},
    config::DevicePreference,
    device::select_device,
    enhancer::RealEsrganUpsampler,
    generator::StyleGan2Generator,
};

#[derive(Parser)]
#[command(name = "facegen")]
#[command(about = "StyleGAN2 face generator with a small web API")]
#[command(version)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, global = true, env = "FACEGEN_CONFIG")]
    config: Option<PathBuf>,
    /// Directory downloaded weights are stored in
    #[arg(long, global = true, env = "FACEGEN_WEIGHTS_DIR")]
    weights_dir: Option<PathBuf>,
    /// Device to run the networks on
    #[arg(long, global = true, env = "FACEGEN_DEVICE", value_enum)]
    device: Option<DevicePreference>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        #[arg(long, env = "FACEGEN_HOST")]
        host: Option<String>,
        #[arg(short, long, env = "FACEGEN_PORT")]
        port: Option<u16>,
        /// Directory served under /static
        #[arg(long, env = "FACEGEN_STATIC_DIR")]
        static_dir: Option<PathBuf>,
        /// Don't load the enhancer weights
        #[arg(long)]
        no_enhancer: bool,
    },
    /// Generate a single face into a file
    Generate {
        /// Seed, random when omitted
        #[arg(short, long)]
        seed: Option<u32>,
        #[arg(short, long)]
        truncation: Option<f32>,
        #[arg(long)]
        no_enhance: bool,
        /// Output PNG file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render a style-mixing grid into a file
    StyleMix {
        /// Comma separated row seeds
        #[arg(long, value_delimiter = ',', required = true)]
        rows: Vec<u32>,
        /// Comma separated column seeds
        #[arg(long, value_delimiter = ',', required = true)]
        cols: Vec<u32>,
        /// Style layers taken from the column seeds
        #[arg(long, value_delimiter = ',')]
        styles: Option<Vec<usize>>,
        #[arg(short, long)]
        truncation: Option<f32>,
        #[arg(long)]
        no_enhance: bool,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Weight file operations
    Weights {
        #[command(subcommand)]
        action: WeightsCommands,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum WeightsCommands {
    /// List fetched weights
    List,
    /// Fetch weights from a path, URL or hf://owner/repo/file
    Fetch {
        /// Weight source, defaults to every configured source
        source: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the default configuration file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            static_dir,
            no_enhancer,
        } => {
            let mut settings = settings;
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            if let Some(static_dir) = static_dir {
                settings.static_dir = static_dir;
            }
            if no_enhancer {
                settings.enhancer.enabled = false;
            }
            handle_serve(settings).await
        }
        Commands::Generate {
            seed,
            truncation,
            no_enhance,
            output,
        } => handle_generate(&settings, seed, truncation, !no_enhance, &output).await,
        Commands::StyleMix {
            rows,
            cols,
            styles,
            truncation,
            no_enhance,
            output,
        } => handle_style_mix(&settings, rows, cols, styles, truncation, !no_enhance, &output).await,
        Commands::Weights { action } => handle_weights_command(&settings, action).await,
        Commands::Config { action } => handle_config_command(&cli.config, &settings, action),
    }
    .log_error()
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match (&cli.command, &cli.config) {
        // `config init` may target a file that doesn't exist yet
        (Commands::Config { .. }, Some(path)) if !path.exists() => Settings::default(),
        _ => Settings::load(cli.config.as_deref())?,
    };
    if let Some(dir) = &cli.weights_dir {
        settings.weights_dir = Some(dir.clone());
    }
    if let Some(device) = cli.device {
        settings.device = device;
    }
    Ok(settings)
}

/// Loads the networks and wires them into a service writing to `output_dir`.
async fn load_service(
    settings: &Settings,
    enhance: bool,
    output_dir: PathBuf,
) -> Result<GenerationService> {
    let store = WeightStore::new(settings.weights_dir.clone())?;
    let device = select_device(settings.device)?;

    let source: WeightSource = settings.generator_weights.parse()?;
    let path = store.resolve(&source).await?;
    info!("Loading generator from {}", path.display());
    let generator = StyleGan2Generator::load(&path, &settings.stylegan2, &device)
        .with_context(|| format!("Failed to load generator {}", path.display()))?;

    let mut builder = GenerationServiceBuilder::new(Arc::new(generator))
        .with_output_dir(output_dir)
        .with_default_truncation(settings.default_truncation)
        .with_inference_permits(settings.inference_permits);

    if enhance && settings.enhancer.enabled {
        let source: WeightSource = settings.enhancer.weights.parse()?;
        let path = store.resolve(&source).await?;
        info!("Loading enhancer from {}", path.display());
        let upsampler = RealEsrganUpsampler::load(&path, &device)
            .with_context(|| format!("Failed to load enhancer {}", path.display()))?
            .with_tiling(settings.enhancer.tile, settings.enhancer.tile_pad)
            .with_outscale(settings.enhancer.outscale)?;
        builder = builder.with_enhancer(Arc::new(upsampler));
    }
    builder.build()
}

async fn handle_serve(settings: Settings) -> Result<()> {
    settings.validate()?;
    info!("Starting {}", settings.app_name);
    let service = load_service(&settings, true, settings.output_dir()).await?;
    let state = Arc::new(AppState {
        service: Arc::new(service),
        settings,
    });
    api::serve(state).await
}

fn save_png(image: &image::RgbImage, output: &std::path::Path) -> Result<()> {
    image
        .save_with_format(output, ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", output.display()))
}

fn check_truncation(truncation: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&truncation) {
        return Err(anyhow!("truncation must be between 0 and 1, got {truncation}"));
    }
    Ok(truncation)
}

async fn handle_generate(
    settings: &Settings,
    seed: Option<u32>,
    truncation: Option<f32>,
    enhance: bool,
    output: &std::path::Path,
) -> Result<()> {
    let truncation = check_truncation(truncation.unwrap_or(settings.default_truncation))?;
    let scratch = tempfile::tempdir().context("Failed to create scratch dir")?;
    let service = load_service(settings, enhance, scratch.path().to_path_buf()).await?;
    let result = service
        .generate_single_image(seed, truncation, enhance, false)
        .await?;
    save_png(&result.image, output)?;
    println!(
        "Seed {} ({:?}) written to {}",
        result.seed,
        result.enhancement,
        output.display()
    );
    Ok(())
}

async fn handle_style_mix(
    settings: &Settings,
    rows: Vec<u32>,
    cols: Vec<u32>,
    styles: Option<Vec<usize>>,
    truncation: Option<f32>,
    enhance: bool,
    output: &std::path::Path,
) -> Result<()> {
    let truncation = check_truncation(truncation.unwrap_or(settings.default_truncation))?;
    if rows.len() * cols.len() > settings.max_grid_tiles {
        return Err(anyhow!(
            "grid of {} tiles exceeds the limit of {}",
            rows.len() * cols.len(),
            settings.max_grid_tiles
        ));
    }
    let scratch = tempfile::tempdir().context("Failed to create scratch dir")?;
    let service = load_service(settings, enhance, scratch.path().to_path_buf()).await?;
    let result = service
        .generate_grid_image(rows, cols, styles, truncation, enhance, false)
        .await?;
    save_png(&result.image, output)?;
    println!("{} grid written to {}", result.grid_size, output.display());
    Ok(())
}

async fn handle_weights_command(settings: &Settings, action: WeightsCommands) -> Result<()> {
    let store = WeightStore::new(settings.weights_dir.clone())?;
    match action {
        WeightsCommands::List => {
            let weights = store.list_weights().context("Failed to list weights")?;

            if weights.is_empty() {
                println!("No weights fetched.");
                return Ok(());
            }

            for file in weights {
                println!(
                    "{} ({})",
                    file.name,
                    humansize::format_size(file.size, humansize::DECIMAL)
                );
                println!("  source: {}", file.source);
                println!("  path:   {}", file.path.display());
            }
        }
        WeightsCommands::Fetch { source } => {
            let sources = match source {
                Some(source) => vec![source],
                None => vec![
                    settings.generator_weights.clone(),
                    settings.enhancer.weights.clone(),
                ],
            };
            for source in sources {
                let source: WeightSource = source.parse()?;
                let path = store.resolve(&source).await?;
                debug!("Resolved {source} to {}", path.display());
                println!("{source} -> {}", path.display());
            }
        }
    }
    Ok(())
}

fn handle_config_command(
    config: &Option<PathBuf>,
    settings: &Settings,
    action: ConfigCommands,
) -> Result<()> {
    let path = config
        .clone()
        .or_else(Settings::default_path)
        .context("Couldn't determine a configuration path")?;
    match action {
        ConfigCommands::Show => {
            let json =
                serde_json::to_string_pretty(settings).context("Couldn't serialize settings")?;
            println!("{json}");
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                return Err(anyhow!(
                    "{} already exists, pass --force to overwrite",
                    path.display()
                ));
            }
            Settings::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

trait LogError<T> {
    fn log_error(self) -> Self;
}

impl<T, E: Debug> LogError<T> for Result<T, E> {
    fn log_error(self) -> Self {
        self.inspect_err(|e| debug!("{:?}", e))
    }
}
