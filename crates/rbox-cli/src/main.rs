//! Command-line front end for the rbox execution engine.
//!
//! Upload workspaces live only as long as the process, so `run` accepts files
//! to stage (or a directory to mount) alongside the code it executes. The
//! standalone `stage` command therefore always targets a mounted directory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use rbox_core::{
    config::ConfigLoader, Artifact, Engine, ExecutionResult, FileFilter, FileKind, ImageFormat,
    ImageParams, RboxConfig, SessionId,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "rbox - run untrusted R scripts in a sandbox")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "Configuration file (defaults plus RBOX_* variables when omitted)")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "Overrides logging.level from the configuration")]
    log_level: Option<String>,

    #[clap(long, default_value = "cli", help = "Session the workspace belongs to")]
    session: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute R code and print or save its result
    Run {
        #[clap(help = "R source; read from --file when omitted")]
        code: Option<String>,

        #[clap(long, short, conflicts_with = "code")]
        file: Option<PathBuf>,

        #[clap(long, short, default_value = "text", help = "text, png, jpeg, pdf or svg")]
        output: String,

        #[clap(long)]
        width: Option<u32>,

        #[clap(long)]
        height: Option<u32>,

        #[clap(long)]
        resolution: Option<u32>,

        #[clap(long, help = "Time budget in seconds")]
        timeout: Option<u64>,

        #[clap(long, help = "Where to write an image artifact")]
        out: Option<PathBuf>,

        #[clap(long = "stage", help = "Local file to stage into the workspace (repeatable)")]
        stage: Vec<PathBuf>,

        #[clap(long, help = "Host directory to use as the workspace")]
        mount: Option<PathBuf>,

        #[clap(long, help = "Replace staged files that already exist")]
        overwrite: bool,

        #[clap(long, help = "Print the result as JSON")]
        json: bool,
    },
    /// Copy local files into the writable area of a mounted directory
    Stage {
        #[clap(required = true)]
        files: Vec<PathBuf>,

        #[clap(long, help = "Host directory whose writable area receives the files")]
        mount: PathBuf,

        #[clap(long, help = "Replace files that already exist")]
        overwrite: bool,
    },
    /// Validate a host directory as a workspace and summarize it
    Mount { dir: PathBuf },
    /// List the files visible in a mounted directory
    Files {
        mount: PathBuf,

        #[clap(long, help = "excel, csv, text, json or other")]
        kind: Option<String>,

        #[clap(long, help = "Glob such as 'sales_*.csv'")]
        pattern: Option<String>,
    },
    /// Show metadata for one file of a mounted directory
    Info { mount: PathBuf, name: String },
    /// Install an R package into the shared library
    Install {
        name: String,

        #[clap(long, help = "'1.2.3', '==1.2.3' or '>=1.2'")]
        version: Option<String>,

        #[clap(long)]
        force: bool,

        #[clap(long, help = "Repository URL for this install instead of the configured one")]
        repo: Option<String>,
    },
    /// List installed R packages
    Packages {
        #[clap(help = "Case-insensitive regular expression")]
        pattern: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    match dispatch(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn load(config: Option<&Path>) -> Result<RboxConfig> {
    let config = match config {
        Some(path) => ConfigLoader::from_file(path).await?,
        None => ConfigLoader::from_env()?,
    };
    Ok(config)
}

async fn dispatch(cli: Cli, config: RboxConfig) -> Result<ExitCode> {
    if let Commands::Config = cli.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let engine = Engine::new(config).await?;
    let session = SessionId::new(cli.session);
    let result = handle(&engine, &session, cli.command).await;
    engine.shutdown().await;
    result
}

async fn handle(engine: &Engine, session: &SessionId, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            code,
            file,
            output,
            width,
            height,
            resolution,
            timeout,
            out,
            stage,
            mount,
            overwrite,
            json,
        } => {
            if let Some(dir) = mount {
                let info = engine.mount(session, &absolute(&dir)?).await?;
                log::info!(
                    "Mounted {} ({} entries)",
                    info.root.display(),
                    info.total_entries
                );
            }
            for path in stage {
                stage_file(engine, session, &path, overwrite).await?;
            }

            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("give R code as an argument or with --file"),
            };
            let budget = timeout.map(Duration::from_secs);

            let request = if output.eq_ignore_ascii_case("text") {
                engine.text_request(session, &code, budget)?
            } else {
                let format: ImageFormat = output.parse()?;
                let defaults = &engine.config().rendering;
                let params = ImageParams::new(
                    format,
                    width.unwrap_or(defaults.width),
                    height.unwrap_or(defaults.height),
                    resolution.unwrap_or(defaults.resolution),
                )?;
                engine.image_request(session, &code, Some(params), budget)?
            };

            let result = engine.execute(&request).await;
            report(result, out.as_deref(), json).await
        }
        Commands::Stage {
            files,
            mount,
            overwrite,
        } => {
            engine.mount(session, &absolute(&mount)?).await?;
            for path in files {
                stage_file(engine, session, &path, overwrite).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Mount { dir } => {
            let info = engine.mount(session, &absolute(&dir)?).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Files {
            mount,
            kind,
            pattern,
        } => {
            engine.mount(session, &absolute(&mount)?).await?;
            let filter = FileFilter {
                kind: kind
                    .map(|k| k.parse::<FileKind>())
                    .transpose()
                    .map_err(anyhow::Error::msg)?,
                pattern,
            };
            for entry in engine.list_files(session, &filter).await? {
                println!("{:>10}  {}", entry.size, entry.name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info { mount, name } => {
            engine.mount(session, &absolute(&mount)?).await?;
            let info = engine.file_info(session, &name).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Install {
            name,
            version,
            force,
            repo,
        } => {
            let descriptor = engine
                .ensure_package(&name, version.as_deref(), force, repo.as_deref())
                .await?;
            println!("{} {}", descriptor.name, descriptor.version);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Packages { pattern } => {
            let listing = engine.list_packages(pattern.as_deref()).await?;
            for package in listing.iter() {
                println!(
                    "{}\t{}\t{}",
                    package.name,
                    package.version,
                    package.title.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => Ok(ExitCode::SUCCESS),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

async fn stage_file(
    engine: &Engine,
    session: &SessionId,
    path: &Path,
    overwrite: bool,
) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let staged = engine.stage(session, name, &content, None, overwrite).await?;
    log::info!("Staged {} as {}", path.display(), staged.display());
    Ok(())
}

async fn report(result: ExecutionResult, out: Option<&Path>, json: bool) -> Result<ExitCode> {
    if let (ExecutionResult::Success(Artifact::Image { format, bytes, .. }), Some(path)) =
        (&result, out)
    {
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        log::info!("Wrote {} bytes of {} to {}", bytes.len(), format, path.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(exit_code(&result));
    }

    match &result {
        ExecutionResult::Success(Artifact::Text { output }) => print!("{}", output),
        ExecutionResult::Success(Artifact::Image {
            format,
            width,
            height,
            bytes,
            ..
        }) => {
            if out.is_none() {
                log::warn!("Image produced but no --out path given; discarding it");
            }
            println!("{} {}x{} ({} bytes)", format, width, height, bytes.len());
        }
        ExecutionResult::Failure(failure) => {
            eprintln!("{}: {}", failure.kind, failure.message);
            if let Some(partial) = failure.partial_output.as_deref().filter(|p| !p.is_empty()) {
                eprintln!("--- output ---\n{}", partial);
            }
        }
    }
    Ok(exit_code(&result))
}

fn exit_code(result: &ExecutionResult) -> ExitCode {
    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
