use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use eyre::{WrapErr, bail};
use tracing::{Level, info};
use unitopt::cache::cold::read_entries;
use unitopt::context::CACHE_DIR;
use unitopt::governor::{read_state, request_recovery};
use unitopt::{LoaderContext, PipelineConfig, PipelineContext};

#[derive(Parser)]
#[command(name = "unitopt", version, about = "Binary unit optimizer and cache")]
pub struct Cli {
    #[command(flatten)]
    pub options: Options,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug)]
pub struct Options {
    #[arg(
        long = "datadir",
        value_name = "DATA_DIRECTORY",
        env = "UNITOPT_DATADIR",
        help = "Directory holding the cache, governor state and crash reports.",
        long_help = "Overrides `data_dir` from the config file when both are given."
    )]
    pub datadir: Option<PathBuf>,

    #[arg(
        long = "config",
        value_name = "CONFIG_FILE",
        env = "UNITOPT_CONFIG",
        help = "TOML pipeline configuration."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "UNITOPT_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error"
    )]
    pub log_level: Level,
}

impl Options {
    fn pipeline_config(&self) -> eyre::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .wrap_err_with(|| format!("loading {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(datadir) = &self.datadir {
            config.data_dir = datadir.clone();
        }
        Ok(config)
    }

    fn data_dir(&self) -> eyre::Result<PathBuf> {
        Ok(self.pipeline_config()?.data_dir)
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run unit files through the pipeline
    Optimize {
        /// Unit files; each file stem is used as the unit key
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write optimized units here (default: report sizes only)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List entries in the on-disk cache
    Inspect,

    /// Print the persisted optimizer state
    State,

    /// Ask the next start to clear failure records and leave DISABLED
    Reset,

    /// Report that a unit changed and purge everything that relied on it
    Invalidate {
        /// Unit key that changed
        unit: String,
    },
}

impl Command {
    pub fn run(self, opts: &Options) -> eyre::Result<()> {
        match self {
            Command::Optimize { files, output } => optimize(opts, &files, output.as_deref()),
            Command::Inspect => {
                let entries = read_entries(&opts.data_dir()?.join(CACHE_DIR))?;
                if entries.is_empty() {
                    println!("cache is empty");
                }
                for entry in entries {
                    println!(
                        "{:<40} {:>8} bytes  source {}  pass-set v{}  analyzer v{}  {}",
                        entry.unit_key,
                        entry.optimized_size,
                        hex::encode(entry.source_hash.get(..6).unwrap_or(&entry.source_hash)),
                        entry.pass_set_version,
                        entry.analyzer_version,
                        entry.artifact,
                    );
                }
                Ok(())
            }
            Command::State => {
                match read_state(&opts.data_dir()?)? {
                    Some(state) => println!("{state}"),
                    None => println!("no persisted state"),
                }
                Ok(())
            }
            Command::Reset => {
                let data_dir = opts.data_dir()?;
                request_recovery(&data_dir)
                    .wrap_err_with(|| format!("writing recovery marker in {}", data_dir.display()))?;
                println!("recovery requested; takes effect on next start");
                Ok(())
            }
            Command::Invalidate { unit } => {
                let context = PipelineContext::open(opts.pipeline_config()?)?;
                let purged = context.invalidate_changed(&unit);
                context.shutdown()?;
                if purged.is_empty() {
                    println!("no units depended on {unit}");
                }
                for dependent in purged {
                    println!("{dependent}");
                }
                Ok(())
            }
        }
    }
}

fn optimize(opts: &Options, files: &[PathBuf], output: Option<&Path>) -> eyre::Result<()> {
    let context = PipelineContext::open(opts.pipeline_config()?)?;
    if let Some(dir) = output {
        fs::create_dir_all(dir).wrap_err_with(|| format!("creating {}", dir.display()))?;
    }
    let loader = LoaderContext::new();

    for path in files {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            bail!("{} has no usable file name", path.display());
        };
        let raw = Bytes::from(fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?);
        let before = raw.len();
        let optimized = context.transform(stem, raw, &loader);
        println!("{stem}: {before} -> {} bytes", optimized.len());
        if let Some(dir) = output
            && let Some(name) = path.file_name()
        {
            fs::write(dir.join(name), &optimized)?;
        }
    }

    let metrics = context.metrics();
    info!(
        transforms = metrics.transforms,
        passthroughs = metrics.passthroughs,
        cache_hits = metrics.l1_hits + metrics.l2_hits + metrics.l3_hits,
        state = %context.state(),
        "Done"
    );
    context.shutdown()?;
    Ok(())
}
