use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gridnode::config::Config;
use gridnode::identity::{new_ca, FullCertificateAuthority, NewCaOptions};
use gridnode::peertls::Error;
use gridnode::pki::{generate_keys, CancelToken};

/// Development config file path
fn default_config_path() -> PathBuf {
    PathBuf::from("gridnode.toml")
}

#[derive(Parser)]
#[command(name = "gridnode")]
#[command(about = "Decentralized storage network node identity tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a proof-of-work certificate authority
    GenCa,

    /// Generate a leaf identity under the saved certificate authority
    GenIdentity,

    /// Continuously generate keys, writing every candidate to disk
    BatchGenerate {
        /// Minimum difficulty to output (overrides config)
        #[arg(long)]
        min_difficulty: Option<u16>,

        /// Worker concurrency (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Output directory (overrides config)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Print the node ID of a PEM certificate chain
    NodeId {
        /// Certificate chain file
        cert: PathBuf,

        /// Read the file as a CA chain ([ca, parents...]) instead of an
        /// identity chain ([leaf, ca, parents...])
        #[arg(long)]
        ca: bool,
    },
}

fn load_config(cli_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = cli_path {
        return Config::from_file(path);
    }
    let default = default_config_path();
    if default.exists() {
        Config::from_file(default)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = load_config(cli.config)?;
    config.validate()?;

    match cli.command {
        Commands::GenCa => gen_ca(&config).await?,
        Commands::GenIdentity => gen_identity(&config)?,
        Commands::BatchGenerate {
            min_difficulty,
            concurrency,
            output_dir,
        } => batch_generate(&config, min_difficulty, concurrency, output_dir).await?,
        Commands::NodeId { cert, ca } => node_id(&cert, ca)?,
    }

    Ok(())
}

/// Cancels the token when the process receives Ctrl-C.
fn cancel_on_ctrl_c(cancel: &CancelToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            cancel.cancel();
        }
    });
}

fn refuse_overwrite(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "{} already exists; set overwrite = true in the config to replace it",
            path.display()
        );
    }
    Ok(())
}

async fn gen_ca(config: &Config) -> Result<()> {
    let ca_config = &config.ca;
    refuse_overwrite(&ca_config.cert_path, ca_config.overwrite)?;
    refuse_overwrite(&ca_config.key_path, ca_config.overwrite)?;
    config.ensure_directories()?;

    let parent = match (&ca_config.parent_cert_path, &ca_config.parent_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let parent = FullCertificateAuthority::load(cert_path, key_path)
                .context("Failed to load parent certificate authority")?;
            info!(parent_id = %parent.id, "nesting under parent authority");
            Some((parent.cert, parent.key))
        }
        _ => None,
    };

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);
    if ca_config.timeout_secs > 0 {
        let timer = cancel.clone();
        let timeout = Duration::from_secs(ca_config.timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("CA generation timed out");
            timer.cancel();
        });
    }

    let opts = NewCaOptions {
        difficulty: ca_config.difficulty,
        concurrency: ca_config.concurrency,
        parent,
    };
    let worker_cancel = cancel.clone();
    let ca = tokio::task::spawn_blocking(move || new_ca(&worker_cancel, opts))
        .await
        .context("CA generation task panicked")??;

    ca.save(&ca_config.cert_path, &ca_config.key_path)?;
    info!(
        node_id = %ca.id,
        difficulty = ca.id.difficulty(),
        cert = %ca_config.cert_path.display(),
        "certificate authority written"
    );
    Ok(())
}

fn gen_identity(config: &Config) -> Result<()> {
    let identity_config = &config.identity;
    refuse_overwrite(&identity_config.cert_path, identity_config.overwrite)?;
    refuse_overwrite(&identity_config.key_path, identity_config.overwrite)?;
    config.ensure_directories()?;

    let ca = FullCertificateAuthority::load(&config.ca.cert_path, &config.ca.key_path)
        .context("Failed to load certificate authority; run 'gridnode gen-ca' first")?;
    let identity = ca.new_identity()?;
    identity.save(&identity_config.cert_path, &identity_config.key_path)?;

    info!(
        node_id = %identity.id,
        cert = %identity_config.cert_path.display(),
        "identity written"
    );
    Ok(())
}

async fn batch_generate(
    config: &Config,
    min_difficulty: Option<u16>,
    concurrency: Option<usize>,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let min_difficulty = min_difficulty.unwrap_or(config.batch_generate.min_difficulty);
    let concurrency = concurrency.unwrap_or(config.batch_generate.concurrency);
    let output_dir = output_dir.unwrap_or_else(|| config.batch_generate.output_dir.clone());
    std::fs::create_dir_all(&output_dir).context("Failed to create output directory")?;

    info!(
        min_difficulty,
        concurrency,
        output_dir = %output_dir.display(),
        "generating keys until interrupted"
    );

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let result = tokio::task::spawn_blocking(move || {
        let counter = AtomicU32::new(0);
        generate_keys(&cancel, min_difficulty, concurrency, |key, id| {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            let filename = format!("gen-{:02}-{}.key", id.difficulty(), n);
            info!(node_id = %id, %filename, "writing key");
            std::fs::write(output_dir.join(&filename), key.pkcs8_der())?;
            Ok(false)
        })
    })
    .await
    .context("key generation task panicked")?;

    match result {
        Ok(()) | Err(Error::Cancelled) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn node_id(cert_path: &Path, ca: bool) -> Result<()> {
    let pem = std::fs::read(cert_path).context("Failed to read certificate file")?;

    // Identity files carry [leaf, ca, ...]; CA files carry [ca, ...]. The
    // two shapes collide on length, so the caller has to say which one
    // this is.
    let id = if ca {
        gridnode::identity::ca_node_id_from_pem(&pem)?
    } else {
        gridnode::identity::node_id_from_pem(&pem)
            .context("not an identity chain; pass --ca for a CA chain file")?
    };

    println!("{}", id);
    info!(difficulty = id.difficulty(), "node ID difficulty");
    Ok(())
}
