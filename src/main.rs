use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use shoes_provider::config::{AwsConfig, LxdConfig, OpenStackConfig};
use shoes_provider::providers::{AwsShoes, LxdShoes, OpenStackShoes};
use shoes_provider::{plugin, ShoesProvider};

#[derive(Parser)]
#[command(name = "shoes-provider")]
#[command(
    about = "CI-runner instance provisioning plugin for myshoes",
    long_about = "shoes-provider provisions and removes ephemeral compute instances that\nserve as self-hosted CI-runner workers.\n\nBackends:\n  - aws        EC2 instances in one account/region\n  - lxd        one or many LXD hosts\n  - openstack  Nova servers in one project\n\nThe process is meant to be launched by the orchestrator: it performs the\nplugin handshake on stdout and then serves the create/delete contract.\nAll backend settings are read from the environment once at startup."
)]
#[command(version)]
struct Cli {
    /// Which compute substrate to serve
    #[arg(long, env = "SHOES_BACKEND", value_enum)]
    backend: Backend,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Aws,
    Lxd,
    Openstack,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr: stdout belongs to the handshake line
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Configuration is snapshotted here, before any RPC surface exists;
    // missing or malformed values abort startup.
    let provider: Arc<dyn ShoesProvider> = match cli.backend {
        Backend::Aws => Arc::new(AwsShoes::new(AwsConfig::from_env()?).await),
        Backend::Lxd => Arc::new(LxdShoes::new(LxdConfig::from_env()?)?),
        Backend::Openstack => Arc::new(OpenStackShoes::new(OpenStackConfig::from_env()?).await?),
    };

    plugin::serve(provider).await?;
    Ok(())
}
