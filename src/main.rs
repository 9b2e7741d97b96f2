use std::io;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ec2ctl::creds;
use ec2ctl::facade::{Dispatch, Ec2Facade, BRIEF_FIELDS, DEFAULT_FIELDS};
use ec2ctl::provider::{Args, Ec2Provider};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
/// Convenience console for EC2
struct Cli {
    /// AWS region
    #[clap(long, value_parser, default_value = "us-east-1")]
    region: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List instances as flattened records
    Instances {
        /// Comma-separated field names to keep
        #[clap(long, value_delimiter = ',')]
        fields: Option<Vec<String>>,

        /// Short field set: instanceId, ipAddress, tagSet, instanceState
        #[clap(long)]
        brief: bool,
    },
    /// Raw describe of a single instance
    Instance { id: String },
    /// Associate an elastic IP with an instance
    Associate { address: String, id: String },
    /// List security groups
    Sgs,
    /// Print the console log of an instance
    Log { id: String },
    /// Terminate an instance
    Terminate { id: String },
    /// Invoke a provider operation by name, trying a describe_ prefix second
    Call {
        name: String,

        /// key=value operation arguments
        args: Vec<String>,
    },
}

fn parse_call_args(pairs: &[String]) -> Result<Args> {
    let mut args = Args::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or(anyhow!("expected key=value, got {pair}"))?;
        args.insert(key.to_string(), json!(value));
    }
    Ok(args)
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let path = creds::config_path();
    let credentials = {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        creds::load(&path, &mut input, &mut output)
            .with_context(|| format!("failed to load credentials from {}", path.display()))?
    };
    info!(?path, "credentials loaded");

    let provider = Ec2Provider::new(&credentials, cli.region.clone()).await;
    let facade = Ec2Facade::new(provider);

    match cli.command {
        Command::Instances { fields, brief } => {
            let keep: Vec<&str> = match &fields {
                Some(fields) => fields.iter().map(String::as_str).collect(),
                None if brief => BRIEF_FIELDS.to_vec(),
                None => DEFAULT_FIELDS.to_vec(),
            };
            let records = facade.instances(&keep).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Instance { id } => {
            let resp = facade.instance(&id).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Command::Associate { address, id } => {
            let resp = facade.associate(&address, &id).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Command::Sgs => {
            let groups = facade.security_groups().await?;
            println!("{}", serde_json::to_string_pretty(&groups)?);
        }
        Command::Log { id } => {
            for line in facade.console_log(&id).await? {
                println!("{line}");
            }
        }
        Command::Terminate { id } => {
            let resp = facade.terminate(&id).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Command::Call { name, args } => match facade.call(&name, parse_call_args(&args)?).await? {
            Dispatch::Found(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Dispatch::NotFound(commands) => {
                println!("no operation named {name} or describe_{name}");
                println!("available commands:");
                for command in commands {
                    println!("  {command}");
                }
            }
        },
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = EnvFilter::new("info,aws_config=warn");
    if let Ok(var) = std::env::var("RUST_LOG") {
        filter = filter.add_directive(var.parse()?);
    }
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(filter)
        .init();

    let _ = run().await.inspect_err(|e| error!(?e, "run error"));

    Ok(())
}
