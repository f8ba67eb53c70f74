use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledger_node::{ControlRequest, ControlResponse};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "Control client for a running ledger-node")]
struct Cli {
    /// Node control URL (e.g. http://127.0.0.1:8080)
    #[arg(long, env = "LEDGER_NODE_URL", default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Daemon status, mining state and network summary
    Status,
    /// Shut the daemon down
    Stop,
    /// Ask every peer for longer versions of every local chain
    Sync,
    /// Ask every peer for a longer version of one chain
    Fetch { chain_id: String },
    /// Mine the oldest pending transaction of a chain
    Mine {
        chain_id: String,
        /// Who receives the block reward (daemon default if omitted)
        #[arg(long)]
        reward_address: Option<String>,
    },
    /// Remember a peer; discovery connects to it
    Connect { host: String, port: u16 },
    /// Connected and known peers
    Peers,
    /// Create a chain
    Create {
        name: String,
        /// Reward per mined block, e.g. 10 or 2.5
        #[arg(long, default_value = "10")]
        reward: String,
        /// Number of leading hex zeros a block hash needs
        #[arg(long, default_value_t = 2)]
        difficulty: u32,
    },
    /// Delete a chain and everything in it
    Remove { chain_id: String },
    /// All local chains
    List,
    /// Check a chain's hashes and links
    Verify { chain_id: String },
    /// Newest blocks of a chain
    Ledger {
        chain_id: String,
        #[arg(short, long, default_value_t = 10)]
        number: usize,
    },
    /// Queue a transaction for mining
    Add {
        chain_id: String,
        payer: String,
        amount: String,
        /// Tax details as JSON, e.g. '{"Kind":"PersonalIncomeTax",...}'
        #[arg(long)]
        tax: Option<String>,
    },
    /// Mined transactions of one payer
    Gather { chain_id: String, payer: String },
    /// Chain metadata and block count
    Info { chain_id: String },
}

impl Command {
    fn into_request(self) -> Result<ControlRequest> {
        Ok(match self {
            Command::Status => ControlRequest::new("status"),
            Command::Stop => ControlRequest::new("stop"),
            Command::Sync => ControlRequest::new("sync"),
            Command::Fetch { chain_id } => ControlRequest::new("fetch").with("chainId", chain_id),
            Command::Mine {
                chain_id,
                reward_address,
            } => {
                let request = ControlRequest::new("mine").with("chainId", chain_id);
                match reward_address {
                    Some(address) => request.with("rewardAddress", address),
                    None => request,
                }
            }
            Command::Connect { host, port } => ControlRequest::new("connect")
                .with("host", host)
                .with("port", port),
            Command::Peers => ControlRequest::new("peers"),
            Command::Create {
                name,
                reward,
                difficulty,
            } => ControlRequest::new("create")
                .with("name", name)
                .with("reward", reward)
                .with("difficulty", difficulty),
            Command::Remove { chain_id } => ControlRequest::new("remove").with("chainId", chain_id),
            Command::List => ControlRequest::new("list"),
            Command::Verify { chain_id } => ControlRequest::new("verify").with("chainId", chain_id),
            Command::Ledger { chain_id, number } => ControlRequest::new("ledger")
                .with("chainId", chain_id)
                .with("number", number),
            Command::Add {
                chain_id,
                payer,
                amount,
                tax,
            } => {
                let mut transaction = json!({ "PayerId": payer, "Amount": amount });
                if let Some(tax) = tax {
                    let tax: Value = serde_json::from_str(&tax).context("--tax is not valid JSON")?;
                    transaction["Tax"] = tax;
                }
                ControlRequest::new("add")
                    .with("chainId", chain_id)
                    .with("transaction", transaction)
            }
            Command::Gather { chain_id, payer } => ControlRequest::new("gather")
                .with("chainId", chain_id)
                .with("payerId", payer),
            Command::Info { chain_id } => ControlRequest::new("info").with("chainId", chain_id),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let request = cli.cmd.into_request()?;
    debug!(command = %request.command, "sending control request");

    let client = reqwest::Client::new();
    let url = format!("{}/control", cli.node.trim_end_matches('/'));
    let res = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("cannot reach {url}"))?;
    let status = res.status();
    let response: ControlResponse = res
        .json()
        .await
        .with_context(|| format!("unexpected reply from {url} ({status})"))?;

    println!("{}", response.message);
    if let Some(data) = &response.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}
