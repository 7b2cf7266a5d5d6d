// src/main.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bundler;
mod config;
mod contracts;
mod entry_point;
mod error;
mod estimation;
mod events;
mod execution;
mod gas;
mod paymaster;
mod rpc;
mod types;
mod validation;
mod validation_data;

use crate::bundler::Bundler;
use crate::config::{load_simulation_code, BundlerConfig};
use crate::entry_point::EntryPoint;
use crate::execution::BundleSender;
use crate::paymaster::PaymasterSigner;
use crate::rpc::{BundlerApiServer, BundlerRpcImpl};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "AA_BUNDLER_RPC_SERVER_ADDR", default_value = "127.0.0.1:3000")]
    rpc_server_addr: String,

    #[clap(long, env = "AA_BUNDLER_ETH_RPC_URL")]
    eth_rpc_url: String,

    #[clap(
        long,
        env = "AA_BUNDLER_ENTRY_POINT",
        default_value = "0x0000000071727De22E5E9d8BAf0edAc6f37da032"
    )]
    entry_point: Address,

    /// Operator key, signs bundles and paymaster sponsorships
    #[clap(long, env = "AA_BUNDLER_PRIVATE_KEY", hide_env_values = true)]
    private_key: String,

    /// Defaults to the operator address
    #[clap(long, env = "AA_BUNDLER_BENEFICIARY")]
    beneficiary: Option<Address>,

    /// In wei
    #[clap(
        long,
        env = "AA_BUNDLER_MIN_BALANCE",
        default_value = "100000000000000000",
        value_parser = parse_wei
    )]
    min_balance: U256,

    #[clap(long = "unsafe", env = "AA_BUNDLER_UNSAFE")]
    unsafe_mode: bool,

    #[clap(long, env = "AA_BUNDLER_PAYMASTER")]
    paymaster: Option<Address>,

    /// Seconds a paymaster sponsorship stays valid
    #[clap(long, env = "AA_BUNDLER_PAYMASTER_VALID_DURATION", default_value = "3600")]
    paymaster_valid_duration: u64,

    /// File holding the hex runtime bytecode served at the entry point during simulation
    #[clap(long, env = "AA_BUNDLER_SIMULATION_CODE")]
    simulation_code: PathBuf,
}

fn parse_wei(value: &str) -> Result<U256, String> {
    U256::from_dec_str(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let simulation_code = load_simulation_code(&args.simulation_code)?;

    let provider = Provider::<Http>::try_from(args.eth_rpc_url.as_str())
        .context("invalid eth rpc url")?;
    let chain_id = provider
        .get_chainid()
        .await
        .context("should fetch chain id")?
        .as_u64();
    let wallet = args
        .private_key
        .parse::<LocalWallet>()
        .context("invalid private key")?
        .with_chain_id(chain_id);
    let operator = wallet.address();

    let config = BundlerConfig {
        entry_point: args.entry_point,
        beneficiary: args.beneficiary,
        min_balance: args.min_balance,
        unsafe_mode: args.unsafe_mode,
        paymaster: args.paymaster,
        paymaster_valid_duration: args.paymaster_valid_duration,
        simulation_code,
    };
    info!(
        "Bundler operator {:?} on chain {} using entry point {:?}",
        operator, chain_id, config.entry_point
    );

    let entry_point = Arc::new(EntryPoint::new(
        config.entry_point,
        Arc::new(provider.clone()),
        config.simulation_code.clone(),
    ));
    let execution = Arc::new(BundleSender::new(
        Arc::new(SignerMiddleware::new(provider, wallet.clone())),
        config.entry_point,
        operator,
        config.beneficiary.unwrap_or(operator),
        config.min_balance,
    ));
    let paymaster = config.paymaster.map(|address| {
        info!("Sponsoring through paymaster {:?}", address);
        PaymasterSigner::new(wallet, address, chain_id, config.paymaster_valid_duration)
    });
    let bundler = Arc::new(Bundler::new(config, entry_point, execution, paymaster));

    let server_addr: SocketAddr = args.rpc_server_addr.parse()?;
    info!("Starting ERC-4337 bundler RPC server on {}", server_addr);
    let server_handle = start_server(server_addr, BundlerRpcImpl::new(bundler)).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn start_server(
    server_addr: SocketAddr,
    rpc_impl: impl BundlerApiServer,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    Ok(server.start(rpc_impl.into_rpc()))
}
