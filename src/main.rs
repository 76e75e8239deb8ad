use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};

use atm_cli::chain::{Node, SignedReceipt};
use atm_cli::config::{NodeConfig, DEFAULT_STATE_DIR};
use atm_cli::ledger::{Address, Amount};
use atm_cli::session::Session;
use atm_cli::wallet::{held_identities, load_verifying_key, KeystoreWallet};

#[derive(Parser)]
#[command(name = "atm", version, about = "Custodial ATM ledger tools")]
struct Cli {
    /// Chain state directory (created by `atm init`).
    #[arg(long, default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// Seconds to wait for a confirmation before giving up.
    #[arg(long, default_value_t = 30, global = true)]
    confirm_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a fresh identity into the keystore.
    Keygen,
    /// Create the chain and deploy the ATM contract.
    Init {
        /// Opening ATM balance.
        #[arg(long, default_value_t = 0)]
        initial_balance: Amount,
        /// Deployer (and initial owner); defaults to the first keystore identity.
        #[arg(long)]
        deployer: Option<Address>,
        /// Native funds granted to the deployer at genesis.
        #[arg(long)]
        faucet: Option<Amount>,
    },
    /// Show the deployed contract, owner, balance, and height.
    Status,
    /// Connect a wallet identity and print both balances.
    Connect {
        #[arg(long)]
        account: Option<Address>,
    },
    /// Deposit into the ATM.
    Deposit {
        #[arg(long)]
        amount: Amount,
        #[arg(long)]
        account: Option<Address>,
        /// Write the signed confirmation receipt to a file.
        #[arg(long)]
        receipt_out: Option<PathBuf>,
    },
    /// Withdraw from the ATM.
    Withdraw {
        #[arg(long)]
        amount: Amount,
        #[arg(long)]
        account: Option<Address>,
        #[arg(long)]
        receipt_out: Option<PathBuf>,
    },
    /// Hand the contract to a new owner.
    TransferOwner {
        /// Target address (`0x`-prefixed hex).
        #[arg(long)]
        new_owner: String,
        #[arg(long)]
        account: Option<Address>,
    },
    /// Check a saved receipt against the node's signing key.
    VerifyReceipt { path: PathBuf },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        process::exit(2);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = NodeConfig::new(cli.state_dir);
    config.confirm_timeout = Duration::from_secs(cli.confirm_timeout);

    match cli.command {
        Command::Keygen => keygen(&config),
        Command::Init {
            initial_balance,
            deployer,
            faucet,
        } => init(&mut config, initial_balance, deployer, faucet),
        Command::Status => status(&config),
        Command::Connect { account } => connect(&config, account),
        Command::Deposit {
            amount,
            account,
            receipt_out,
        } => {
            let (receipt, session) = mutate(&config, account, Mutation::Deposit(amount))?;
            report_balances(&session);
            save_receipt(receipt_out, &receipt)?;
            Ok(())
        }
        Command::Withdraw {
            amount,
            account,
            receipt_out,
        } => {
            let (receipt, session) = mutate(&config, account, Mutation::Withdraw(amount))?;
            report_balances(&session);
            save_receipt(receipt_out, &receipt)?;
            Ok(())
        }
        Command::TransferOwner { new_owner, account } => {
            transfer_owner(&config, account, &new_owner)
        }
        Command::VerifyReceipt { path } => verify_receipt(&config, path),
    }
}

fn keygen(config: &NodeConfig) -> Result<(), Box<dyn Error>> {
    let address = KeystoreWallet::keygen(&config.keystore_dir())?;
    println!("identity written → {address}");
    Ok(())
}

fn init(
    config: &mut NodeConfig,
    initial_balance: Amount,
    deployer: Option<Address>,
    faucet: Option<Amount>,
) -> Result<(), Box<dyn Error>> {
    if config.chain_path().exists() {
        return Err(format!("chain already initialized at {}", config.state_dir().display()).into());
    }
    if let Some(grant) = faucet {
        config.faucet_grant = grant;
    }
    let deployer = match deployer {
        Some(address) => address,
        None => held_identities(&config.keystore_dir())?
            .first()
            .map(|(address, _)| *address)
            .ok_or("keystore is empty; run `atm keygen` first")?,
    };
    let node = Node::create(config, deployer, initial_balance)?;
    println!("contract deployed → {}", node.contract_address());
    println!("owner → {deployer}");
    Ok(())
}

fn status(config: &NodeConfig) -> Result<(), Box<dyn Error>> {
    let node = Node::open(config)?;
    let contract = node.contract_address();
    let owner = node.atm_owner(&contract, &node.interface_id())?;
    let balance = node.atm_balance(&contract, &node.interface_id())?;
    println!("contract: {contract}");
    println!("owner:    {owner}");
    println!("balance:  {balance}");
    println!("height:   {}", node.height());
    Ok(())
}

fn open_session(
    config: &NodeConfig,
    account: Option<Address>,
) -> Result<Session<KeystoreWallet>, Box<dyn Error>> {
    let node = Node::open(config)?;
    let mut wallet = KeystoreWallet::new(config.keystore_dir(), node.clone());
    if let Some(address) = account {
        wallet = wallet.with_preferred(address);
    }
    let mut session = Session::new(
        node.clone(),
        node.contract_address(),
        node.interface_id(),
        config.confirm_timeout,
    );
    session.discover_wallet(Some(wallet));
    if !session.connect()? {
        return Err("no wallet account available; run `atm keygen` first".into());
    }
    if let (Some(requested), Some(active)) = (account, session.account()) {
        if requested != active {
            return Err(format!("account {requested} is not held by this keystore").into());
        }
    }
    Ok(session)
}

fn connect(config: &NodeConfig, account: Option<Address>) -> Result<(), Box<dyn Error>> {
    let session = open_session(config, account)?;
    if let Some(active) = session.account() {
        println!("account: {active}");
    }
    report_balances(&session);
    Ok(())
}

enum Mutation {
    Deposit(Amount),
    Withdraw(Amount),
}

fn mutate(
    config: &NodeConfig,
    account: Option<Address>,
    mutation: Mutation,
) -> Result<(SignedReceipt, Session<KeystoreWallet>), Box<dyn Error>> {
    let mut session = open_session(config, account)?;
    let receipt = match mutation {
        Mutation::Deposit(amount) => {
            let receipt = session.deposit(amount)?;
            println!("deposit of {amount} confirmed at height {}", receipt.core.height);
            receipt
        }
        Mutation::Withdraw(amount) => {
            let receipt = session.withdraw(amount)?;
            println!(
                "withdrawal of {amount} confirmed at height {}",
                receipt.core.height
            );
            receipt
        }
    };
    Ok((receipt, session))
}

fn transfer_owner(
    config: &NodeConfig,
    account: Option<Address>,
    new_owner: &str,
) -> Result<(), Box<dyn Error>> {
    let mut session = open_session(config, account)?;
    match session.transfer_ownership(new_owner)? {
        Some(receipt) => {
            println!(
                "ownership transferred → {new_owner} (height {})",
                receipt.core.height
            );
            Ok(())
        }
        None => Err("unable to change the owner".into()),
    }
}

fn report_balances<P: atm_cli::wallet::WalletProvider>(session: &Session<P>) {
    if let Some(balance) = session.atm_balance() {
        println!("ATM balance:    {balance}");
    }
    if let Some(balance) = session.wallet_balance() {
        println!("wallet balance: {balance}");
    }
}

fn save_receipt(path: Option<PathBuf>, receipt: &SignedReceipt) -> Result<(), Box<dyn Error>> {
    let Some(path) = path else {
        return Ok(());
    };
    let bytes = serde_json::to_vec_pretty(receipt)?;
    fs::write(&path, bytes)?;
    println!("receipt written → {}", path.display());
    Ok(())
}

fn verify_receipt(config: &NodeConfig, path: PathBuf) -> Result<(), Box<dyn Error>> {
    let bytes = fs::read(&path)?;
    let receipt: SignedReceipt = serde_json::from_slice(&bytes)?;
    let node_key = load_verifying_key(&config.node_pubkey_path())?;
    if receipt.verify(&node_key) {
        println!(
            "receipt ok → height {} caller {}",
            receipt.core.height, receipt.core.caller
        );
        Ok(())
    } else {
        Err("receipt signature invalid".into())
    }
}
