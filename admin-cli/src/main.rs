mod client;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client::ApiClient;
use configserver::vault::{MasterKey, Vault};
use std::io::Read;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "configserver-admin")]
#[command(about = "Operator CLI for ConfigServer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new master key file
    Keygen {
        #[arg(long, default_value = "encryption.key")]
        out: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Encrypt a value offline with the master key
    Encrypt {
        #[arg(long, default_value = "encryption.key")]
        key_file: PathBuf,
        /// Value to encrypt, `-` reads stdin
        value: String,
    },
    /// Encrypt every `{enc:plaintext}` placeholder of a file and print the result
    Tokenize {
        #[arg(long, default_value = "encryption.key")]
        key_file: PathBuf,
        file: PathBuf,
    },
    /// Register a client and print its credentials
    Register {
        #[arg(long, env = "CONFIGSERVER_URL", default_value = "http://localhost:4200")]
        server: String,
        /// Leave out to let the server pick one
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long = "repository", short = 'r', required = true)]
        repositories: Vec<String>,
    },
    /// Obtain a bearer token for a registered client
    Token {
        #[arg(long, env = "CONFIGSERVER_URL", default_value = "http://localhost:4200")]
        server: String,
        #[arg(long)]
        client_id: String,
        #[arg(long, env = "CONFIGSERVER_CLIENT_SECRET", hide_env_values = true)]
        client_secret: String,
        #[arg(long = "repository", short = 'r', required = true)]
        repositories: Vec<String>,
    },
    /// List configured repositories
    Repositories {
        #[arg(long, env = "CONFIGSERVER_URL", default_value = "http://localhost:4200")]
        server: String,
    },
    /// Show per-repository statistics
    Stats {
        #[arg(long, env = "CONFIGSERVER_URL", default_value = "http://localhost:4200")]
        server: String,
    },
}

fn load_vault(key_file: &Path) -> Result<Vault> {
    let key = MasterKey::load_or_create(key_file, false)
        .with_context(|| format!("Failed to read master key from {}", key_file.display()))?;
    Ok(Vault::new(key))
}

fn keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!(
            "{} already exists, pass --force to replace it (tokens sealed with the old key become unreadable)",
            out.display()
        );
    }
    MasterKey::generate()
        .save(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Master key written to {}", out.display());
    Ok(())
}

fn encrypt(key_file: &Path, value: &str) -> Result<String> {
    let vault = load_vault(key_file)?;
    let plaintext = Zeroizing::new(if value == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer.trim_end_matches(['\r', '\n']).to_string()
    } else {
        value.to_string()
    });
    if plaintext.is_empty() {
        bail!("Nothing to encrypt");
    }
    Ok(vault.encrypt(plaintext.as_bytes())?)
}

fn tokenize(key_file: &Path, file: &Path) -> Result<String> {
    let vault = load_vault(key_file)?;
    let document = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(vault.tokenize(&document)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { out, force } => keygen(&out, force)?,
        Commands::Encrypt { key_file, value } => println!("{}", encrypt(&key_file, &value)?),
        Commands::Tokenize { key_file, file } => print!("{}", tokenize(&key_file, &file)?),
        Commands::Register {
            server,
            client_id,
            repositories,
        } => {
            let response = ApiClient::new(&server)?
                .register(client_id, repositories)
                .await?;
            println!("Client ID:     {}", response.client_id);
            println!("Client secret: {}", response.client_secret);
            eprintln!("The secret is shown only once, store it now.");
        }
        Commands::Token {
            server,
            client_id,
            client_secret,
            repositories,
        } => {
            let client_secret = Zeroizing::new(client_secret);
            let token = ApiClient::new(&server)?
                .token(&client_id, &client_secret, &repositories)
                .await?;
            println!("{}", token.access_token);
            eprintln!("Scope: {} (expires in {}s)", token.scope, token.expires_in);
        }
        Commands::Repositories { server } => {
            for name in ApiClient::new(&server)?.repositories().await? {
                println!("{}", name);
            }
        }
        Commands::Stats { server } => {
            let stats = ApiClient::new(&server)?.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
