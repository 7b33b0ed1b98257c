use clap::{Parser, Subcommand};
use modelx::{
    client::Client,
    errors::{ClientError, Result},
    model::{init_model, MODEL_CONFIG_FILE_NAME},
    reference::{parse_reference, Reference},
    repos::{RepoDetails, RepoManager},
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelx")]
#[command(version = "0.1.0")]
#[command(about = "Push and pull model bundles against a modelx registry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a model directory to a repository version
    Push {
        /// registry/repository@version, or alias:repository@version
        reference: String,
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Pull a repository version into a directory
    Pull {
        reference: String,
        dir: Option<PathBuf>,
    },
    /// List repositories, versions, or files depending on the reference
    List {
        reference: String,
        #[arg(long, default_value = "", help = "Server-side regex filter")]
        search: String,
    },
    /// Print the manifest of a version
    Info { reference: String },
    /// Scaffold a new model directory
    Init {
        dir: PathBuf,
        #[arg(long, short)]
        force: bool,
    },
    /// Verify a token against a registry and store it under an alias
    Login {
        alias: String,
        #[arg(long)]
        token: String,
    },
    /// Manage registry aliases
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Add or update an alias
    Add {
        name: String,
        url: String,
        #[arg(long, default_value = "")]
        token: String,
    },
    /// Show configured aliases
    List,
    /// Delete an alias
    Remove { name: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let cli = Cli::parse();
    let result = tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => Err(ClientError::Other("interrupted".to_string())),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn require_repository(reference: &Reference) -> Result<()> {
    if reference.repository.is_empty() {
        return Err(ClientError::InvalidReference(
            "repository is not specified".to_string(),
        ));
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let repos = RepoManager::new(&RepoManager::default_path());
    match cli.command {
        Commands::Push { reference, dir } => {
            let reference = parse_reference(&reference, &repos)?;
            require_repository(&reference)?;
            println!("Pushing to {reference}");
            let client = Client::from_reference(&reference)?;
            client
                .push(
                    &reference.repository,
                    &reference.version,
                    MODEL_CONFIG_FILE_NAME,
                    &dir,
                )
                .await
        }
        Commands::Pull { reference, dir } => {
            let reference = parse_reference(&reference, &repos)?;
            require_repository(&reference)?;
            let into = dir.unwrap_or_else(|| {
                PathBuf::from(
                    reference
                        .repository
                        .rsplit('/')
                        .next()
                        .unwrap_or("model"),
                )
            });
            println!("Pulling {reference} into {}", into.display());
            let client = Client::from_reference(&reference)?;
            client
                .pull(&reference.repository, &reference.version, &into)
                .await
        }
        Commands::List { reference, search } => {
            let reference = parse_reference(&reference, &repos)?;
            let client = Client::from_reference(&reference)?;
            let show = client.list(&reference, &search).await?;
            show.print();
            Ok(())
        }
        Commands::Info { reference } => {
            let reference = parse_reference(&reference, &repos)?;
            require_repository(&reference)?;
            let client = Client::from_reference(&reference)?;
            let manifest = client
                .get_manifest(&reference.repository, &reference.version)
                .await?;
            print!("{}", serde_yaml::to_string(&manifest)?);
            Ok(())
        }
        Commands::Init { dir, force } => {
            init_model(&dir, force)?;
            println!("Modelx model initialized in {}", dir.display());
            Ok(())
        }
        Commands::Login { alias, token } => {
            let details = match repos.get(&alias) {
                Ok(existing) => RepoDetails {
                    name: existing.name,
                    url: existing.url,
                    token,
                },
                Err(_) if url::Url::parse(&alias).is_ok() => RepoDetails {
                    name: alias.clone(),
                    url: alias.clone(),
                    token,
                },
                Err(e) => return Err(e),
            };
            let authorization = format!("Bearer {}", details.token);
            let client = Client::new(&details.url, Some(&authorization))?;
            client.ping().await?;
            repos.set(details)?;
            println!("Login succeeded");
            Ok(())
        }
        Commands::Repo { command } => match command {
            RepoCommands::Add { name, url, token } => {
                repos.set(RepoDetails { name, url, token })?;
                Ok(())
            }
            RepoCommands::List => {
                for repo in repos.list() {
                    println!("{}\t{}", repo.name, repo.url);
                }
                Ok(())
            }
            RepoCommands::Remove { name } => repos.remove(&name),
        },
    }
}
