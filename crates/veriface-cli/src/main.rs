use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};

const DIRECTIONS: [&str; 5] = ["front", "left", "right", "up", "down"];

#[derive(Parser)]
#[command(name = "veriface", about = "Depth-verified face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an identity from a directory of direction images
    Register {
        /// Phone number (identity key part 1)
        phone: String,
        /// Display name (identity key part 2)
        name: String,
        /// Directory containing front/left/right/up/down images (.png or .jpg)
        dir: PathBuf,
    },
    /// Run a camera verification session against all registered identities
    Verify {
        /// Terminal id for rate limiting
        #[arg(long, default_value = "cli")]
        client: String,
        /// Session shape: "count" stops at the frame target, "time" runs
        /// the daemon's recognition window
        #[arg(long, default_value = "count")]
        mode: String,
    },
    /// Verify a batch of still images
    VerifyImages {
        /// Image files to verify
        images: Vec<PathBuf>,
    },
    /// Check which directions an identity has registered
    Check { phone: String, name: String },
    /// Delete every record for an identity
    Delete { phone: String, name: String },
    /// List registered identities
    List,
    /// Show daemon status
    Status,
    /// Encrypt legacy plaintext identity fields (dry run unless --apply)
    Migrate {
        #[arg(long)]
        apply: bool,
    },
}

// `#[zbus::proxy]` generates the async `VerifaceProxy` used below.
#[zbus::proxy(
    interface = "org.veriface.Verify1",
    default_service = "org.veriface.Verify1",
    default_path = "/org/veriface/Verify1"
)]
trait Veriface {
    async fn register(&self, phone: &str, name: &str, images_json: &str) -> zbus::Result<String>;
    async fn verify(&self, client_id: &str, mode: &str) -> zbus::Result<String>;
    async fn verify_images(&self, images_json: &str, liveness_json: &str)
        -> zbus::Result<String>;
    async fn check_registration(&self, phone: &str, name: &str) -> zbus::Result<String>;
    async fn delete_user(&self, phone: &str, name: &str) -> zbus::Result<u32>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn migrate_legacy(&self, dry_run: bool) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Locate `<dir>/<direction>.{png,jpg,jpeg}` and return its base64 contents.
fn read_direction_image(dir: &Path, direction: &str) -> Result<String> {
    for ext in ["png", "jpg", "jpeg"] {
        let path = dir.join(format!("{direction}.{ext}"));
        if path.is_file() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            return Ok(BASE64.encode(bytes));
        }
    }
    bail!(
        "no {direction} image found in {} (expected {direction}.png/.jpg)",
        dir.display()
    )
}

fn print_json(body: &str) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{body}"),
        },
        Err(_) => println!("{body}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if std::env::var("VERIFACE_SESSION_BUS").is_ok() {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus (is verifaced running?)")?;
    let proxy = VerifaceProxy::new(&connection).await?;

    match cli.command {
        Commands::Register { phone, name, dir } => {
            let mut images = serde_json::Map::new();
            for direction in DIRECTIONS {
                images.insert(
                    direction.to_string(),
                    serde_json::Value::String(read_direction_image(&dir, direction)?),
                );
            }
            let body = proxy
                .register(&phone, &name, &serde_json::Value::Object(images).to_string())
                .await?;
            print_json(&body);
        }
        Commands::Verify { client, mode } => {
            let body = proxy.verify(&client, &mode).await?;
            print_json(&body);
        }
        Commands::VerifyImages { images } => {
            if images.is_empty() {
                bail!("provide at least one image file");
            }
            let mut encoded = Vec::with_capacity(images.len());
            for path in &images {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                encoded.push(BASE64.encode(bytes));
            }
            let body = proxy
                .verify_images(&serde_json::to_string(&encoded)?, "")
                .await?;
            print_json(&body);
        }
        Commands::Check { phone, name } => {
            let body = proxy.check_registration(&phone, &name).await?;
            print_json(&body);
        }
        Commands::Delete { phone, name } => {
            let removed = proxy.delete_user(&phone, &name).await?;
            if removed == 0 {
                println!("identity not found");
            } else {
                println!("removed {removed} record(s)");
            }
        }
        Commands::List => {
            let body = proxy.list_users().await?;
            print_json(&body);
        }
        Commands::Status => {
            let body = proxy.status().await?;
            print_json(&body);
        }
        Commands::Migrate { apply } => {
            let body = proxy.migrate_legacy(!apply).await?;
            print_json(&body);
            if !apply {
                println!("dry run only; pass --apply to write");
            }
        }
    }

    Ok(())
}
