mod auth;
mod codec;
mod config;
mod event;
mod filter;
mod ingest;
mod keys;
mod publish;
mod server;
mod signer;
mod storage;
mod ws;

use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use config::Settings;
use publish::Publisher;
use storage::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "rostr", author, version, about = "Indexed nostr relay with live subscriptions")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and initialize the event database.
    Init,
    /// Run the relay: WebSocket, relay info, and health check on `BIND`.
    Serve,
    /// Ingest line-delimited JSON event files through the verified write path.
    Import {
        /// Paths to NDJSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Stream the store to stdout as line-delimited JSON.
    Export {
        /// Restrict the export to these authors (hex pubkeys).
        #[arg(long = "author")]
        authors: Vec<String>,
    },
    /// Re-verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Rebuild all secondary indexes from the stored event records.
    Reindex,
    /// Generate a keypair and print it as hex.
    Keygen,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let signer = signer::default_signer();
    match cli.command {
        Commands::Init => {
            Store::open(&cfg.store_root)?;
        }
        Commands::Serve => {
            let store = Store::open(&cfg.store_root)?;
            let addr: SocketAddr = cfg.bind.parse()?;
            let state =
                server::AppState::new(store, Publisher::new(), signer, Arc::new(cfg));
            tracing::info!(%addr, "relay listening");
            server::serve(addr, state, std::future::pending()).await?;
        }
        Commands::Import { files } => {
            let store = Store::open(&cfg.store_root)?;
            for file in files {
                let reader = BufReader::new(std::fs::File::open(&file)?);
                let (accepted, rejected) = store.import(reader, signer.as_ref())?;
                println!("{file}: {accepted} accepted, {rejected} rejected");
            }
        }
        Commands::Export { authors } => {
            let store = Store::open(&cfg.store_root)?;
            let mut out = std::io::stdout().lock();
            store.export(&mut out, &authors)?;
        }
        Commands::Verify { sample } => {
            let store = Store::open(&cfg.store_root)?;
            let checked = store.verify_sample(signer.as_ref(), sample)?;
            println!("verified {checked} events");
        }
        Commands::Reindex => {
            let store = Store::open(&cfg.store_root)?;
            store.reindex()?;
        }
        Commands::Keygen => {
            let (sec, pubkey) = signer.generate()?;
            println!("secret: {}", sec.to_hex());
            println!("public: {}", hex::encode(pubkey));
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::event::Event;
    use std::{fs, time::Duration};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    fn write_env(dir: &TempDir) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND=127.0.0.1:0\n",
            dir.path().to_str().unwrap()
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn clear_vars() {
        for v in ["STORE_ROOT", "BIND", "AUTH_REQUIRED", "WRITE_ALLOW"] {
            std::env::remove_var(v);
        }
    }

    fn signed_event_line() -> (String, String) {
        let signer = signer::default_signer();
        let (sec, pubkey) = signer.generate().unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: "hi".into(),
            sig: String::new(),
        };
        let id = codec::event_id(&ev);
        ev.id = hex::encode(id);
        ev.sig = hex::encode(signer.sign(&sec, &id).unwrap());
        (codec::event_json(&ev), ev.id)
    }

    #[tokio::test]
    async fn run_init_import_verify_reindex() {
        let _g = crate::config::ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir);

        run(Cli { env: env_file.clone(), command: Commands::Init })
            .await
            .unwrap();

        let (line, id) = signed_event_line();
        let ev_path = dir.path().join("events.ndjson");
        fs::write(&ev_path, format!("{line}\n")).unwrap();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Import { files: vec![ev_path.to_str().unwrap().into()] },
        })
        .await
        .unwrap();

        run(Cli { env: env_file.clone(), command: Commands::Reindex })
            .await
            .unwrap();
        run(Cli { env: env_file.clone(), command: Commands::Verify { sample: 10 } })
            .await
            .unwrap();

        let store = Store::open(dir.path()).unwrap();
        assert!(store.get_by_id(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn run_serve_starts_http() {
        let _g = crate::config::ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND=127.0.0.1:{}\n",
            dir.path().to_str().unwrap(),
            port
        );
        fs::write(&env_path, content).unwrap();
        let env_str = env_path.to_str().unwrap().to_string();

        let handle = task::spawn(run(Cli { env: env_str, command: Commands::Serve }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let url = format!("http://127.0.0.1:{}/healthz", port);
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success());
        handle.abort();
    }
}
