//! Vouch server entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vouch::{
    challenge::ChallengeRegistry,
    clock::{Clock, SystemClock},
    config::Args,
    crypto::KeyPair,
    http,
    protocol::{Authority, IdentityResponse},
    session::SessionRegistry,
    store::{FirestoreStore, MemoryStore, Store},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vouch={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let (server_keys, generated) = KeyPair::load_or_generate(&args.key_file, args.key_bits)
        .with_context(|| format!("loading server key from {}", args.key_file.display()))?;
    if generated {
        info!("Generated new {}-bit server key at {}", args.key_bits, args.key_file.display());
    } else {
        info!("Loaded server key from {}", args.key_file.display());
    }

    let store: Arc<dyn Store> = match (&args.firestore_project, &args.firestore_key_file) {
        (Some(project), Some(key_file)) => {
            let store = FirestoreStore::new(project, key_file)
                .await
                .context("connecting to Firestore")?;
            info!("Firestore store: project {}", project);
            Arc::new(store)
        }
        _ => {
            info!("In-memory store (data is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let challenges = Arc::new(ChallengeRegistry::with_ttl(clock.clone(), args.challenge_ttl_secs));
    let sessions = Arc::new(SessionRegistry::with_ttl(clock.clone(), args.session_ttl_secs));
    let identity = IdentityResponse {
        host_name: args.host_name.clone(),
        public_key: server_keys.public_key().to_pem()?,
    };
    let authority = Arc::new(Authority::new(store, clock, challenges, sessions, identity));

    let (stop_maintainer, shutdown) = watch::channel(false);
    let maintainer = authority
        .maintainer()
        .with_period(args.sweep_interval())
        .spawn(shutdown);

    info!("Host: {}", args.host_name);
    info!(
        "Challenge TTL: {}s, session TTL: {}s",
        args.challenge_ttl_secs, args.session_ttl_secs
    );

    http::serve(args.listen, authority, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
    })
    .await
    .context("HTTP server failed")?;

    let _ = stop_maintainer.send(true);
    maintainer.await.context("maintainer task panicked")?;

    Ok(())
}
