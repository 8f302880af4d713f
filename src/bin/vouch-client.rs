//! Command line client for a vouch server.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use vouch::clock::{Clock, SystemClock};
use vouch::crypto::{self, KeyPair};
use vouch::protocol::{
    AddSignatureRequest, ChallengeResponse, IdentityResponse, PublicKeyRequest,
    RegisterChallengeRequest, SessionChallengeRequest, SessionIdRequest, SessionStarted,
    SignaturesResponse, Success,
};
use vouch::trust::VerifyMessage;

#[derive(Parser, Debug)]
#[command(name = "vouch-client")]
#[command(about = "Register keys, open sessions and vouch for other keys")]
struct Cli {
    /// Base URL of the server
    #[arg(long, env = "VOUCH_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Private key file (PKCS#8 PEM)
    #[arg(long, env = "VOUCH_KEY_FILE", default_value = "vouch_key.pem")]
    key_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new private key file
    Keygen {
        #[arg(long, default_value = "2048")]
        bits: u32,
    },
    /// Register the public key under a name
    Register {
        name: String,
        #[arg(long, default_value = "")]
        organization: String,
    },
    /// Prove key possession and open a session
    Login {
        /// Port other users should reach this client on
        #[arg(long)]
        port: i64,
    },
    /// Keep a session alive
    Refresh { session_id: String },
    /// End a session
    Logout { session_id: String },
    /// Sign a trust statement about another user's public key
    Vouch {
        /// PEM file holding the signee's public key
        signee: PathBuf,
        #[arg(long, default_value = "presence")]
        message_key: String,
        #[arg(long, default_value = "")]
        modifiers: String,
        /// Validity in seconds from now
        #[arg(long, default_value = "86400")]
        valid_for: i64,
    },
    /// List signatures vouching for a public key (defaults to our own)
    Signatures { key: Option<PathBuf> },
}

struct Api {
    client: Client,
    base: String,
}

impl Api {
    fn new(base: &str) -> Self {
        Api {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base, path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let res = request.send().await.context("request failed")?;
        let status = res.status();
        if !status.is_success() {
            let body: serde_json::Value = res.json().await.unwrap_or_default();
            let reason = body["error"].as_str().unwrap_or("no reason given").to_string();
            bail!("server returned {}: {}", status, reason);
        }
        Ok(res.json().await?)
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        self.send(self.request(method, path).json(body)).await
    }
}

fn load_keys(path: &Path) -> anyhow::Result<KeyPair> {
    let pem = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(KeyPair::from_pem(&pem)?)
}

fn read_public_key(path: &Path) -> anyhow::Result<String> {
    let pem = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(crypto::PublicKey::from_pem(&pem)?.to_pem()?)
}

/// Decrypt the nonce and sign it.
fn answer(keys: &KeyPair, challenge: &ChallengeResponse) -> anyhow::Result<String> {
    let nonce = keys.decrypt_from_base64(&challenge.message)?;
    Ok(crypto::encode_base64(&keys.sign(&nonce)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let api = Api::new(&cli.server);

    match cli.command {
        Command::Keygen { bits } => {
            let keys = KeyPair::generate(bits)?;
            keys.save(&cli.key_file)?;
            println!("✅ Wrote {}-bit key to {}", bits, cli.key_file.display());
            println!("{}", keys.public_key().to_pem()?);
        }
        Command::Register { name, organization } => {
            let keys = load_keys(&cli.key_file)?;
            let public_key = keys.public_key().to_pem()?;
            let challenge: ChallengeResponse = api
                .call(Method::PUT, "/a/register", &PublicKeyRequest { public_key })
                .await?;
            let req = RegisterChallengeRequest {
                signature: answer(&keys, &challenge)?,
                index: challenge.index,
                name: name.clone(),
                organization,
            };
            let _: Success = api.call(Method::PUT, "/a/register/challenge", &req).await?;
            println!("✅ Registered as {}", name);
        }
        Command::Login { port } => {
            let keys = load_keys(&cli.key_file)?;
            let public_key = keys.public_key().to_pem()?;
            let challenge: ChallengeResponse = api
                .call(Method::POST, "/a/session", &PublicKeyRequest { public_key })
                .await?;
            let req = SessionChallengeRequest {
                signature: answer(&keys, &challenge)?,
                index: challenge.index,
                port,
            };
            let started: SessionStarted = api.call(Method::PUT, "/a/session/challenge", &req).await?;
            println!("{}", started.session_id);
        }
        Command::Refresh { session_id } => {
            let _: Success = api
                .call(Method::POST, "/a/session/refresh", &SessionIdRequest { session_id })
                .await?;
            println!("✅ Session refreshed");
        }
        Command::Logout { session_id } => {
            let _: Success = api
                .call(Method::DELETE, "/a/session", &SessionIdRequest { session_id })
                .await?;
            println!("✅ Session closed");
        }
        Command::Vouch {
            signee,
            message_key,
            modifiers,
            valid_for,
        } => {
            let keys = load_keys(&cli.key_file)?;
            let signee_public_key = read_public_key(&signee)?;
            let identity: IdentityResponse = api.send(api.request(Method::GET, "/a/identity")).await?;

            let now = i64::try_from(SystemClock.now())?;
            let message = VerifyMessage {
                public_key: signee_public_key.clone(),
                start_time: now,
                end_time: now.saturating_add(valid_for),
                check_server: identity.host_name,
                message_key,
                modifiers,
            };
            let req = AddSignatureRequest {
                signature: crypto::encode_base64(&keys.sign(message.canonical().as_bytes())?),
                message,
                signer_public_key: keys.public_key().to_pem()?,
                signee_public_key,
            };
            let _: Success = api.call(Method::POST, "/a/sign", &req).await?;
            println!("✅ Signature recorded");
        }
        Command::Signatures { key } => {
            let public_key = match key {
                Some(path) => read_public_key(&path)?,
                None => load_keys(&cli.key_file)?.public_key().to_pem()?,
            };
            let listed: SignaturesResponse = api
                .send(api.request(Method::GET, "/a/signatures").query(&[("key", public_key)]))
                .await?;

            for entry in listed.signatures {
                let signer_key = crypto::PublicKey::from_pem(&entry.signer.public_key)?;
                let valid = serde_json::from_str::<VerifyMessage>(&entry.message)
                    .ok()
                    .zip(crypto::decode_base64(&entry.signature).ok())
                    .is_some_and(|(message, sig)| {
                        crypto::verify(&signer_key, message.canonical().as_bytes(), &sig)
                    });
                let mark = if valid { "✅" } else { "❌" };
                println!("{} {} ({})", mark, entry.signer.name, entry.signer.organization);
            }
        }
    }

    Ok(())
}
