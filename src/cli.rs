use crate::anchor_chain::{verify_record, ChainRecord};
use crate::bootstrap::{build_runtime_with_signer, load_signer, open_signer};
use crate::certificate::CertificateIssuer;
use crate::config::GatewayConfig;
use crate::errors::{AgidError, AgidResult};
use crate::pump::MessagePump;
use crate::remote_signer::serve_signer_tcp;
use crate::revocation::append_revocation;
use crate::signer::Signer;
use crate::transport::MemoryTransport;
use crate::web::{build_router, AppState};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Top-level CLI for the AGIdentity gateway
#[derive(Parser)]
#[command(name = "agidentity", version, about = "Identity-gated agent gateway")]
pub struct Cli {
    /// Config file (defaults to $AGID_CONFIG or ./agidentity.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and poll the message inbox
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the agent identity
    Identity,

    /// Verify a serialized anchor chain offline
    VerifyChain {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Issue a certificate signed by this agent's identity
    IssueCertificate {
        /// Subject public key (hex)
        #[arg(long)]
        subject: String,
        #[arg(long = "type")]
        cert_type: String,
        /// Field as name=value; repeat for more fields
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
        #[arg(long)]
        revocation_outpoint: String,
        /// Write the issued certificate here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Mark a certificate's revocation outpoint as spent
    Revoke {
        #[arg(long)]
        outpoint: String,
    },

    /// Serve this key as a remote signer for gateways with `signer.endpoint`
    ServeSigner {
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: String,
    },

    /// Print the effective configuration
    Config,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

impl Cli {
    pub fn load_config(&self) -> AgidResult<GatewayConfig> {
        match &self.config {
            Some(path) => GatewayConfig::load_from(path),
            None => GatewayConfig::load(),
        }
    }
}

pub async fn run(cli: Cli, config: GatewayConfig) -> AgidResult<()> {
    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Identity => {
            let signer = open_signer(&config).await?;
            println!("{}", serde_json::to_string_pretty(&signer.identity())?);
            Ok(())
        }
        Commands::VerifyChain { file } => verify_chain_file(&file),
        Commands::IssueCertificate {
            subject,
            cert_type,
            fields,
            revocation_outpoint,
            output,
        } => {
            let issuer = CertificateIssuer::new(open_signer(&config).await?);
            let fields: BTreeMap<String, String> = fields.into_iter().collect();
            let issued = issuer
                .issue(&cert_type, &subject, &fields, &revocation_outpoint)
                .await?;
            let rendered = serde_json::to_string_pretty(&issued)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .map_err(|e| AgidError::io("write certificate", e))?;
                    println!(
                        "certificate {} written to {}",
                        issued.certificate.serial_number,
                        path.display()
                    );
                }
                None => println!("{rendered}"),
            }
            Ok(())
        }
        Commands::Revoke { outpoint } => {
            let path = config.verification.revoked_outpoints_file.as_ref().ok_or_else(|| {
                AgidError::config("verification.revoked_outpoints_file is not configured")
            })?;
            append_revocation(path, &outpoint)?;
            println!("outpoint {} revoked in {}", outpoint.trim(), path.display());
            Ok(())
        }
        Commands::ServeSigner { listen } => {
            let signer: Arc<dyn Signer> = Arc::new(load_signer(&config)?);
            let listener = tokio::net::TcpListener::bind(&listen)
                .await
                .map_err(|e| AgidError::io(format!("bind {listen}"), e))?;
            info!(addr = %listen, public_key = %signer.identity().public_key, "serving signer");
            tokio::select! {
                served = serve_signer_tcp(signer, listener) => served,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        Commands::Config => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: GatewayConfig, host: Option<String>, port: Option<u16>) -> AgidResult<()> {
    let runtime = build_runtime_with_signer(&config, open_signer(&config).await?)?;
    let sweeper = runtime.conversations.spawn_sweeper();
    let revocation_watch = config
        .verification
        .revoked_outpoints_file
        .clone()
        .map(|path| {
            runtime
                .revocations
                .spawn_file_watch(path, config.revocation_reload_interval())
        });

    // Peers reach the in-process transport hub; a networked transport plugs
    // in through the same trait.
    let transport = Arc::new(MemoryTransport::new(runtime.gateway.identity().public_key.clone()));
    let pump = Arc::new(MessagePump::new(
        transport,
        runtime.gateway.clone(),
        config.pump_settings(),
    ));
    let pump_task = pump.spawn();

    let host = host.unwrap_or(config.web.host.clone());
    let port = port.unwrap_or(config.web.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AgidError::io(format!("bind {addr}"), e))?;
    info!(addr = %addr, "agidentity gateway listening");

    let app = build_router(AppState::new(runtime.gateway.clone()));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| AgidError::io("serve", e));

    pump_task.abort();
    sweeper.abort();
    if let Some(watch) = revocation_watch {
        watch.abort();
    }
    info!("agidentity gateway stopped");
    served
}

fn verify_chain_file(file: &Path) -> AgidResult<()> {
    let raw = std::fs::read_to_string(file).map_err(|e| AgidError::io("read chain file", e))?;
    let record: ChainRecord = serde_json::from_str(&raw)?;
    let verification = verify_record(&record)?;
    println!("{}", serde_json::to_string_pretty(&verification)?);
    if verification.valid {
        Ok(())
    } else {
        Err(AgidError::integrity(format!(
            "chain {} diverges at anchor {}",
            record.session_id,
            verification
                .first_divergent_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "?".to_string())
        )))
    }
}
