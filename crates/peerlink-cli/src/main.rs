//! PeerLink CLI
//!
//! Direct-connection file transfer between two peers sharing a nonce.

mod config;
mod progress;
mod signaling;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use peerlink_core::{
    Envelope, HandshakeConfig, IdGenerator, MessageSession, Nonce, NonceAuth, PacketReceiver,
    TransferDirection, TransferEvent, TransferKind, TransferProgress, TransferSession,
};
use peerlink_transport::{DirectListener, connect};
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use config::Config;
use progress::{ProgressDisplay, format_bytes, summary};
use signaling::{AcceptFiles, Answer, AwaitAnswer, Invitation};

/// How long either side waits for the other to answer
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest silence tolerated while data is moving
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// PeerLink - peer-to-peer file transfer over direct connections
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a listening peer
    Send {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Address the receiver listens on
        #[arg(long)]
        to: SocketAddr,

        /// Nonce printed by the receiver
        #[arg(long)]
        nonce: Nonce,
    },

    /// Listen for one incoming file
    Receive {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Listen address, overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,

        /// Nonce to expect; a random one is generated when omitted
        #[arg(long)]
        nonce: Option<Nonce>,
    },

    /// Print a fresh nonce
    Nonce {
        /// Also print its SHA-1 fingerprint
        #[arg(long)]
        hashed: bool,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Send { file, to, nonce } => send_file(file, to, nonce, &config).await,
        Commands::Receive {
            output,
            bind,
            nonce,
        } => receive_file(output, bind, nonce, &config).await,
        Commands::Nonce { hashed } => {
            let nonce = Nonce::random(&mut IdGenerator::new());
            println!("{nonce}");
            if hashed {
                println!("SHA-1: {}", nonce.hashed());
            }
            Ok(())
        }
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                bail!("{} exists (use --force to overwrite)", config_path.display());
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
    }
}

fn nonce_auth(nonce: Nonce, config: &Config) -> NonceAuth {
    if config.direct.hashed_nonce {
        NonceAuth::hashed(nonce)
    } else {
        NonceAuth::plain(nonce)
    }
}

fn receiver_of(session: &Arc<MessageSession>) -> Weak<dyn PacketReceiver> {
    let weak: Weak<MessageSession> = Arc::downgrade(session);
    weak
}

/// Send a file to a listening peer
async fn send_file(
    file: PathBuf,
    to: SocketAddr,
    nonce: Nonce,
    config: &Config,
) -> anyhow::Result<()> {
    let size = std::fs::metadata(&file)
        .with_context(|| format!("File not found: {}", file.display()))?
        .len();
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let version = config.protocol_version()?;

    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(size));
    println!("Peer: {to}");

    let handshake = HandshakeConfig::connector(version, nonce_auth(nonce, config));
    let connection = connect(to, handshake, config.direct_config())
        .await
        .with_context(|| format!("connecting to {to}"))?;
    tracing::info!(peer = %connection.peer_addr(), %version, "direct connection established");

    let session = MessageSession::new(to.to_string(), config.session_config()?);
    let source = File::open(&file)?;
    let transfer = TransferSession::create(
        &session,
        TransferDirection::Send,
        TransferKind::File,
        Box::new(source),
        config.transfer_config(),
    )?;
    let events = transfer.subscribe();
    let (answers_tx, answers) = crossbeam_channel::unbounded();
    session.add_handler(Arc::new(AwaitAnswer::new(Arc::clone(&transfer), answers_tx)));

    let transport = connection.attach(receiver_of(&session))?;
    session.set_direct_transport(Some(transport));

    let invitation = Invitation {
        call_id: format!("{{{}}}", Nonce::random(&mut IdGenerator::new())),
        session_id: transfer.id(),
        filename: filename.clone(),
        size,
    };
    session.send(Envelope::signaling(version, &invitation.to_message(&to.to_string())))?;
    println!("Waiting for the receiver to accept...");

    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<TransferProgress> {
        match answers.recv_timeout(ANSWER_TIMEOUT) {
            Ok(Answer::Accepted) => {}
            Ok(Answer::Declined(code)) => bail!("receiver declined the file ({code})"),
            Ok(Answer::Bye) => bail!("receiver hung up"),
            Err(_) => {
                transfer.abort();
                bail!("no answer from the receiver");
            }
        }

        let display = ProgressDisplay::new(size, &filename);
        let progress = watch(&transfer, &events, &display)?;

        // The receiver says goodbye once the last octet is on disk
        match answers.recv_timeout(ANSWER_TIMEOUT) {
            Ok(Answer::Bye) => tracing::debug!("receiver confirmed"),
            _ => tracing::warn!("receiver did not confirm completion"),
        }
        transfer.join();
        Ok(progress)
    })
    .await?;

    session.close();
    let progress = result?;
    println!("Sent {}", summary(&progress));
    Ok(())
}

/// Listen for one incoming file
async fn receive_file(
    output: PathBuf,
    bind: Option<String>,
    nonce: Option<Nonce>,
    config: &Config,
) -> anyhow::Result<()> {
    if !output.exists() {
        std::fs::create_dir_all(&output)?;
    }
    let addr: SocketAddr = match bind {
        Some(bind) => bind.parse().with_context(|| format!("invalid listen address {bind}"))?,
        None => config.parse_listen_addr()?,
    };
    let version = config.protocol_version()?;
    let nonce = nonce.unwrap_or_else(|| Nonce::random(&mut IdGenerator::new()));

    let listener = DirectListener::bind(addr, config.direct_config()).await?;
    println!("Output directory: {}", output.display());
    println!("Listening on: {}", listener.local_addr()?);
    println!("Nonce: {nonce}");

    let mut handshake = HandshakeConfig::listener(version, nonce_auth(nonce, config));
    handshake.require_greeting = config.direct.require_greeting;
    let connection = listener.accept(handshake).await?;
    let peer = connection.peer_addr();
    tracing::info!(%peer, %version, "direct connection established");

    let session = MessageSession::new(peer.to_string(), config.session_config()?);
    let (accepted_tx, accepted) = crossbeam_channel::unbounded();
    session.add_handler(Arc::new(AcceptFiles::new(
        output,
        config.transfer_config(),
        accepted_tx,
    )));
    let transport = connection.attach(receiver_of(&session))?;
    session.set_direct_transport(Some(transport));

    let blocking_session = Arc::clone(&session);
    let receive = move || -> anyhow::Result<(PathBuf, TransferProgress)> {
        let offer = accepted
            .recv_timeout(ANSWER_TIMEOUT)
            .context("no file offered")?;
        println!(
            "Receiving {} ({})",
            offer.invitation.filename,
            format_bytes(offer.invitation.size)
        );

        let display = ProgressDisplay::new(offer.invitation.size, &offer.invitation.filename);
        let progress = watch(&offer.transfer, &offer.events, &display)?;

        let bye = signaling::bye(&peer.to_string(), &offer.invitation.call_id);
        blocking_session.send(Envelope::signaling(version, &bye))?;
        // Let the writer flush the goodbye before the socket goes away
        std::thread::sleep(Duration::from_millis(250));
        Ok((offer.path, progress))
    };
    let result = tokio::task::spawn_blocking(receive).await?;

    session.close();
    let (path, progress) = result?;
    println!("Saved {} ({})", path.display(), summary(&progress));
    Ok(())
}

/// Follow a transfer until it finishes, mirroring progress on `display`
fn watch(
    transfer: &Arc<TransferSession>,
    events: &Receiver<TransferEvent>,
    display: &ProgressDisplay,
) -> anyhow::Result<TransferProgress> {
    loop {
        match events.recv_timeout(IDLE_TIMEOUT) {
            Ok(TransferEvent::Progress(progress)) => display.update(&progress),
            Ok(TransferEvent::StateChanged(state)) => tracing::debug!(%state, "transfer state"),
            Ok(TransferEvent::Finished) => {
                let progress = transfer.progress();
                display.update(&progress);
                display.finish();
                return Ok(progress);
            }
            Ok(TransferEvent::Aborted) => {
                display.abandon("Transfer aborted".to_string());
                bail!("transfer aborted");
            }
            Err(RecvTimeoutError::Timeout) => {
                transfer.abort();
                display.abandon("Transfer stalled".to_string());
                bail!("no progress for {}s", IDLE_TIMEOUT.as_secs());
            }
            Err(RecvTimeoutError::Disconnected) => bail!("transfer went away"),
        }
    }
}
