//! Headless mesh participant: joins a session, negotiates with every other
//! member and logs what happens.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use meshcall::registry::{Membership, SessionRegistry};
use meshcall::rtc::{
    IceServer, LocalTrack, ManagerConfig, ManagerHandlers, PeerConnectionManager, RemoteTrack,
    RtcConfig, TrackKind, WebRtcEngine,
};
use meshcall::signaling::{ClientConfig, PeerId, SessionId};
use tracing::{info, warn};

const SILENT_FRAME_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "meshcall-peer", about = "Join a meshcall session from the command line")]
struct Args {
    /// Signaling endpoint.
    #[arg(long, env = "MESHCALL_SERVER", default_value = "ws://127.0.0.1:8080/ws")]
    server: String,

    /// Session to join. A new session id is created when omitted.
    #[arg(long)]
    session: Option<String>,

    #[arg(long)]
    username: Option<String>,

    /// STUN server URL; repeat for more. Defaults to Google's public servers.
    #[arg(long = "stun")]
    stun: Vec<String>,

    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Give up on an unanswered offer after this many seconds; 0 waits forever.
    #[arg(long, default_value_t = 30)]
    negotiation_timeout_secs: u64,

    /// Publish a silent audio track and a blank video track.
    #[arg(long)]
    tracks: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall=info,meshcall_peer=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut membership = match &args.session {
        Some(session) => Membership::generate(SessionId::from(session.as_str())),
        None => SessionRegistry::new().create_session().await,
    };
    if let Some(username) = args.username.clone() {
        membership.username = username;
    }
    info!(
        "Joining session {} as {} ({})",
        membership.session_id, membership.username, membership.peer_id
    );

    let rtc_config = if args.stun.is_empty() {
        RtcConfig::default()
    } else {
        RtcConfig {
            ice_servers: args.stun.iter().map(|url| IceServer::stun(url.as_str())).collect(),
        }
    };
    let engine = Arc::new(WebRtcEngine::new(&rtc_config)?);

    let client_config = ClientConfig {
        url: args.server.clone(),
        connect_timeout: Duration::from_secs(args.connect_timeout_secs.max(1)),
    };
    let manager_config = ManagerConfig {
        negotiation_timeout: match args.negotiation_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    };
    let handlers = ManagerHandlers {
        on_remote_track: Some(Arc::new(|peer_id: PeerId, track: RemoteTrack| {
            info!("Remote {:?} track {} from {}", track.kind, track.id, peer_id);
        })),
        on_peer_disconnect: Some(Arc::new(|peer_id: PeerId| {
            info!("Peer {} disconnected", peer_id);
        })),
    };
    let (client, manager) = PeerConnectionManager::connect(
        &client_config,
        membership,
        engine,
        manager_config,
        handlers,
    )
    .await?;

    if args.tracks {
        for track in [
            LocalTrack::new(TrackKind::Audio, "audio", "meshcall"),
            LocalTrack::new(TrackKind::Video, "video", "meshcall"),
        ] {
            manager.add_local_track(track.clone()).await;
            tokio::spawn(write_silence(track));
        }
    }

    tokio::signal::ctrl_c().await?;

    info!("Leaving session {}", client.session_id());
    manager.close().await;
    client.disconnect();
    Ok(())
}

/// Keep a track flowing with empty samples until writes start failing.
async fn write_silence(track: LocalTrack) {
    let mut interval = tokio::time::interval(SILENT_FRAME_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = track
            .write_sample(Bytes::from_static(&[0u8; 3]), SILENT_FRAME_INTERVAL)
            .await
        {
            warn!("Stopped writing {} track: {}", track.kind(), e);
            break;
        }
    }
}
