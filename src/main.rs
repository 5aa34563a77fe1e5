use callcore::types::{Gender, Location};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use matchcall::location::FixedLocation;
use matchcall::media::SampleTrackSource;
use matchcall::webrtc::WebRtcPeerConnector;
use matchcall::{CallSessionController, ClientConfig, StaticCredentials};
use matchcall_tokio_transport::TokioWebSocketTransportFactory;
use matchcall_ureq_http_client::UreqHttpClient;
use std::sync::Arc;

// A headless client that joins one random call and logs what happens.
//
// Usage:
//   cargo run -- --token <jwt> --gender F
//   cargo run -- --token <jwt> --gender M --latitude 37.56 --longitude 126.97
//   MATCHCALL_TOKEN=<jwt> cargo run -- -g F --api-url http://10.0.0.2:8000

#[derive(Debug, Parser)]
#[command(about = "Joins a random video call")]
struct Args {
    /// Gender to be matched with (M or F).
    #[arg(short, long)]
    gender: Gender,

    /// Bearer token for the matching API and signaling server.
    #[arg(short, long, env = "MATCHCALL_TOKEN")]
    token: String,

    #[arg(long, requires = "longitude")]
    latitude: Option<f64>,

    #[arg(long, requires = "latitude")]
    longitude: Option<f64>,

    #[arg(long, env = "MATCHCALL_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "MATCHCALL_WS_URL")]
    ws_url: Option<String>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(run(args));
}

async fn run(args: Args) {
    let mut config = ClientConfig::from_env();
    if let Some(url) = &args.api_url {
        config = config.with_api_base_url(url);
    }
    if let Some(url) = &args.ws_url {
        config = config.with_ws_base_url(url);
    }
    info!("Matching API: {}, signaling: {}", config.api_base_url, config.ws_base_url);

    let location = args
        .latitude
        .zip(args.longitude)
        .map(|(latitude, longitude)| Location {
            latitude,
            longitude,
        });

    let mut builder = CallSessionController::builder()
        .with_http_client(UreqHttpClient::with_timeout(config.request_timeout))
        .with_transport_factory(TokioWebSocketTransportFactory::new())
        .with_peer_connector(WebRtcPeerConnector::new(config.ice_servers.clone()))
        .with_media_source(SampleTrackSource::default())
        .with_credentials(Arc::new(StaticCredentials::new(args.token)))
        .with_config(config);
    if let Some(location) = location {
        builder = builder.with_location_provider(FixedLocation(location));
    }

    let controller = match builder.build() {
        Ok(controller) => controller,
        Err(e) => {
            error!("Failed to build controller: {e}");
            return;
        }
    };

    let mut state_rx = controller.event_bus.state.subscribe();
    let mut notice_rx = controller.event_bus.notice.subscribe();
    let mut error_rx = controller.event_bus.error.subscribe();
    let mut media_rx = controller.event_bus.remote_media.subscribe();

    controller
        .start_matching(args.gender, location.is_some())
        .await;
    if let Some(e) = controller.last_error().await {
        error!("Could not start matching: {e}");
        controller.shutdown().await;
        return;
    }

    loop {
        tokio::select! {
            Ok(view) = state_rx.recv() => {
                info!(
                    "State: matching={} connected={} session={:?} peer={:?}",
                    view.matching, view.connected, view.session_id, view.peer_id
                );
                if !view.matching && !view.connected && view.session_id.is_none() {
                    info!("Session over");
                    break;
                }
            }
            Ok(notice) = notice_rx.recv() => info!("Notice: {notice:?}"),
            Ok(err) = error_rx.recv() => warn!("Error: {err}"),
            Ok(change) = media_rx.recv() => match &change.media {
                Some(media) => info!("Remote media: {} track(s)", media.tracks.len()),
                None => info!("Remote media cleared"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                break;
            }
        }
    }

    controller.shutdown().await;
}
