//! Console sink: render server events as lines on stdout.

use lantern_net::ServerEvent;
use tokio::sync::mpsc;

/// One line per event; `None` for events that only matter to the logs.
pub fn render(event: &ServerEvent) -> Option<String> {
    match event {
        ServerEvent::PeerConnected { peer, info } => Some(format!(
            "+ {peer} {} / {} ({} {})",
            info.device_name, info.app_name, info.os_name, info.os_version
        )),
        ServerEvent::PeerDisconnected { peer } => Some(format!("- {peer}")),
        ServerEvent::LogEvent { peer, event } => Some(format!("{peer} {event}")),
        ServerEvent::NetworkLogEvent { peer, event } => Some(format!("{peer} net {event}")),
        ServerEvent::ProtocolViolation { peer, code } => {
            Some(format!("! {peer} unexpected {code:?}"))
        }
        ServerEvent::ParseFailed { peer, error, .. } => Some(format!("! {peer} {error}")),
        ServerEvent::SendFailed { .. } => None,
    }
}

pub async fn run(mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = render(&event) {
            println!("{line}");
        }
    }
}
