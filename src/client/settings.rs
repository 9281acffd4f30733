// ABOUTME: Client-side configuration: server endpoint, identity and player options
// ABOUTME: Validated at startup; bad values are Config errors, never runtime surprises

use crate::audio::format::SampleFormat;
use crate::transport::tls::TlsSettings;
use crate::transport::Endpoint;

/// Everything the client controller needs to run
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Server address, e.g. `tcp://10.0.0.2:1704` or `wss://music.local:1788`
    pub server: Endpoint,
    /// Certificate settings for TLS schemes
    pub tls: TlsSettings,
    /// MAC address reported in the Hello
    pub mac: String,
    /// Stable machine id; falls back to the MAC when empty
    pub host_id: String,
    /// Host name reported in the Hello
    pub hostname: String,
    /// Instance index, 1-based; lets several clients share one host
    pub instance: u32,
    /// Additional client-side latency in ms, subtracted from the buffer
    pub latency_ms: i64,
    /// Output format override; zero fields keep the stream values
    pub player_format: SampleFormat,
    /// Player backend name ("cpal" or "null")
    pub player: String,
    /// Optional credentials
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ClientSettings {
    /// Settings for `server` with everything else defaulted
    pub fn new(server: Endpoint) -> Self {
        ClientSettings {
            server,
            tls: TlsSettings::default(),
            mac: "00:00:00:00:00:00".into(),
            host_id: String::new(),
            hostname: hostname(),
            instance: 1,
            latency_ms: 0,
            player_format: SampleFormat::default(),
            player: "cpal".into(),
            username: None,
            password: None,
        }
    }

    /// The machine id used in the Hello
    pub fn id(&self) -> String {
        if self.host_id.is_empty() {
            self.mac.clone()
        } else {
            self.host_id.clone()
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".into())
}
