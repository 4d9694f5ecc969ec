//! Pure session option building for the MQTT binding
//!
//! Turns [`ConnectionParams`] into `rumqttc` options. Nothing here touches the
//! network, so malformed parameters surface as synchronous
//! [`BrokerError::InvalidParams`] at session creation.

use crate::broker::{BrokerError, ConnectionParams};
use rumqttc::{MqttOptions, Transport};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Tunables of the MQTT binding that are not part of the connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSessionSettings {
    pub keep_alive: Duration,
    /// `false` keeps a durable broker-side session so queued deliveries survive
    /// client restarts
    pub clean_session: bool,
    /// Request channel capacity between client handle and event loop. Acks wait
    /// for room instead of failing when it is full.
    pub channel_capacity: usize,
}

impl Default for MqttSessionSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            clean_session: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Host, port and transport security parsed from an endpoint URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://` (plain) and `tcps://`, `mqtts://`, `ssl://` (TLS) URLs
pub fn parse_endpoint(url: &str) -> Result<BrokerEndpoint, BrokerError> {
    let parsed =
        Url::parse(url).map_err(|e| BrokerError::InvalidParams(format!("url '{url}': {e}")))?;

    let tls = match parsed.scheme() {
        "tcp" | "mqtt" => false,
        "tcps" | "mqtts" | "ssl" => true,
        other => {
            return Err(BrokerError::InvalidParams(format!(
                "unsupported scheme '{other}' in '{url}', expected tcp://, tcps://, mqtt:// or mqtts://"
            )))
        }
    };

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BrokerError::InvalidParams(format!("url '{url}' has no host")))?;
    let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Stable client id so the broker resumes the same durable session after a restart
pub fn client_id(params: &ConnectionParams) -> String {
    let raw = format!("queue-consumer-{}-{}", params.vpn, params.username);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn configure_mqtt_options(
    params: &ConnectionParams,
    settings: &MqttSessionSettings,
) -> Result<MqttOptions, BrokerError> {
    if params.username.is_empty() {
        return Err(BrokerError::InvalidParams("username is empty".to_string()));
    }

    let endpoint = parse_endpoint(&params.url)?;
    let mut options = MqttOptions::new(client_id(params), endpoint.host, endpoint.port);

    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    options.set_credentials(params.username.clone(), params.password.clone());
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(settings.clean_session);
    // Deliveries are confirmed by the consumer, never by the event loop.
    options.set_manual_acks(true);

    Ok(options)
}
