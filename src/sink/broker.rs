//! MQTT broker sink.
//!
//! Each delivery opens a fresh session, publishes every reading of the batch
//! with QoS 1 on `<topic_prefix>/<id>` and waits for one PUBACK per message.
//! The batch is acknowledged only when every PUBACK arrived in time.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tracing::debug;

use super::{PayloadMode, Sink, SinkError};
use crate::config::BrokerSinkConfig;
use crate::reading::{Reading, ReadingId};

/// Time allowed for the DISCONNECT packet to leave after a successful batch.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Sink publishing readings to an MQTT broker.
#[derive(Debug, Clone)]
pub struct BrokerSink {
    host: String,
    port: u16,
    tls: bool,
    credentials: Option<(String, String)>,
    topic_prefix: String,
    client_id: String,
    keep_alive: Duration,
    payload: PayloadMode,
    timeout: Duration,
}

impl BrokerSink {
    /// Create a broker sink. `station_id` seeds the default client id.
    pub fn new(
        config: &BrokerSinkConfig,
        station_id: &str,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let host = strip_scheme(&config.host).to_string();
        if host.is_empty() {
            return Err(SinkError::Config(format!(
                "broker sink '{}' has an empty host",
                config.name
            )));
        }

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("pub_{}", station_id));

        Ok(Self {
            host,
            port: config.port,
            tls: config.tls,
            credentials,
            topic_prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            client_id,
            keep_alive: Duration::from_secs(config.keep_alive_secs.max(5)),
            payload: config.payload,
            timeout,
        })
    }

    /// Host name without any URL scheme.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Topic a reading is published on.
    pub fn topic_for(&self, id: ReadingId) -> String {
        format!("{}/{}", self.topic_prefix, id)
    }

    fn options(&self) -> MqttOptions {
        // Unique per session so overlapping sessions never kick each other
        let session = uuid::Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", self.client_id, &session[..8]);

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user.clone(), pass.clone());
        }
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

/// Strip a URL scheme some operators put in front of broker host names.
pub(crate) fn strip_scheme(host: &str) -> &str {
    ["mqtts://", "mqtt://", "https://", "http://"]
        .iter()
        .find_map(|scheme| host.strip_prefix(scheme))
        .unwrap_or(host)
        .trim_end_matches('/')
}

fn connection_error(err: ConnectionError) -> SinkError {
    match err {
        ConnectionError::ConnectionRefused(code) => SinkError::Rejected {
            status: None,
            reason: format!("connection refused: {:?}", code),
        },
        other => SinkError::Unreachable(other.to_string()),
    }
}

/// Drive the event loop until `expected` PUBACKs have been received.
async fn await_acks(eventloop: &mut EventLoop, expected: usize) -> Result<(), SinkError> {
    let mut acked = 0;
    while acked < expected {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                acked += 1;
                debug!(pkid = ack.pkid, acked = acked, expected = expected, "PUBACK");
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("Connected to broker");
            }
            Ok(_) => {}
            Err(e) => return Err(connection_error(e)),
        }
    }
    Ok(())
}

#[async_trait]
impl Sink for BrokerSink {
    async fn deliver(&self, batch: &[Reading]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let messages = batch
            .iter()
            .map(|r| Ok((self.topic_for(r.id), self.payload.encode_message(r)?)))
            .collect::<Result<Vec<_>, SinkError>>()?;

        let (client, mut eventloop) = AsyncClient::new(self.options(), messages.len() + 1);

        for (topic, body) in messages {
            client
                .publish(topic, QoS::AtLeastOnce, false, body)
                .await
                .map_err(|e| SinkError::Unreachable(e.to_string()))?;
        }

        match tokio::time::timeout(self.timeout, await_acks(&mut eventloop, batch.len())).await {
            Ok(Ok(())) => {
                if client.try_disconnect().is_ok() {
                    let _ = tokio::time::timeout(DISCONNECT_GRACE, eventloop.poll()).await;
                }
                debug!(
                    host = %self.host,
                    messages = batch.len(),
                    "Broker acknowledged batch"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SinkError::Timeout(self.timeout)),
        }
    }
}
