// MQTT broker session: connect, last-will/retained-online handshake,
// publish, and reconnect-on-failure. Generalizes the teacher's
// `drivers/cloud.rs` MqttClient (AsyncClient + background-polled
// EventLoop) to add the gateway's LWT and teleperiod semantics (§4.H).

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};

use crate::config::MqttConfig;
use crate::kv::KvSink;

pub struct Broker {
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    topic_prefix: String,
    will_topic: String,
    connected: bool,
    pub reconnect_after: Duration,
}

impl Broker {
    pub fn new(config: &MqttConfig) -> Self {
        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keepalive as u64));
        opts.set_connection_timeout(config.connect_timeout_secs);
        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            opts.set_credentials(user.clone(), pass.clone());
        }

        let will_topic = format!("{}/LWT", config.topic);
        opts.set_last_will(LastWill::new(will_topic.clone(), "Offline", QoS::AtMostOnce, true));

        let (client, eventloop) = AsyncClient::new(opts, 64);

        Broker {
            client,
            eventloop,
            topic_prefix: config.topic.clone(),
            will_topic,
            connected: false,
            reconnect_after: Duration::from_secs(config.reconnect_timeout_secs),
        }
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Poll the underlying connection once. On `ConnAck`, publishes the
    /// retained "Online" message (the LWT's counterpart) and marks the
    /// session connected; on a connection error, marks it disconnected so
    /// the gateway's reconnect timer takes over.
    pub async fn poll(&mut self) -> Result<Event, rumqttc::ConnectionError> {
        match self.eventloop.poll().await {
            Ok(event) => {
                if let Event::Incoming(Packet::ConnAck(_)) = &event {
                    self.connected = true;
                    let will_topic = self.will_topic.clone();
                    let client = self.client.clone();
                    tokio::spawn(async move {
                        let _ = client.publish(will_topic, QoS::AtMostOnce, true, "Online").await;
                    });
                }
                Ok(event)
            }
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }
}

impl KvSink for Broker {
    fn publish(&mut self, topic: &str, payload: &str) {
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes()) {
            log::warn!("publish to {topic} failed: {e}");
            self.connected = false;
        }
    }
}
