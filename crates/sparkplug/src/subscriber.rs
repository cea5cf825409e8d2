//! MQTT intake task.
//!
//! Owns the broker connection and the alias cache: subscribes to birth
//! frames, decodes publishes, resolves aliases (requesting rebirths under a
//! per-key throttle), and forwards decoded frames into the bounded ingest
//! channel. Reconnects with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use sync_core::{DecodedFrame, Error, MessageType, Result};
use telemetry::{health, metrics};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alias::{AliasCache, AliasEntry, AliasResolution, RebirthThrottle};
use crate::config::BrokerConfig;
use crate::decode::{decode_frame, SparkplugTopic};

/// Reconnect backoff bounds.
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Long-lived Sparkplug subscriber task.
pub struct Subscriber {
    config: BrokerConfig,
    cache: Arc<AliasCache>,
    throttle: RebirthThrottle,
    tx: mpsc::Sender<DecodedFrame>,
    cancel: CancellationToken,
}

impl Subscriber {
    pub fn new(
        config: BrokerConfig,
        cache: Arc<AliasCache>,
        tx: mpsc::Sender<DecodedFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let throttle = RebirthThrottle::new(Duration::from_secs(config.rebirth_cooldown_seconds));
        Self {
            config,
            cache,
            throttle,
            tx,
            cancel,
        }
    }

    fn mqtt_options(&self) -> Result<MqttOptions> {
        if self.config.host.is_empty() {
            return Err(Error::config(
                "broker host is not configured; set broker.host",
            ));
        }
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        if !self.config.user.is_empty() || !self.config.password.is_empty() {
            options.set_credentials(self.config.user.clone(), self.config.password.clone());
        }
        if let Some(ca_path) = &self.config.tls_ca {
            let ca = std::fs::read(ca_path)?;
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }
        Ok(options)
    }

    /// Run until cancelled. The alias cache is snapshotted on exit so
    /// mappings survive restart.
    pub async fn run(self) -> Result<()> {
        let options = self.mqtt_options()?;
        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let mut backoff = RECONNECT_BASE;

        info!(
            host = %self.config.host,
            port = self.config.port,
            filter = %self.config.topic_filter,
            "sparkplug subscriber starting"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("sparkplug subscriber shutting down");
                    let _ = client.disconnect().await;
                    break;
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        health().broker.set_healthy();
                        backoff = RECONNECT_BASE;
                        self.subscribe(&client).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&client, &publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        health().broker.set_unhealthy(err.to_string());
                        warn!(error = %err, delay_ms = %backoff.as_millis(), "broker connection error; reconnecting");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                    }
                }
            }
        }

        if let Err(err) = self.cache.snapshot() {
            error!(error = %err, "failed to persist alias cache on shutdown");
        }
        Ok(())
    }

    async fn subscribe(&self, client: &AsyncClient) {
        let filters = [
            self.config.topic_filter.as_str(),
            self.config.nbirth_topic_filter.as_str(),
        ];
        for filter in filters {
            if let Err(err) = client.subscribe(filter, QoS::AtMostOnce).await {
                error!(filter = %filter, error = %err, "subscribe failed");
                return;
            }
        }
        info!(filters = ?filters, "subscribed to sparkplug birth topics");
    }

    async fn handle_publish(&self, client: &AsyncClient, topic: &str, payload: &[u8]) {
        metrics().frames_received.inc();

        let Some(parsed) = SparkplugTopic::parse(topic) else {
            debug!(topic = %topic, "ignoring non-sparkplug topic");
            return;
        };
        if parsed.message_type == MessageType::Unknown {
            metrics().frames_dropped.inc();
            return;
        }

        let mut frame = match decode_frame(&parsed, payload) {
            Ok(frame) => frame,
            Err(err) => {
                metrics().decode_errors.inc();
                warn!(topic = %topic, error = %err, "dropping undecodable frame");
                return;
            }
        };

        if frame.message_type.is_birth() {
            self.ingest_birth(&frame);
        }

        self.resolve_aliases(client, &mut frame).await;

        if self.tx.send(frame).await.is_err() {
            warn!("ingest channel closed; dropping frame");
        }
    }

    /// Record alias declarations from a birth frame and persist the cache.
    fn ingest_birth(&self, frame: &DecodedFrame) {
        let device = frame.alias_device();
        let mut recorded = 0usize;
        for metric in &frame.metrics {
            let (Some(alias), Some(name)) = (metric.alias, metric.name.as_deref()) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            self.cache.populate(
                &frame.group,
                &frame.edge,
                device,
                alias,
                AliasEntry {
                    name: name.to_string(),
                    datatype: metric.datatype.clone(),
                },
            );
            recorded += 1;
        }
        self.throttle.clear(&frame.group, &frame.edge, device);

        if recorded > 0 {
            // Write-through: every mutation schedules a snapshot.
            let cache = Arc::clone(&self.cache);
            tokio::task::spawn_blocking(move || {
                if let Err(err) = cache.snapshot() {
                    error!(error = %err, "alias cache snapshot failed");
                }
            });
        }
    }

    /// Fill in names for alias-only metrics; unresolved aliases trigger one
    /// throttled rebirth request per (group, edge, device).
    async fn resolve_aliases(&self, client: &AsyncClient, frame: &mut DecodedFrame) {
        let device = frame
            .alias_device()
            .map(str::to_string);
        let mut missing = false;

        for metric in &mut frame.metrics {
            if metric.name.is_some() {
                continue;
            }
            let Some(alias) = metric.alias else { continue };
            match self
                .cache
                .resolve(&frame.group, &frame.edge, device.as_deref(), alias)
            {
                AliasResolution::Known(name) => {
                    metric.name = Some(name);
                }
                AliasResolution::Missing => {
                    metrics().alias_misses.inc();
                    missing = true;
                }
            }
        }

        if missing && self.config.auto_request_rebirth {
            self.request_rebirth(client, &frame.group, &frame.edge, device.as_deref())
                .await;
        }
    }

    async fn request_rebirth(
        &self,
        client: &AsyncClient,
        group: &str,
        edge: &str,
        device: Option<&str>,
    ) {
        if !self.throttle.try_acquire(group, edge, device) {
            return;
        }
        let topic = format!("spBv1.0/{group}/{edge}/command/rebirth");
        info!(
            group = %group,
            edge = %edge,
            device = device.unwrap_or("*"),
            "requesting rebirth for unresolved alias"
        );
        if let Err(err) = client.publish(&topic, QoS::AtMostOnce, false, Vec::new()).await {
            warn!(topic = %topic, error = %err, "rebirth request publish failed");
        }
    }
}
