/**
 * SESSION MQTT - Connexion unique au broker
 *
 * FONCTIONNEMENT :
 * - connect() attend le premier CONNACK (échec = fatal) puis s'abonne à `#`
 * - BrokerSession::run() boucle sur l'eventloop rumqttc et sur la file des
 *   publications demandées par l'API / le dispatcher
 * - chaque message entrant part sur un canal mpsc vers le worker d'ingestion
 * - re-subscribe à chaque CONNACK : aucune logique de replay
 *
 * PUBLICATION :
 * BrokerHandle::publish() attend l'acquittement local (événement
 * Outgoing::Publish émis par rumqttc), borné par publish_timeout_secs.
 * Une coupure réseau n'échoue pas les publications déjà confiées à rumqttc :
 * elles restent dans sa file et partent à la reconnexion.
 */

use crate::config::MqttConf;
use crate::error::{BridgeError, Result};
use crate::health::HealthTracker;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const SUBSCRIBE_ALL: &str = "#";

// Délai avant de relancer poll() après une erreur réseau
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: String,
    pub ack: oneshot::Sender<Result<()>>,
}

fn publish_failure(topic: &str, reason: impl Into<String>) -> BridgeError {
    BridgeError::Publish {
        topic: topic.to_string(),
        reason: reason.into(),
    }
}

/// Poignée clonable utilisée par l'API et le dispatcher pour publier
#[derive(Clone)]
pub struct BrokerHandle {
    requests: mpsc::Sender<PublishRequest>,
    timeout: Duration,
}

impl BrokerHandle {
    pub fn channel(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<PublishRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { requests: tx, timeout }, rx)
    }

    /// Publie en QoS 0 et attend l'acquittement local. Jamais rejoué.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let request = PublishRequest {
            topic: topic.to_string(),
            payload: payload.to_string(),
            ack: ack_tx,
        };

        let confirmed = async {
            self.requests
                .send(request)
                .await
                .map_err(|_| publish_failure(topic, "broker session is closed"))?;
            ack_rx
                .await
                .map_err(|_| publish_failure(topic, "broker session dropped the request"))?
        };

        match tokio::time::timeout(self.timeout, confirmed).await {
            Ok(Ok(())) => {
                info!("message '{payload}' was published to topic {topic}");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(publish_failure(
                topic,
                format!("no acknowledgment within {:?}", self.timeout),
            )),
        }
    }
}

/// Publications envoyées à rumqttc, en attente de leur événement Outgoing::Publish.
/// rumqttc traite les requêtes dans l'ordre, y compris celles rejouées après
/// reconnexion : la plus ancienne est confirmée en premier.
#[derive(Default)]
struct PendingAcks {
    queue: VecDeque<(String, oneshot::Sender<Result<()>>)>,
}

impl PendingAcks {
    fn track(&mut self, topic: String, ack: oneshot::Sender<Result<()>>) {
        self.queue.push_back((topic, ack));
    }

    fn confirm_next(&mut self) {
        match self.queue.pop_front() {
            // l'appelant a pu abandonner (timeout)
            Some((topic, ack)) => {
                debug!("publish to {topic} handed to the network");
                let _ = ack.send(Ok(()));
            }
            None => debug!("outgoing publish without a pending request"),
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

pub struct BrokerSession {
    client: AsyncClient,
    eventloop: EventLoop,
    requests: mpsc::Receiver<PublishRequest>,
    pending: PendingAcks,
}

/// Connexion initiale : toute erreur avant le premier CONNACK est fatale
pub async fn connect(cfg: &MqttConf) -> Result<(BrokerHandle, BrokerSession)> {
    let connect_failure = |reason: String| BridgeError::Connect {
        host: cfg.host.clone(),
        port: cfg.port,
        reason,
    };

    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    let (client, mut eventloop) = AsyncClient::new(opts, cfg.request_capacity);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                info!("connected to MQTT broker {}:{} ({:?})", cfg.host, cfg.port, ack.code);
                break;
            }
            Ok(_) => {}
            Err(e) => return Err(connect_failure(e.to_string())),
        }
    }

    client
        .subscribe(SUBSCRIBE_ALL, QoS::AtMostOnce)
        .await
        .map_err(|e| connect_failure(format!("subscribe failed: {e}")))?;

    let (handle, requests) = BrokerHandle::channel(
        cfg.request_capacity,
        Duration::from_secs(cfg.publish_timeout_secs),
    );
    let session = BrokerSession {
        client,
        eventloop,
        requests,
        pending: PendingAcks::default(),
    };
    Ok((handle, session))
}

impl BrokerSession {
    pub async fn run(mut self, inbound: mpsc::UnboundedSender<InboundMessage>, health: HealthTracker) {
        health.mark_mqtt_connected();

        loop {
            tokio::select! {
                Some(request) = self.requests.recv() => self.submit(request),
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let msg = InboundMessage { topic: p.topic.clone(), payload: p.payload.to_vec() };
                        if inbound.send(msg).is_err() {
                            warn!("ingest worker is gone, dropping message on {}", p.topic);
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("reconnected to MQTT broker, renewing subscription");
                        health.mark_mqtt_connected();
                        if let Err(e) = self.client.try_subscribe(SUBSCRIBE_ALL, QoS::AtMostOnce) {
                            error!("re-subscribe {SUBSCRIBE_ALL} failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        warn!("MQTT broker sent DISCONNECT");
                        health.mark_mqtt_disconnected();
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(_))) => self.pending.confirm_next(),
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {e}");
                        health.increment_reconnects();
                        // les requêtes déjà soumises restent dans la file rumqttc
                        if self.pending.len() > 0 {
                            warn!("{} publish(es) waiting for reconnection", self.pending.len());
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        }
    }

    fn submit(&mut self, request: PublishRequest) {
        let PublishRequest { topic, payload, ack } = request;
        match self
            .client
            .try_publish(topic.clone(), QoS::AtMostOnce, false, payload.into_bytes())
        {
            Ok(()) => self.pending.track(topic, ack),
            Err(e) => {
                let _ = ack.send(Err(publish_failure(&topic, e.to_string())));
            }
        }
    }
}

pub fn spawn_broker_session(
    session: BrokerSession,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    health: HealthTracker,
) -> JoinHandle<()> {
    tokio::spawn(session.run(inbound, health))
}
