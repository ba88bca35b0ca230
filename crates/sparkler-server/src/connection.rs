use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use sparkler_engine::Sparkler;
use sparkler_types::events::{GatewayCommand, GatewayEvent};
use sparkler_types::models::{ParticipantId, RoomId};

/// Server sends a Ping every 15 seconds; two missed Pongs drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOX_CAPACITY: usize = 256;

type Subscriptions = Arc<RwLock<HashSet<RoomId>>>;

/// Handle one gateway connection: Identify handshake, then the event loop.
pub async fn handle_connection(socket: WebSocket, sparkler: Sparkler) {
    let (mut sender, mut receiver) = socket.split();

    let Some(participant) = wait_for_identify(&mut receiver).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    info!("{} connected to gateway", participant);

    let ready = GatewayEvent::Ready {
        participant_id: participant.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, sparkler, participant).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    sparkler: Sparkler,
    participant: ParticipantId,
) {
    // Events produced by this connection's own watches
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<GatewayEvent>(OUTBOX_CAPACITY);

    // Session events for every room; filtered by this connection's subscriptions
    let mut session_rx = sparkler.dispatcher().subscribe();

    let subscriptions: Subscriptions = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = session_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            warn!("Session event receiver lagged by {} events", n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    let subscribed = event.room_id().is_some_and(|room_id| {
                        send_subscriptions
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .contains(room_id)
                    });
                    if !subscribed {
                        continue;
                    }

                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                event = outbox_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_participant = participant.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut watches = Watches::new(sparkler, recv_participant, outbox_tx, subscriptions);

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => watches.handle_command(cmd).await,
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            watches.participant,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        watches
                            .reply(GatewayEvent::Error {
                                code: "bad_command".into(),
                                message: e.to_string(),
                            })
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        // Dropping `watches` aborts every stream task it spawned
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} disconnected from gateway", participant);
}

/// Per-connection stream forwarders: one match watch and one message
/// subscription per room.
struct Watches {
    sparkler: Sparkler,
    participant: ParticipantId,
    outbox: mpsc::Sender<GatewayEvent>,
    subscriptions: Subscriptions,
    tasks: JoinSet<()>,
    match_watch: Option<AbortHandle>,
    rooms: HashMap<RoomId, AbortHandle>,
}

impl Watches {
    fn new(
        sparkler: Sparkler,
        participant: ParticipantId,
        outbox: mpsc::Sender<GatewayEvent>,
        subscriptions: Subscriptions,
    ) -> Self {
        Self {
            sparkler,
            participant,
            outbox,
            subscriptions,
            tasks: JoinSet::new(),
            match_watch: None,
            rooms: HashMap::new(),
        }
    }

    async fn reply(&self, event: GatewayEvent) {
        let _ = self.outbox.send(event).await;
    }

    async fn handle_command(&mut self, cmd: GatewayCommand) {
        // Reap finished forwarders
        while self.tasks.try_join_next().is_some() {}

        match cmd {
            GatewayCommand::Identify { .. } => {} // Already handled

            GatewayCommand::WatchMatch => {
                debug!("{} watching for a match", self.participant);
                if let Some(previous) = self.match_watch.take() {
                    previous.abort();
                }

                let stream = self.sparkler.subscribe_to_match(&self.participant);
                let outbox = self.outbox.clone();
                let handle = self.tasks.spawn(async move {
                    let mut stream = std::pin::pin!(stream);
                    while let Some(created) = stream.next().await {
                        if outbox.send(GatewayEvent::RoomCreated(created)).await.is_err() {
                            break;
                        }
                    }
                });
                self.match_watch = Some(handle);
            }

            GatewayCommand::Subscribe { room_id, after } => {
                let snapshot = match self.sparkler.session(&room_id).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.reply(GatewayEvent::Error {
                            code: e.code().into(),
                            message: e.to_string(),
                        })
                        .await;
                        return;
                    }
                };
                if !snapshot.participants.contains(&self.participant) {
                    self.reply(GatewayEvent::Error {
                        code: "not_participant".into(),
                        message: format!("{} is not part of room {}", self.participant, room_id),
                    })
                    .await;
                    return;
                }

                info!("{} subscribing to {}", self.participant, room_id);
                self.subscriptions
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(room_id.clone());

                if let Some(previous) = self.rooms.remove(&room_id) {
                    previous.abort();
                }
                let stream = self
                    .sparkler
                    .subscribe_to_room(&room_id, after.unwrap_or(0));
                let outbox = self.outbox.clone();
                let handle = self.tasks.spawn(async move {
                    let mut stream = std::pin::pin!(stream);
                    while let Some(message) = stream.next().await {
                        if outbox.send(GatewayEvent::MessageCreate(message)).await.is_err() {
                            break;
                        }
                    }
                });
                self.rooms.insert(room_id, handle);

                // Current timers right away, rather than at the next tick
                self.reply(GatewayEvent::TimerUpdate {
                    room_id: snapshot.room_id,
                    timers: [snapshot.timers[0].view(), snapshot.timers[1].view()],
                })
                .await;
            }

            GatewayCommand::ReportTilt { room_id, tilt } => {
                if let Err(e) = self
                    .sparkler
                    .report_tilt(&room_id, &self.participant, tilt)
                    .await
                {
                    self.reply(GatewayEvent::Error {
                        code: e.code().into(),
                        message: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>) -> Option<ParticipantId> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { participant_id }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    if participant_id.is_valid() {
                        return Some(participant_id);
                    }
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify)
        .await
        .ok()
        .flatten()
}
