use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::Notify;

struct TestStream {
    stopped: AtomicBool,
}

impl MediaStream for TestStream {
    fn stop_tracks(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct TestMedia {
    deny: bool,
    streams: StdMutex<Vec<Arc<TestStream>>>,
    gate: StdMutex<Option<Arc<Notify>>>,
}

impl TestMedia {
    fn new(deny: bool) -> Arc<Self> {
        Arc::new(Self {
            deny,
            streams: StdMutex::new(Vec::new()),
            gate: StdMutex::new(None),
        })
    }

    /// Makes `open_stream` block until the gate is notified, to hold a call
    /// inside its media setup window.
    fn hold_open_stream(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().expect("lock") = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl MediaDevices for TestMedia {
    async fn request_permission(&self, _kind: CallKind) -> Result<(), PermissionError> {
        if self.deny {
            Err(PermissionError::Denied)
        } else {
            Ok(())
        }
    }

    async fn open_stream(&self, _kind: CallKind) -> Result<Arc<dyn MediaStream>> {
        let gate = self.gate.lock().expect("lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let stream = Arc::new(TestStream {
            stopped: AtomicBool::new(false),
        });
        self.streams.lock().expect("lock").push(Arc::clone(&stream));
        Ok(stream)
    }
}

struct TestPeer {
    ops: StdMutex<Vec<String>>,
    candidates: StdMutex<Vec<IceCandidatePayload>>,
    closed: AtomicBool,
}

impl TestPeer {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PeerConnection for TestPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ops.lock().expect("lock").push("create_offer".to_string());
        Ok(SessionDescription {
            sdp_type: "offer".to_string(),
            sdp: "v=0 offer".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ops.lock().expect("lock").push("create_answer".to_string());
        Ok(SessionDescription {
            sdp_type: "answer".to_string(),
            sdp: "v=0 answer".to_string(),
        })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<()> {
        self.ops
            .lock()
            .expect("lock")
            .push("set_local_description".to_string());
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
        self.ops
            .lock()
            .expect("lock")
            .push("set_remote_description".to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        self.candidates.lock().expect("lock").push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TestPeerFactory {
    peers: StdMutex<Vec<Arc<TestPeer>>>,
}

impl TestPeerFactory {
    fn latest(&self) -> Arc<TestPeer> {
        self.peers
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .expect("a peer connection was created")
    }
}

#[async_trait]
impl PeerConnectionFactory for TestPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(TestPeer {
            ops: StdMutex::new(Vec::new()),
            candidates: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().expect("lock").push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Default)]
struct TestSignals {
    sent: StdMutex<Vec<(UserId, CallSignal)>>,
}

impl TestSignals {
    fn sent(&self) -> Vec<(UserId, CallSignal)> {
        self.sent.lock().expect("lock").clone()
    }

    fn count_ends(&self) -> usize {
        self.sent()
            .iter()
            .filter(|(_, signal)| matches!(signal, CallSignal::End { .. }))
            .count()
    }
}

#[async_trait]
impl CallSignalSender for TestSignals {
    async fn send(&self, to: UserId, signal: CallSignal) -> Result<()> {
        self.sent.lock().expect("lock").push((to, signal));
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<CallOrchestrator>,
    media: Arc<TestMedia>,
    peers: Arc<TestPeerFactory>,
    signals: Arc<TestSignals>,
    events: broadcast::Receiver<SessionEvent>,
}

fn harness_with(config: CallConfig, deny_permission: bool) -> Harness {
    let media = TestMedia::new(deny_permission);
    let peers = Arc::new(TestPeerFactory::default());
    let signals = Arc::new(TestSignals::default());
    let (sender, events) = broadcast::channel(256);
    let orchestrator = CallOrchestrator::new(
        Arc::clone(&media) as Arc<dyn MediaDevices>,
        Arc::clone(&peers) as Arc<dyn PeerConnectionFactory>,
        Arc::clone(&signals) as Arc<dyn CallSignalSender>,
        config,
        sender,
    );
    Harness {
        orchestrator,
        media,
        peers,
        signals,
        events,
    }
}

fn harness() -> Harness {
    harness_with(CallConfig::default(), false)
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn candidate(n: u32) -> IceCandidatePayload {
    IceCandidatePayload {
        candidate: format!("candidate:{n}"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn remote_offer() -> SessionDescription {
    SessionDescription {
        sdp_type: "offer".to_string(),
        sdp: "v=0 remote offer".to_string(),
    }
}

const CONVERSATION: ConversationId = ConversationId(1);
const PEER: UserId = UserId(2);

async fn ring_as_callee(h: &Harness) {
    h.orchestrator
        .handle_incoming(PEER, CONVERSATION, CallKind::Audio)
        .await
        .expect("incoming invite");
}

async fn connect_as_callee(h: &Harness) {
    ring_as_callee(h).await;
    h.orchestrator
        .handle_signal(
            PEER,
            CallSignal::Offer {
                conversation_id: CONVERSATION,
                description: remote_offer(),
            },
        )
        .await;
    h.orchestrator.accept().await.expect("accept");
}

#[tokio::test]
async fn initiate_rings_and_sends_the_invite() {
    let h = harness();
    h.orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Video)
        .await
        .expect("initiate");

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Ringing);
    assert_eq!(snapshot.role, Some(CallRole::Caller));
    assert_eq!(snapshot.kind, Some(CallKind::Video));
    assert_eq!(snapshot.remote_peer, Some(PEER));

    let sent = h.signals.sent();
    assert!(matches!(
        sent.as_slice(),
        [(to, CallSignal::Initiate { kind: CallKind::Video, .. })] if *to == PEER
    ));
}

#[tokio::test]
async fn initiate_while_busy_is_rejected() {
    let h = harness();
    h.orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Audio)
        .await
        .expect("initiate");

    let err = h
        .orchestrator
        .initiate(ConversationId(9), UserId(5), CallKind::Audio)
        .await
        .expect_err("second dial must fail");
    assert!(matches!(err, CallError::InvalidState { .. }));
}

#[tokio::test]
async fn permission_denial_keeps_the_call_ringing_with_a_flag() {
    let h = harness_with(CallConfig::default(), true);
    let err = h
        .orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Audio)
        .await
        .expect_err("permission must be denied");
    assert!(matches!(err, CallError::PermissionDenied));

    // The session does not reset; the user can retry without re-dialing.
    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Ringing);
    assert!(snapshot.permission_denied);
}

#[tokio::test(start_paused = true)]
async fn unanswered_ring_times_out() {
    let mut h = harness();
    h.orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Audio)
        .await
        .expect("initiate");

    tokio::time::sleep(Duration::from_secs(61)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Idle);
    assert_eq!(h.signals.count_ends(), 1);
    assert!(drain(&mut h.events).iter().any(|event| matches!(
        event,
        SessionEvent::CallEnded {
            reason: CallEndReason::Timeout
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn answered_call_outlives_the_ring_timer() {
    let h = harness();
    connect_as_callee(&h).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The stale timer from the ring phase must not end the live call.
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Active);
    assert_eq!(h.signals.count_ends(), 0);
}

#[tokio::test]
async fn conflicting_invite_gets_a_busy_reply() {
    let h = harness();
    ring_as_callee(&h).await;

    h.orchestrator
        .handle_incoming(UserId(9), ConversationId(77), CallKind::Audio)
        .await
        .expect("conflicting invite");

    let sent = h.signals.sent();
    assert!(matches!(
        sent.as_slice(),
        [(to, CallSignal::Busy { conversation_id })]
            if *to == UserId(9) && *conversation_id == ConversationId(77)
    ));
    // The current call is undisturbed.
    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Ringing);
    assert_eq!(snapshot.remote_peer, Some(PEER));
}

#[tokio::test]
async fn duplicate_invite_is_ignored() {
    let h = harness();
    ring_as_callee(&h).await;
    ring_as_callee(&h).await;

    assert!(h.signals.sent().is_empty());
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Ringing);
}

#[tokio::test]
async fn accept_applies_the_buffered_offer() {
    let h = harness();
    connect_as_callee(&h).await;

    let peer = h.peers.latest();
    assert_eq!(
        peer.ops(),
        vec![
            "set_remote_description".to_string(),
            "create_answer".to_string(),
            "set_local_description".to_string(),
        ]
    );
    let sent = h.signals.sent();
    assert!(sent
        .iter()
        .any(|(to, signal)| *to == PEER && matches!(signal, CallSignal::Accept { .. })));
    assert!(sent
        .iter()
        .any(|(to, signal)| *to == PEER && matches!(signal, CallSignal::Answer { .. })));
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Active);
}

#[tokio::test]
async fn offer_arriving_after_accept_applies_directly() {
    let h = harness();
    ring_as_callee(&h).await;
    h.orchestrator.accept().await.expect("accept");
    assert_eq!(
        h.orchestrator.snapshot().await.status,
        CallStatus::Connecting
    );

    h.orchestrator
        .handle_signal(
            PEER,
            CallSignal::Offer {
                conversation_id: CONVERSATION,
                description: remote_offer(),
            },
        )
        .await;

    let peer = h.peers.latest();
    assert_eq!(
        peer.ops()
            .iter()
            .filter(|op| *op == "set_remote_description")
            .count(),
        1
    );
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Active);
}

#[tokio::test]
async fn candidates_queue_until_the_remote_description_is_applied() {
    let h = harness();
    ring_as_callee(&h).await;

    for n in 1..=2 {
        h.orchestrator
            .handle_signal(
                PEER,
                CallSignal::IceCandidate {
                    conversation_id: CONVERSATION,
                    candidate: candidate(n),
                },
            )
            .await;
    }
    h.orchestrator
        .handle_signal(
            PEER,
            CallSignal::Offer {
                conversation_id: CONVERSATION,
                description: remote_offer(),
            },
        )
        .await;
    h.orchestrator.accept().await.expect("accept");
    h.orchestrator
        .handle_signal(
            PEER,
            CallSignal::IceCandidate {
                conversation_id: CONVERSATION,
                candidate: candidate(3),
            },
        )
        .await;

    let applied: Vec<String> = h
        .peers
        .latest()
        .candidates
        .lock()
        .expect("lock")
        .iter()
        .map(|c| c.candidate.clone())
        .collect();
    assert_eq!(applied, vec!["candidate:1", "candidate:2", "candidate:3"]);
}

#[tokio::test]
async fn remote_accept_drives_the_caller_offer() {
    let h = harness();
    h.orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Audio)
        .await
        .expect("initiate");
    h.orchestrator
        .handle_signal(PEER, CallSignal::Accept { conversation_id: CONVERSATION })
        .await;

    assert_eq!(
        h.peers.latest().ops(),
        vec!["create_offer".to_string(), "set_local_description".to_string()]
    );
    assert!(h
        .signals
        .sent()
        .iter()
        .any(|(to, signal)| *to == PEER && matches!(signal, CallSignal::Offer { .. })));

    h.orchestrator
        .handle_signal(
            PEER,
            CallSignal::Answer {
                conversation_id: CONVERSATION,
                description: SessionDescription {
                    sdp_type: "answer".to_string(),
                    sdp: "v=0 remote answer".to_string(),
                },
            },
        )
        .await;
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Active);
}

#[tokio::test]
async fn busy_inside_the_grace_window_is_ignored() {
    let h = harness_with(
        CallConfig {
            ring_timeout: Duration::from_secs(60),
            busy_grace: Duration::from_secs(5),
        },
        false,
    );
    h.orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Audio)
        .await
        .expect("initiate");

    // Mutual-dial race: the stale busy lands right after ring start.
    h.orchestrator
        .handle_signal(PEER, CallSignal::Busy { conversation_id: CONVERSATION })
        .await;
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Ringing);
}

#[tokio::test]
async fn busy_after_the_grace_window_ends_the_call() {
    let mut h = harness_with(
        CallConfig {
            ring_timeout: Duration::from_secs(60),
            busy_grace: Duration::ZERO,
        },
        false,
    );
    h.orchestrator
        .initiate(CONVERSATION, PEER, CallKind::Audio)
        .await
        .expect("initiate");

    h.orchestrator
        .handle_signal(PEER, CallSignal::Busy { conversation_id: CONVERSATION })
        .await;

    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Idle);
    assert!(drain(&mut h.events).iter().any(|event| matches!(
        event,
        SessionEvent::CallEnded {
            reason: CallEndReason::Busy
        }
    )));
}

#[tokio::test]
async fn reject_signals_the_caller_and_resets() {
    let mut h = harness();
    ring_as_callee(&h).await;
    h.orchestrator.reject().await.expect("reject");

    assert!(h
        .signals
        .sent()
        .iter()
        .any(|(to, signal)| *to == PEER && matches!(signal, CallSignal::Reject { .. })));
    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Idle);
    assert_eq!(snapshot.remote_peer, None);
    assert!(drain(&mut h.events).iter().any(|event| matches!(
        event,
        SessionEvent::CallEnded {
            reason: CallEndReason::Rejected
        }
    )));
}

#[tokio::test]
async fn reject_while_active_still_tears_down() {
    let mut h = harness();
    connect_as_callee(&h).await;

    h.orchestrator.reject().await.expect("reject");

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Idle);
    assert_eq!(snapshot.remote_peer, None);
    assert!(h.peers.latest().closed.load(Ordering::SeqCst));
    assert!(drain(&mut h.events).iter().any(|event| matches!(
        event,
        SessionEvent::CallEnded {
            reason: CallEndReason::Rejected
        }
    )));
}

#[tokio::test]
async fn remote_reject_while_connecting_tears_down() {
    let mut h = harness();
    ring_as_callee(&h).await;
    h.orchestrator.accept().await.expect("accept");
    assert_eq!(
        h.orchestrator.snapshot().await.status,
        CallStatus::Connecting
    );

    h.orchestrator
        .handle_signal(PEER, CallSignal::Reject { conversation_id: CONVERSATION })
        .await;

    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Idle);
    assert!(drain(&mut h.events).iter().any(|event| matches!(
        event,
        SessionEvent::CallEnded {
            reason: CallEndReason::Rejected
        }
    )));
}

#[tokio::test]
async fn offer_racing_the_media_setup_is_not_lost() {
    let h = harness();
    let gate = h.media.hold_open_stream();
    ring_as_callee(&h).await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let accepting = tokio::spawn(async move { orchestrator.accept().await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        h.orchestrator.snapshot().await.status,
        CallStatus::Connecting
    );

    // The offer lands while accept is still blocked opening the stream.
    h.orchestrator
        .handle_signal(
            PEER,
            CallSignal::Offer {
                conversation_id: CONVERSATION,
                description: remote_offer(),
            },
        )
        .await;

    gate.notify_one();
    accepting.await.expect("join").expect("accept");

    let peer = h.peers.latest();
    assert_eq!(
        peer.ops()
            .iter()
            .filter(|op| *op == "set_remote_description")
            .count(),
        1
    );
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Active);
}

#[tokio::test]
async fn end_releases_media_and_is_idempotent() {
    let mut h = harness();
    connect_as_callee(&h).await;

    h.orchestrator.end().await.expect("end");
    h.orchestrator.end().await.expect("second end");

    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Idle);
    assert!(h.media.streams.lock().expect("lock")[0]
        .stopped
        .load(Ordering::SeqCst));
    assert!(h.peers.latest().closed.load(Ordering::SeqCst));
    assert_eq!(h.signals.count_ends(), 1);
    let ended = drain(&mut h.events)
        .iter()
        .filter(|event| matches!(event, SessionEvent::CallEnded { .. }))
        .count();
    assert_eq!(ended, 1);
}

#[tokio::test]
async fn remote_hangup_tears_down() {
    let mut h = harness();
    connect_as_callee(&h).await;

    h.orchestrator
        .handle_signal(PEER, CallSignal::End { conversation_id: CONVERSATION })
        .await;

    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Idle);
    assert!(drain(&mut h.events).iter().any(|event| matches!(
        event,
        SessionEvent::CallEnded {
            reason: CallEndReason::Hangup
        }
    )));
}

#[tokio::test]
async fn signals_from_an_unrelated_peer_are_dropped() {
    let h = harness();
    connect_as_callee(&h).await;

    h.orchestrator
        .handle_signal(UserId(9), CallSignal::End { conversation_id: CONVERSATION })
        .await;
    assert_eq!(h.orchestrator.snapshot().await.status, CallStatus::Active);
}

#[tokio::test]
async fn hangup_from_idle_is_a_no_op() {
    let mut h = harness();
    h.orchestrator.end().await.expect("end from idle");
    h.orchestrator.reject().await.expect("reject from idle");
    assert!(h.signals.sent().is_empty());
    assert!(drain(&mut h.events).is_empty());
}
