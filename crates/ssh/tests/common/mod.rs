//! Shared fixtures for the integration tests: a delegate that records
//! every callback into a channel, and helpers for building sessions over
//! a scripted engine.
//!
//! The fixtures run delegate callbacks on the inline queue, so callbacks
//! fire on the session worker itself in exact emission order. Awaiting
//! any replied operation is therefore a barrier: once it resolves, every
//! callback from earlier work has already been delivered.

#![allow(dead_code)]

use std::sync::Arc;

use skiff_ssh::engine::testing::{CallJournal, EngineCall, EventInjector, ScriptedEngine};
use skiff_ssh::engine::HostKey;
use skiff_ssh::{
    AuthMethod, Channel, ChannelId, ErrorKind, ForwardedChannelInfo, InlineCallbackQueue,
    NegotiatedAlgorithms, ServerBanner, Session, SessionConfig, SessionDelegate, SkiffError,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// One recorded delegate callback, reduced to what the tests assert on.
#[derive(Debug)]
pub enum DelegateEvent {
    Banner(String),
    IssueBanner(String),
    Negotiated(String),
    AuthMethods {
        methods: Vec<AuthMethod>,
        partial: bool,
    },
    Authenticated(String),
    Disconnected(Option<ErrorKind>),
    ForwardChannel {
        channel: Channel,
        destination_port: u16,
    },
    ChannelError {
        channel: ChannelId,
        kind: ErrorKind,
    },
}

/// Delegate that answers the host key question with a fixed verdict and
/// forwards every callback into a channel the test can await.
pub struct RecordingDelegate {
    trust: bool,
    events: mpsc::UnboundedSender<DelegateEvent>,
}

impl RecordingDelegate {
    pub fn new(trust: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<DelegateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { trust, events: tx }), rx)
    }
}

impl SessionDelegate for RecordingDelegate {
    fn should_trust_host_key(&self, _key: &HostKey) -> bool {
        self.trust
    }

    fn on_server_banner(&self, banner: &ServerBanner) {
        let _ = self
            .events
            .send(DelegateEvent::Banner(banner.server_software.clone()));
    }

    fn on_issue_banner(&self, banner: &str) {
        let _ = self
            .events
            .send(DelegateEvent::IssueBanner(banner.to_string()));
    }

    fn on_negotiated(&self, algorithms: &NegotiatedAlgorithms) {
        let _ = self
            .events
            .send(DelegateEvent::Negotiated(algorithms.kex.clone()));
    }

    fn on_auth_methods(&self, methods: &[AuthMethod], partial_success: bool) {
        let _ = self.events.send(DelegateEvent::AuthMethods {
            methods: methods.to_vec(),
            partial: partial_success,
        });
    }

    fn on_authenticated(&self, username: &str) {
        let _ = self
            .events
            .send(DelegateEvent::Authenticated(username.to_string()));
    }

    fn on_disconnected(&self, error: Option<&SkiffError>) {
        let _ = self
            .events
            .send(DelegateEvent::Disconnected(error.map(|e| e.kind())));
    }

    fn on_forward_channel(&self, channel: Channel, info: &ForwardedChannelInfo) {
        let _ = self.events.send(DelegateEvent::ForwardChannel {
            channel,
            destination_port: info.destination_port,
        });
    }

    fn on_channel_error(&self, channel: ChannelId, error: &SkiffError) {
        let _ = self.events.send(DelegateEvent::ChannelError {
            channel,
            kind: error.kind(),
        });
    }
}

/// A session over a scripted engine, together with every handle a test
/// needs to observe it.
pub struct TestSession {
    pub session: Session,
    pub events: mpsc::UnboundedReceiver<DelegateEvent>,
    pub journal: CallJournal,
    pub injector: EventInjector,
    // The session holds the delegate weakly; keep it alive here.
    pub delegate: Arc<RecordingDelegate>,
}

impl TestSession {
    /// Queue connect plus password authentication and wait until the
    /// worker reports the session authenticated.
    pub async fn connect_and_authenticate(&mut self) {
        self.session
            .connect(Duration::from_secs(5))
            .expect("connect enqueue failed");
        self.session
            .authenticate_with_password(Box::new(|| Some("secret".to_string())))
            .expect("authenticate enqueue failed");
        wait_for(&mut self.events, |event| {
            matches!(event, DelegateEvent::Authenticated(_))
        })
        .await;
        assert!(self.session.is_connected());
    }

    /// Wait until every previously queued command has been processed.
    pub async fn settle(&self) {
        let _ = self.session.descriptor().await;
    }
}

/// A trusted session with the default configuration.
pub fn scripted_session(engine: ScriptedEngine) -> TestSession {
    scripted_session_with(engine, true, SessionConfig::new())
}

/// A session with an explicit trust verdict and configuration.
pub fn scripted_session_with(
    engine: ScriptedEngine,
    trust: bool,
    config: SessionConfig,
) -> TestSession {
    let journal = engine.journal();
    let injector = engine.event_injector();
    let (delegate, events) = RecordingDelegate::new(trust);
    let session = Session::new(
        engine,
        "test.invalid",
        22,
        "deploy",
        config,
        &delegate,
        Arc::new(InlineCallbackQueue),
    )
    .expect("session construction failed");
    TestSession {
        session,
        events,
        journal,
        injector,
        delegate,
    }
}

/// Next delegate event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<DelegateEvent>) -> DelegateEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a delegate event")
        .expect("delegate event stream closed")
}

/// First event matching `pred`, discarding everything before it.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<DelegateEvent>,
    mut pred: impl FnMut(&DelegateEvent) -> bool,
) -> DelegateEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Collect events until the disconnect notification, returning everything
/// seen before it plus the error kind it carried.
pub async fn drain_until_disconnected(
    rx: &mut mpsc::UnboundedReceiver<DelegateEvent>,
) -> (Vec<DelegateEvent>, Option<ErrorKind>) {
    let mut seen = Vec::new();
    loop {
        match next_event(rx).await {
            DelegateEvent::Disconnected(kind) => return (seen, kind),
            event => seen.push(event),
        }
    }
}

/// Everything already delivered, without waiting.
pub fn drain_ready(rx: &mut mpsc::UnboundedReceiver<DelegateEvent>) -> Vec<DelegateEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The journal without the process-wide init entry, which only the first
/// session constructed in the test process records.
pub fn without_init(calls: Vec<EngineCall>) -> Vec<EngineCall> {
    calls
        .into_iter()
        .filter(|call| *call != EngineCall::LibraryInit)
        .collect()
}
