//! Integration tests for the session lifecycle over a scripted engine:
//! connect and host-key verification, the authentication variants,
//! channel open/read/write/close, engine events, and teardown.

mod common;

use common::{
    drain_ready, drain_until_disconnected, next_event, scripted_session, scripted_session_with,
    wait_for, DelegateEvent,
};
use skiff_ssh::engine::testing::{EngineCall, ScriptedEngine};
use skiff_ssh::engine::{
    AuthOutcome, EngineChannelId, EngineEvent, EngineFailure, HostKey, HostKeyKind,
    InteractivePrompt, InteractiveRound, InteractiveStep, NegotiatedAlgorithms, Negotiation,
    ServerBanner, SocketDescriptor,
};
use skiff_ssh::{
    AuthMethod, ChannelId, ChannelSpec, ChannelStage, ChannelType, ErrorKind, SessionConfig,
    SessionStage,
};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

#[tokio::test]
async fn test_lifecycle_reaches_connected_with_ordered_callbacks() {
    let mut fixture = scripted_session(ScriptedEngine::new());

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_password(Box::new(|| Some("secret".to_string())))
        .unwrap();
    fixture.settle().await;

    // Callbacks arrive in the exact order the worker emitted them.
    match next_event(&mut fixture.events).await {
        DelegateEvent::Banner(software) => assert_eq!(software, "OpenSSH_9.6"),
        other => panic!("expected the server banner first, got {other:?}"),
    }
    match next_event(&mut fixture.events).await {
        DelegateEvent::Negotiated(kex) => assert_eq!(kex, "curve25519-sha256"),
        other => panic!("expected the negotiation callback, got {other:?}"),
    }
    match next_event(&mut fixture.events).await {
        DelegateEvent::AuthMethods { methods, partial } => {
            assert!(!partial);
            assert_eq!(
                methods,
                vec![
                    AuthMethod::Password,
                    AuthMethod::PublicKey,
                    AuthMethod::Interactive
                ]
            );
        }
        other => panic!("expected the method probe callback, got {other:?}"),
    }
    match next_event(&mut fixture.events).await {
        DelegateEvent::Authenticated(username) => assert_eq!(username, "deploy"),
        other => panic!("expected the authenticated callback, got {other:?}"),
    }

    assert!(fixture.session.is_connected());
    assert_eq!(fixture.session.stage(), SessionStage::Connected);
    assert_eq!(
        fixture.session.descriptor().await.unwrap(),
        Some(SocketDescriptor(9))
    );

    fixture.session.disconnect().unwrap();
    match wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::Disconnected(_))
    })
    .await
    {
        DelegateEvent::Disconnected(error) => assert_eq!(error, None),
        _ => unreachable!(),
    }

    assert_eq!(
        common::without_init(fixture.journal.snapshot()),
        vec![
            EngineCall::Connect {
                host: "test.invalid".to_string(),
                timeout: Duration::from_secs(5),
            },
            EngineCall::Negotiate,
            EngineCall::AuthMethods {
                username: "deploy".to_string()
            },
            EngineCall::AuthPassword {
                username: "deploy".to_string()
            },
            EngineCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_connect_with_adopted_descriptor() {
    let mut fixture = scripted_session(ScriptedEngine::new());

    fixture
        .session
        .connect_with_descriptor(Duration::ZERO, Box::new(|| Ok(SocketDescriptor(7))))
        .unwrap();
    fixture
        .session
        .authenticate_with_password(Box::new(|| Some("secret".to_string())))
        .unwrap();
    wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::Authenticated(_))
    })
    .await;

    assert!(fixture.journal.contains(&EngineCall::Connect {
        host: "fd 7".to_string(),
        timeout: Duration::ZERO,
    }));
}

#[tokio::test]
async fn test_issue_banner_is_forwarded() {
    let negotiation = Negotiation {
        banner: ServerBanner {
            server_software: "OpenSSH_9.6".to_string(),
            client_software: "skiff_0.1".to_string(),
            protocol_version: 2,
        },
        algorithms: NegotiatedAlgorithms {
            kex: "curve25519-sha256".to_string(),
            cipher: "aes256-gcm@openssh.com".to_string(),
            hmac: "hmac-sha2-512".to_string(),
        },
        host_key: HostKey {
            kind: HostKeyKind::Ed25519,
            blob: vec![0x0b; 32],
        },
        issue_banner: Some("scheduled maintenance at 02:00 UTC".to_string()),
    };
    let mut fixture = scripted_session(ScriptedEngine::new().with_negotiation(negotiation));

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    match wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::IssueBanner(_))
    })
    .await
    {
        DelegateEvent::IssueBanner(text) => {
            assert_eq!(text, "scheduled maintenance at 02:00 UTC");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_host_key_refusal_never_reaches_authentication() {
    let mut fixture =
        scripted_session_with(ScriptedEngine::new(), false, SessionConfig::new());

    // A zero timeout means "no deadline" and must reach the engine as-is.
    fixture.session.connect(Duration::ZERO).unwrap();
    let (seen, error) = drain_until_disconnected(&mut fixture.events).await;

    assert_eq!(error, Some(ErrorKind::HostKey));
    assert!(fixture.session.is_disconnected());
    assert!(seen
        .iter()
        .any(|e| matches!(e, DelegateEvent::Negotiated(_))));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, DelegateEvent::AuthMethods { .. })));

    // The transport came up and was torn down before any auth traffic.
    assert!(fixture.journal.contains(&EngineCall::Connect {
        host: "test.invalid".to_string(),
        timeout: Duration::ZERO,
    }));
    assert!(fixture.journal.contains(&EngineCall::Negotiate));
    assert!(fixture.journal.contains(&EngineCall::Disconnect));
    assert!(!fixture.journal.contains(&EngineCall::AuthMethods {
        username: "deploy".to_string()
    }));
}

#[tokio::test]
async fn test_connect_failure_reports_disconnect() {
    let engine = ScriptedEngine::new().with_connect_failure(EngineFailure::new(
        ErrorKind::Timeout,
        -5,
        "connection timed out",
    ));
    let mut fixture = scripted_session(engine);

    fixture.session.connect(Duration::from_secs(1)).unwrap();
    let (_, error) = drain_until_disconnected(&mut fixture.events).await;

    assert_eq!(error, Some(ErrorKind::Timeout));
    assert_eq!(
        common::without_init(fixture.journal.snapshot()),
        vec![
            EngineCall::Connect {
                host: "test.invalid".to_string(),
                timeout: Duration::from_secs(1),
            },
            EngineCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_missing_password_aborts_without_engine_attempt() {
    let mut fixture = scripted_session(ScriptedEngine::new());

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_password(Box::new(|| None))
        .unwrap();
    let (_, error) = drain_until_disconnected(&mut fixture.events).await;

    assert_eq!(error, Some(ErrorKind::Auth));
    // The probe ran, but no password ever reached the engine.
    assert!(fixture.journal.contains(&EngineCall::AuthMethods {
        username: "deploy".to_string()
    }));
    assert!(!fixture.journal.contains(&EngineCall::AuthPassword {
        username: "deploy".to_string()
    }));
}

#[tokio::test]
async fn test_denied_authentication_disconnects() {
    let engine = ScriptedEngine::new().with_password_outcome(AuthOutcome::Denied {
        methods: vec![AuthMethod::PublicKey],
    });
    let mut fixture = scripted_session(engine);

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_password(Box::new(|| Some("wrong".to_string())))
        .unwrap();
    let (seen, error) = drain_until_disconnected(&mut fixture.events).await;

    assert_eq!(error, Some(ErrorKind::Auth));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, DelegateEvent::Authenticated(_))));
    assert!(fixture.session.is_disconnected());
}

#[tokio::test]
async fn test_partial_success_requests_more_methods() {
    let engine = ScriptedEngine::new().with_password_outcome(AuthOutcome::Partial {
        methods: vec![AuthMethod::Interactive],
    });
    let mut fixture = scripted_session(engine);

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_password(Box::new(|| Some("secret".to_string())))
        .unwrap();
    match wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::AuthMethods { partial: true, .. })
    })
    .await
    {
        DelegateEvent::AuthMethods { methods, .. } => {
            assert_eq!(methods, vec![AuthMethod::Interactive]);
        }
        _ => unreachable!(),
    }
    fixture.settle().await;
    assert_eq!(fixture.session.stage(), SessionStage::Authenticating);

    // The next attempt completes the exchange.
    fixture
        .session
        .authenticate_with_password(Box::new(|| Some("second factor".to_string())))
        .unwrap();
    wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::Authenticated(_))
    })
    .await;

    let calls = fixture.journal.snapshot();
    let probes = calls
        .iter()
        .filter(|c| matches!(c, EngineCall::AuthMethods { .. }))
        .count();
    let attempts = calls
        .iter()
        .filter(|c| matches!(c, EngineCall::AuthPassword { .. }))
        .count();
    assert_eq!(probes, 1, "the method probe runs only once");
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn test_interactive_authentication_rounds() {
    let round = InteractiveRound {
        name: "login".to_string(),
        instruction: "answer both prompts".to_string(),
        prompts: vec![
            InteractivePrompt {
                text: "Password: ".to_string(),
                echo: false,
            },
            InteractivePrompt {
                text: "Token: ".to_string(),
                echo: true,
            },
        ],
    };
    let engine = ScriptedEngine::new().with_interactive_step(InteractiveStep::Prompts(round));
    let mut fixture = scripted_session(engine);

    let seen_rounds = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen_rounds);

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_interactive(Box::new(move |round| {
            recorder
                .lock()
                .unwrap()
                .push((round.name.clone(), round.prompts.len()));
            Some(vec!["hunter2".to_string(), "123456".to_string()])
        }))
        .unwrap();
    wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::Authenticated(_))
    })
    .await;

    assert_eq!(
        seen_rounds.lock().unwrap().clone(),
        vec![("login".to_string(), 2)]
    );
    assert!(fixture.journal.contains(&EngineCall::AuthInteractiveStart {
        username: "deploy".to_string()
    }));
    assert!(fixture
        .journal
        .contains(&EngineCall::AuthInteractiveRespond { answers: 2 }));
}

#[tokio::test]
async fn test_interactive_abandoned_mid_round() {
    let round = InteractiveRound {
        name: "login".to_string(),
        instruction: String::new(),
        prompts: vec![InteractivePrompt {
            text: "Password: ".to_string(),
            echo: false,
        }],
    };
    let engine = ScriptedEngine::new().with_interactive_step(InteractiveStep::Prompts(round));
    let mut fixture = scripted_session(engine);

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_interactive(Box::new(|_| None))
        .unwrap();
    let (_, error) = drain_until_disconnected(&mut fixture.events).await;

    assert_eq!(error, Some(ErrorKind::Auth));
    assert!(!fixture
        .journal
        .contains(&EngineCall::AuthInteractiveRespond { answers: 1 }));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mut fixture = scripted_session(ScriptedEngine::new());
    fixture.connect_and_authenticate().await;

    fixture.session.disconnect().unwrap();
    fixture.session.disconnect().unwrap();
    fixture.settle().await;

    let disconnects = drain_ready(&mut fixture.events)
        .into_iter()
        .filter(|e| matches!(e, DelegateEvent::Disconnected(_)))
        .count();
    assert_eq!(disconnects, 1, "the delegate hears about teardown once");

    let engine_disconnects = fixture
        .journal
        .snapshot()
        .iter()
        .filter(|c| matches!(c, EngineCall::Disconnect))
        .count();
    assert_eq!(engine_disconnects, 1);
}

#[tokio::test]
async fn test_second_connect_is_ignored() {
    let mut fixture = scripted_session(ScriptedEngine::new());

    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture.session.connect(Duration::from_secs(5)).unwrap();
    fixture
        .session
        .authenticate_with_password(Box::new(|| Some("secret".to_string())))
        .unwrap();
    wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::Authenticated(_))
    })
    .await;

    let connects = fixture
        .journal
        .snapshot()
        .iter()
        .filter(|c| matches!(c, EngineCall::Connect { .. }))
        .count();
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn test_exec_channel_read_write_close() {
    let engine = ScriptedEngine::new().with_read_data(b"Linux test 6.1".to_vec());
    let mut fixture = scripted_session(engine);
    fixture.connect_and_authenticate().await;

    let channel = fixture
        .session
        .open_channel(ChannelSpec::Exec {
            command: "uname -a".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(channel.id(), ChannelId(1));
    assert_eq!(channel.channel_type(), ChannelType::Exec);
    assert_eq!(channel.stage(), ChannelStage::ReadWrite);

    assert_eq!(channel.read(1024).await.unwrap(), b"Linux test 6.1");
    // The script queue is exhausted; further reads return no data.
    assert!(channel.read(1024).await.unwrap().is_empty());
    assert_eq!(channel.write(b"ignored").await.unwrap(), 7);

    channel.close().await.unwrap();
    assert_eq!(channel.stage(), ChannelStage::Closed);

    let error = channel.read(1024).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Generic);
    assert_eq!(error.message(), "channel is closed");

    assert!(fixture.journal.contains(&EngineCall::OpenChannel {
        kind: "exec".to_string()
    }));
    assert!(fixture
        .journal
        .contains(&EngineCall::CloseChannel { id: 1 }));
}

#[tokio::test]
async fn test_channel_refused_when_not_connected() {
    let fixture = scripted_session(ScriptedEngine::new());

    let error = fixture
        .session
        .open_channel(ChannelSpec::Exec {
            command: "true".to_string(),
        })
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Generic);
    assert_eq!(error.message(), "session is not-connected");
    assert!(!fixture.journal.contains(&EngineCall::OpenChannel {
        kind: "exec".to_string()
    }));
}

#[tokio::test]
async fn test_subsystem_channels_rejected() {
    let mut fixture = scripted_session(ScriptedEngine::new());
    fixture.connect_and_authenticate().await;

    let error = fixture
        .session
        .open_channel(ChannelSpec::Subsystem {
            name: "netconf".to_string(),
        })
        .await
        .unwrap_err();

    assert_eq!(error.message(), "subsystem channels are not supported");
    assert!(!fixture.journal.contains(&EngineCall::OpenChannel {
        kind: "subsystem".to_string()
    }));
}

#[tokio::test]
async fn test_open_channel_failure_surfaces_error() {
    let engine = ScriptedEngine::new().with_open_channel_failure(EngineFailure::new(
        ErrorKind::Generic,
        -21,
        "administratively prohibited",
    ));
    let mut fixture = scripted_session(engine);
    fixture.connect_and_authenticate().await;

    let error = fixture
        .session
        .open_channel(ChannelSpec::Direct {
            target_host: "10.0.0.8".to_string(),
            target_port: 5432,
            originator_host: "127.0.0.1".to_string(),
            originator_port: 46000,
        })
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Generic);
    assert_eq!(error.engine_code(), Some(-21));
    // The engine was consulted; there was never a channel to close.
    assert!(fixture.journal.contains(&EngineCall::OpenChannel {
        kind: "direct-tcpip".to_string()
    }));
    assert!(!fixture
        .journal
        .contains(&EngineCall::CloseChannel { id: 1 }));
}

#[tokio::test]
async fn test_forward_channel_announced_via_event_pump() {
    let config =
        SessionConfig::new().with_event_poll_interval(Some(Duration::from_millis(10)));
    let mut fixture = scripted_session_with(ScriptedEngine::new(), true, config);
    fixture.connect_and_authenticate().await;

    fixture.injector.push(EngineEvent::ForwardChannelOpened {
        id: EngineChannelId(40),
        destination_port: 8080,
        originator_host: "198.51.100.7".to_string(),
        originator_port: 51000,
    });

    let (channel, port) = match wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::ForwardChannel { .. })
    })
    .await
    {
        DelegateEvent::ForwardChannel {
            channel,
            destination_port,
        } => (channel, destination_port),
        _ => unreachable!(),
    };

    assert_eq!(port, 8080);
    assert_eq!(channel.channel_type(), ChannelType::Forward);
    assert_eq!(channel.stage(), ChannelStage::ReadWrite);

    // The handle is live and wired to the engine-side channel.
    assert_eq!(channel.write(b"ok").await.unwrap(), 2);
    assert!(fixture
        .journal
        .contains(&EngineCall::ChannelWrite { id: 40, len: 2 }));
}

#[tokio::test]
async fn test_peer_close_tears_down_channel() {
    let mut fixture = scripted_session(ScriptedEngine::new());
    fixture.connect_and_authenticate().await;

    let channel = fixture
        .session
        .open_channel(ChannelSpec::Shell {
            terminal: "xterm-256color".to_string(),
            columns: 80,
            rows: 24,
        })
        .await
        .unwrap();

    fixture.injector.push(EngineEvent::ChannelClosed {
        id: EngineChannelId(1),
    });
    fixture.settle().await;

    assert_eq!(channel.stage(), ChannelStage::Closed);
    let error = channel.write(b"late").await.unwrap_err();
    assert_eq!(error.message(), "channel is closed");
}

#[tokio::test]
async fn test_channel_fault_notifies_delegate() {
    let mut fixture = scripted_session(ScriptedEngine::new());
    fixture.connect_and_authenticate().await;

    let channel = fixture
        .session
        .open_channel(ChannelSpec::Scp {
            path: "/var/log/syslog".to_string(),
        })
        .await
        .unwrap();

    fixture.injector.push(EngineEvent::ChannelFault {
        id: EngineChannelId(1),
        failure: EngineFailure::new(ErrorKind::Generic, -7, "window desynchronized"),
    });
    fixture.settle().await;

    assert_eq!(channel.stage(), ChannelStage::Closed);
    match wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::ChannelError { .. })
    })
    .await
    {
        DelegateEvent::ChannelError { channel, kind } => {
            assert_eq!(channel, ChannelId(1));
            assert_eq!(kind, ErrorKind::Generic);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_transport_lost_disconnects() {
    let config =
        SessionConfig::new().with_event_poll_interval(Some(Duration::from_millis(10)));
    let mut fixture = scripted_session_with(ScriptedEngine::new(), true, config);
    fixture.connect_and_authenticate().await;

    fixture.injector.push(EngineEvent::TransportLost {
        failure: EngineFailure::new(ErrorKind::Fatal, -43, "connection reset by peer"),
    });

    match wait_for(&mut fixture.events, |e| {
        matches!(e, DelegateEvent::Disconnected(_))
    })
    .await
    {
        DelegateEvent::Disconnected(error) => assert_eq!(error, Some(ErrorKind::Fatal)),
        _ => unreachable!(),
    }
    assert!(fixture.session.is_disconnected());
    assert!(fixture.journal.contains(&EngineCall::Disconnect));
}
