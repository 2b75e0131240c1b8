//! Session machine integration tests against scripted backends

use std::time::Duration;

use duplex_voice::config::SessionConfig;
use duplex_voice::protocol::{ClientMessage, ServerMessage, encode_audio};
use duplex_voice::session::{Role, SessionEvent, TurnState};

mod common;
use common::Harness;

const SETTLE: Duration = Duration::from_millis(200);
const LONG: Duration = Duration::from_secs(5);

/// Start a conversation and let the greeting and recognition settle
async fn listening(responses: &[&[&str]]) -> Harness {
    let mut h = Harness::new(responses);
    h.start();
    h.run_for(SETTLE).await;
    assert_eq!(h.machine.state(), TurnState::Listening);
    h
}

fn is_complete(m: &ServerMessage) -> bool {
    matches!(m, ServerMessage::AiResponseComplete { .. })
}

fn is_unavailable(m: &ServerMessage) -> bool {
    matches!(m, ServerMessage::Error { message, .. } if message == "speech recognition unavailable")
}

const STORY: &[&str] = &[
    "Sentence one here. ",
    "Sentence two here. ",
    "Sentence three here. ",
    "Sentence four here. ",
    "Sentence five here.",
];

#[tokio::test(start_paused = true)]
async fn start_greets_then_listens() {
    let mut h = Harness::new(&[]);
    h.start();
    assert_eq!(h.machine.state(), TurnState::Greeting);

    h.run_for(SETTLE).await;
    assert_eq!(h.machine.state(), TurnState::Listening);
    assert_eq!(h.recognizer.connects(), 1);

    let greeting = SessionConfig::default().greeting;
    let sent = h.sent().to_vec();
    assert!(sent.contains(&ServerMessage::SttReady));
    assert!(sent.iter().any(
        |m| matches!(m, ServerMessage::AiResponse { text, audio } if *text == greeting && !audio.is_empty())
    ));

    let history = h.machine.session().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::Assistant);
}

#[tokio::test(start_paused = true)]
async fn start_confirms_requested_model() {
    let mut h = Harness::new(&[]);
    h.client(ClientMessage::Start {
        model: Some("anthropic/claude-3-haiku".to_string()),
        is_mobile: Some(true),
        persona: None,
        role: None,
        word_limit: None,
    });
    h.run_for(SETTLE).await;

    assert!(h.sent().contains(&ServerMessage::ModelConfirmed {
        model: "anthropic/claude-3-haiku".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn greeting_failure_still_reaches_listening() {
    let session = SessionConfig {
        greeting: "FAIL to greet".to_string(),
        ..SessionConfig::default()
    };
    let mut h = Harness::with_session(&[], session);
    h.start();
    h.run_for(SETTLE).await;

    assert_eq!(h.machine.state(), TurnState::Listening);
    assert!(h.sent().iter().any(
        |m| matches!(m, ServerMessage::AiResponse { audio, .. } if audio.is_empty())
    ));
}

#[tokio::test(start_paused = true)]
async fn user_turn_is_answered_and_recorded() {
    let mut h = listening(&[&["你好呀朋友！", "今日有咩可以幫你？"]]).await;

    h.recognizer.say("你好", true, 0.9);
    assert!(h.run_until(is_complete, LONG).await);
    h.run_for(SETTLE).await;

    assert_eq!(h.machine.state(), TurnState::Speaking);
    assert_eq!(h.delivered_ordinals(), vec![0, 1]);

    let sent = h.sent().to_vec();
    assert!(sent.contains(&ServerMessage::UserSpeechStart));
    assert!(sent.iter().any(|m| matches!(
        m,
        ServerMessage::AiAudioChunk { ordinal: 0, is_first: true, .. }
    )));

    let history: Vec<(Role, String)> = h
        .machine
        .session()
        .history()
        .iter()
        .map(|e| (e.role, e.text.clone()))
        .collect();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1], (Role::User, "你好".to_string()));
    assert_eq!(
        history[2],
        (Role::Assistant, "你好呀朋友！今日有咩可以幫你？".to_string())
    );

    h.client(ClientMessage::AiFinishedSpeaking);
    assert_eq!(h.machine.state(), TurnState::Listening);
}

#[tokio::test(start_paused = true)]
async fn generation_request_carries_history() {
    let mut h = listening(&[&["Sure thing."]]).await;

    h.recognizer.say("hello", true, 0.9);
    assert!(h.run_until(is_complete, LONG).await);

    let requests = h.generator.requests();
    assert_eq!(requests.len(), 1);
    let roles: Vec<&str> = requests[0].messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, ["system", "assistant", "user"]);
    assert_eq!(requests[0].messages[2].content, "hello");
}

#[tokio::test(start_paused = true)]
async fn barge_in_stops_later_fragments() {
    let mut h = listening(&[STORY]).await;

    h.recognizer.say("tell me a story", true, 0.9);
    let third = |m: &ServerMessage| matches!(m, ServerMessage::AiAudioChunk { ordinal: 2, .. });
    assert!(h.run_until(third, LONG).await);
    assert_eq!(h.machine.state(), TurnState::Processing);
    let epoch = h.machine.epoch();

    h.client(ClientMessage::UserSpeaking);
    assert_eq!(h.machine.epoch(), epoch + 1);
    assert_eq!(h.machine.state(), TurnState::Listening);
    assert!(!h.machine.is_running());

    h.run_for(LONG).await;

    assert_eq!(h.delivered_ordinals(), vec![0, 1, 2]);
    assert_eq!(
        h.count(|m| matches!(m, ServerMessage::StopPlayback { .. })),
        1
    );
    assert_eq!(h.count(is_complete), 0);
    assert_eq!(h.machine.epoch(), epoch + 1);

    // The interrupted response is not remembered
    let history = h.machine.session().history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::User);
}

#[tokio::test(start_paused = true)]
async fn recognized_speech_interrupts_response() {
    let session = SessionConfig {
        hangover: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let mut h = Harness::with_session(&[STORY], session);
    h.start();
    h.run_for(SETTLE).await;

    h.recognizer.say("tell me a story", true, 0.9);
    let ended = |m: &ServerMessage| matches!(m, ServerMessage::UserSpeechEnd { .. });
    assert!(h.run_until(ended, LONG).await);
    let third = |m: &ServerMessage| matches!(m, ServerMessage::AiAudioChunk { ordinal: 2, .. });
    assert!(h.run_until(third, LONG).await);
    assert_eq!(h.machine.state(), TurnState::Processing);
    let epoch = h.machine.epoch();

    // New speech after the hangover starts a fresh utterance
    h.recognizer.say("wait", false, 0.8);
    let stopped = |m: &ServerMessage| matches!(m, ServerMessage::StopPlayback { .. });
    assert!(h.run_until(stopped, SETTLE).await);
    assert_eq!(h.machine.epoch(), epoch + 1);
    assert_eq!(h.machine.state(), TurnState::Listening);

    h.run_for(LONG).await;

    assert_eq!(h.delivered_ordinals(), vec![0, 1, 2]);
    assert_eq!(h.count(|m| matches!(m, ServerMessage::StopPlayback { .. })), 1);
    assert_eq!(h.count(|m| *m == ServerMessage::UserSpeechStart), 2);
    assert_eq!(h.count(is_complete), 0);
    assert_eq!(h.machine.epoch(), epoch + 1);
}

#[tokio::test(start_paused = true)]
async fn barge_in_while_speaking_returns_to_listening() {
    let mut h = listening(&[&["All done now."]]).await;

    h.recognizer.say("hi", true, 0.9);
    assert!(h.run_until(is_complete, LONG).await);
    h.run_for(SETTLE).await;
    assert_eq!(h.machine.state(), TurnState::Speaking);

    h.client(ClientMessage::UserSpeaking);
    assert_eq!(h.machine.state(), TurnState::Listening);
    assert!(h.sent().contains(&ServerMessage::StopPlayback {
        reason: "interrupted".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn failed_fragment_is_skipped() {
    let mut h = listening(&[&["First part done. ", "FAIL second part. ", "Third part here."]]).await;

    h.recognizer.say("go on", true, 0.9);
    assert!(h.run_until(is_complete, LONG).await);
    h.run_for(SETTLE).await;

    assert_eq!(h.delivered_ordinals(), vec![0, 2]);
    assert_eq!(h.count(|m| matches!(m, ServerMessage::Error { .. })), 0);
    assert_eq!(h.machine.state(), TurnState::Speaking);
}

#[tokio::test(start_paused = true)]
async fn final_transcript_dropped_while_responding() {
    let mut h = listening(&[
        &["One slow answer. ", "And more of it. ", "Still going."],
        &["Never used."],
    ])
    .await;

    // The second final lands inside the first utterance's hangover
    h.recognizer.say("first question", true, 0.9);
    h.recognizer.say("second question", true, 0.9);
    assert!(h.run_until(is_complete, LONG).await);
    h.run_for(SETTLE).await;

    assert_eq!(h.generator.requests().len(), 1);
    let users: Vec<String> = h
        .machine
        .session()
        .history()
        .iter()
        .filter(|e| e.role == Role::User)
        .map(|e| e.text.clone())
        .collect();
    assert_eq!(users, ["first question"]);
}

#[tokio::test(start_paused = true)]
async fn low_confidence_final_is_ignored() {
    let mut h = listening(&[&["Unused."]]).await;

    h.recognizer.say("mumble", true, 0.3);
    h.run_for(SETTLE).await;

    assert!(h.generator.requests().is_empty());
    assert_eq!(h.machine.state(), TurnState::Listening);
    assert!(h.sent().iter().any(|m| matches!(
        m,
        ServerMessage::Transcript { is_final: true, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn speech_end_follows_hangover() {
    let mut h = listening(&[&["Okay."]]).await;

    h.recognizer.say("wait", false, 0.5);
    h.run_for(SETTLE).await;
    assert_eq!(
        h.count(|m| matches!(m, ServerMessage::UserSpeechEnd { .. })),
        0
    );

    h.recognizer.say("wait for me", true, 0.9);
    h.run_for(Duration::from_secs(1)).await;
    assert!(h.sent().contains(&ServerMessage::UserSpeechEnd {
        final_text: "wait for me".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn generation_failure_sends_apology() {
    let mut h = listening(&[&["Hello there. ", "!ERR"]]).await;

    h.recognizer.say("question", true, 0.9);
    let apology = SessionConfig::default().apology;
    let is_apology = |m: &ServerMessage| {
        matches!(m, ServerMessage::Error { message, details: Some(_) } if *message == apology)
    };
    assert!(h.run_until(is_apology, LONG).await);

    assert_eq!(h.machine.state(), TurnState::Listening);
    assert!(!h.machine.is_running());
}

#[tokio::test(start_paused = true)]
async fn audio_reaches_recognition() {
    let mut h = listening(&[]).await;

    let chunk = duplex_voice::protocol::encode_audio(&[1, 0, 2, 0]);
    h.client(ClientMessage::Audio { audio: chunk });
    h.run_for(SETTLE).await;

    let received = h.recognizer.received_audio();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_ref(), &[1, 0, 2, 0]);
}

#[tokio::test(start_paused = true)]
async fn malformed_audio_is_reported() {
    let mut h = listening(&[]).await;

    h.client(ClientMessage::Audio {
        audio: "%%%".to_string(),
    });
    assert!(h.sent().iter().any(|m| matches!(m, ServerMessage::Error { .. })));
    assert_eq!(h.machine.state(), TurnState::Listening);
}

#[tokio::test(start_paused = true)]
async fn recognition_reconnects_after_failure() {
    let mut h = listening(&[]).await;
    h.clear_sent();

    h.recognizer.fail();
    h.run_for(LONG).await;

    assert_eq!(h.recognizer.connects(), 2);
    assert!(h.sent().contains(&ServerMessage::SttReady));
    assert_eq!(h.machine.state(), TurnState::Listening);
}

#[tokio::test(start_paused = true)]
async fn repeated_recognition_failures_are_reported() {
    let mut h = listening(&[]).await;
    h.clear_sent();

    for _ in 0..4 {
        h.recognizer.fail();
        h.run_for(Duration::from_secs(15)).await;
    }

    // The first connection plus three retries, then the failure surfaces
    assert_eq!(h.recognizer.connects(), 4);
    assert_eq!(h.count(is_unavailable), 1);
    assert_eq!(h.machine.state(), TurnState::Listening);

    h.run_for(LONG).await;
    assert_eq!(h.recognizer.connects(), 4);

    // Incoming audio brings recognition back
    h.clear_sent();
    h.client(ClientMessage::Audio {
        audio: encode_audio(&[7, 0]),
    });
    h.run_for(SETTLE).await;

    assert_eq!(h.recognizer.connects(), 5);
    assert!(h.sent().contains(&ServerMessage::SttReady));
    let received = h.recognizer.received_audio();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_ref(), &[7, 0]);
}

#[tokio::test(start_paused = true)]
async fn transcripts_restore_the_retry_budget() {
    let mut h = listening(&[]).await;

    for _ in 0..3 {
        h.recognizer.fail();
        h.run_for(Duration::from_secs(15)).await;
    }
    assert_eq!(h.recognizer.connects(), 4);

    h.recognizer.say("hmm", false, 0.5);
    h.run_for(SETTLE).await;
    h.recognizer.fail();
    h.run_for(Duration::from_secs(15)).await;

    assert_eq!(h.recognizer.connects(), 5);
    assert_eq!(h.count(is_unavailable), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_connections_give_up_until_audio_arrives() {
    let mut h = Harness::new(&[]);
    h.recognizer.refuse(usize::MAX);
    h.start();
    h.run_for(Duration::from_secs(30)).await;

    assert_eq!(h.machine.state(), TurnState::Listening);
    assert_eq!(h.recognizer.connects(), 4);
    assert_eq!(h.count(is_unavailable), 1);
    assert!(!h.sent().contains(&ServerMessage::SttReady));

    h.recognizer.refuse(0);
    h.client(ClientMessage::Audio {
        audio: encode_audio(&[1, 0]),
    });
    h.run_for(SETTLE).await;

    assert_eq!(h.recognizer.connects(), 5);
    assert!(h.sent().contains(&ServerMessage::SttReady));
}

#[tokio::test(start_paused = true)]
async fn misconfigured_recognition_is_not_retried() {
    let mut h = Harness::new(&[]);
    h.recognizer.misconfigure();
    h.start();
    h.run_for(Duration::from_secs(30)).await;

    assert_eq!(h.recognizer.connects(), 1);
    assert_eq!(h.count(is_unavailable), 1);

    h.client(ClientMessage::Audio {
        audio: encode_audio(&[1, 0]),
    });
    h.run_for(SETTLE).await;
    assert_eq!(h.recognizer.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn eviction_notifies_client() {
    let mut h = listening(&[]).await;
    h.clear_sent();

    assert!(!h.machine.handle(SessionEvent::Evicted));
    assert_eq!(h.machine.state(), TurnState::Idle);
    assert!(h.sent().iter().any(
        |m| matches!(m, ServerMessage::Error { message, .. } if message.contains("inactivity"))
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let mut h = listening(&[]).await;

    h.client(ClientMessage::Stop);
    h.client(ClientMessage::Stop);

    assert_eq!(h.machine.state(), TurnState::Idle);
    assert_eq!(h.count(|m| *m == ServerMessage::Stopped), 2);
    // History survives a stop
    assert_eq!(h.machine.session().history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_active_run() {
    let mut h = listening(&[&["One part. ", "Two part. ", "Three part."]]).await;

    h.recognizer.say("question", true, 0.9);
    let first = |m: &ServerMessage| matches!(m, ServerMessage::AiAudioChunk { .. });
    assert!(h.run_until(first, LONG).await);

    h.client(ClientMessage::Stop);
    h.clear_sent();
    h.run_for(LONG).await;

    assert!(h.delivered_ordinals().is_empty());
    assert_eq!(h.machine.state(), TurnState::Idle);
}

#[tokio::test(start_paused = true)]
async fn reset_clears_history() {
    let mut h = listening(&[]).await;

    h.client(ClientMessage::Reset);

    assert!(h.machine.session().history().is_empty());
    let sent = h.sent().to_vec();
    let stopped = sent.iter().position(|m| *m == ServerMessage::Stopped);
    let reset = sent.iter().position(|m| *m == ServerMessage::Reset);
    assert!(stopped.is_some() && stopped < reset);
}

#[tokio::test(start_paused = true)]
async fn restart_reuses_healthy_recognition() {
    let mut h = listening(&[]).await;

    h.start();
    h.run_for(SETTLE).await;

    assert_eq!(h.machine.state(), TurnState::Listening);
    assert_eq!(h.recognizer.connects(), 1);
    assert_eq!(h.count(|m| *m == ServerMessage::SttReady), 2);
}
