//! Client runtime integration tests, without audio devices or sockets

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use duplex_voice::Result;
use duplex_voice::client::{
    DeviceProfile, FRAGMENT_GAP, IngestBuffer, MAX_BUFFER_SIZE, Player, TalkClient,
};
use duplex_voice::protocol::{ClientMessage, ServerMessage, decode_audio, encode_audio};

/// Player that only records what it was asked to do
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Player for Log {
    fn play(&mut self, id: u64, audio: &[u8]) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .push(format!("play {id} {}", String::from_utf8_lossy(audio)));
        Ok(())
    }

    fn stop(&mut self) {
        self.0.lock().unwrap().push("stop".to_string());
    }
}

fn chunk(text: &str, ordinal: u32) -> ServerMessage {
    ServerMessage::AiAudioChunk {
        text: text.to_string(),
        audio: encode_audio(text.as_bytes()),
        ordinal,
        is_first: ordinal == 0,
    }
}

fn greeting(text: &str) -> ServerMessage {
    ServerMessage::AiResponse {
        text: text.to_string(),
        audio: encode_audio(text.as_bytes()),
    }
}

/// Id of the fragment most recently started on `log`
fn playing(log: &Log) -> u64 {
    log.entries()
        .iter()
        .rev()
        .find_map(|e| e.strip_prefix("play ")?.split(' ').next()?.parse().ok())
        .expect("nothing played")
}

fn is_audio(m: &ClientMessage) -> bool {
    matches!(m, ClientMessage::Audio { .. })
}

/// A client whose greeting has finished and whose recognition is ready
fn conversing(log: &Log, profile: DeviceProfile) -> TalkClient<Log> {
    let mut client = TalkClient::new(log.clone(), profile);
    client.start_message();
    let now = Instant::now();
    client.on_server(greeting("hello"), now);
    client.on_server(ServerMessage::SttReady, now);
    let out = client.on_fragment_end(playing(log), now);
    assert_eq!(out, vec![ClientMessage::AiFinishedSpeaking]);
    client
}

#[test]
fn ingest_keeps_last_fifty_chunks_in_order() {
    let mut ingest = IngestBuffer::new();
    ingest.allow_streaming();

    for n in 0..60u8 {
        assert!(ingest.push(Bytes::from(vec![n])).is_empty());
    }
    assert_eq!(ingest.buffered(), MAX_BUFFER_SIZE);
    assert_eq!(ingest.dropped(), 10);

    let flushed: Vec<u8> = ingest.mark_ready().iter().map(|c| c[0]).collect();
    let expected: Vec<u8> = (10..60).collect();
    assert_eq!(flushed, expected);
}

#[test]
fn microphone_withheld_until_greeting_drains() {
    let log = Log::default();
    let mut client = TalkClient::new(log.clone(), DeviceProfile::Desktop);
    client.start_message();
    let now = Instant::now();

    client.on_server(greeting("hello"), now);
    client.on_server(ServerMessage::SttReady, now);
    assert!(client.on_frame(&[0.01; 64], now).is_empty());

    let out = client.on_fragment_end(playing(&log), now);
    assert_eq!(out, vec![ClientMessage::AiFinishedSpeaking]);

    let out = client.on_frame(&[0.01; 64], now);
    assert_eq!(out.len(), 1);
    let ClientMessage::Audio { audio } = &out[0] else {
        panic!("expected audio");
    };
    assert_eq!(decode_audio(audio).unwrap().len(), 128);
}

#[test]
fn frames_before_ready_are_flushed_on_ready() {
    let log = Log::default();
    let mut client = TalkClient::new(log.clone(), DeviceProfile::Desktop);
    client.start_message();
    let now = Instant::now();

    client.on_server(greeting("hello"), now);
    client.on_fragment_end(playing(&log), now);

    for _ in 0..3 {
        assert!(client.on_frame(&[0.0; 16], now).is_empty());
    }
    let out = client.on_server(ServerMessage::SttReady, now);
    assert_eq!(out.len(), 3);
    assert!(out.iter().all(is_audio));
}

#[test]
fn fragments_play_in_arrival_order_with_gap() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Desktop);
    let now = Instant::now();

    client.on_server(chunk("one", 0), now);
    client.on_server(chunk("two", 1), now);
    assert!(client.take_gap().is_none());

    assert!(client.on_fragment_end(playing(&log), now).is_empty());
    let (delay, ticket) = client.take_gap().expect("gap scheduled");
    assert_eq!(delay, FRAGMENT_GAP);

    client.on_gap_elapsed(ticket, now + delay);
    let out = client.on_fragment_end(playing(&log), now + delay);
    assert_eq!(out, vec![ClientMessage::AiFinishedSpeaking]);

    let plays: Vec<String> = log
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("play"))
        .map(|e| e.rsplit(' ').next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(plays, ["hello", "one", "two"]);
}

#[test]
fn barge_in_stops_playback_and_notifies_server() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Desktop);
    let start = Instant::now();

    client.on_server(chunk("one", 0), start);
    client.on_server(chunk("two", 1), start);

    // Grace period: loud input is not trusted yet
    let early = client.on_frame(&[0.3; 64], start + Duration::from_millis(100));
    assert!(!early.contains(&ClientMessage::UserSpeaking));

    let later = start + Duration::from_millis(1500);
    let out = client.on_frame(&[0.3; 64], later);
    assert_eq!(out[0], ClientMessage::UserSpeaking);
    assert_eq!(out[1], ClientMessage::AiFinishedSpeaking);
    // Microphone audio keeps flowing so the server hears the interruption
    assert!(is_audio(&out[2]));

    assert!(!client.queue().is_active());
    assert_eq!(client.queue().pending(), 0);
    assert_eq!(log.entries().last().map(String::as_str), Some("stop"));
}

#[test]
fn early_echo_spike_does_not_interrupt() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Desktop);
    let start = Instant::now();

    client.on_server(chunk("one", 0), start);
    let t = start + Duration::from_millis(400);
    for _ in 0..5 {
        client.on_frame(&[0.002; 64], t);
    }
    let out = client.on_frame(&[0.2; 64], t);
    assert!(!out.contains(&ClientMessage::UserSpeaking));
    assert!(client.queue().is_active());
}

#[test]
fn mobile_grace_period_is_longer() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Mobile);
    let start = Instant::now();

    client.on_server(chunk("one", 0), start);
    let t = start + Duration::from_millis(600);
    assert!(!client.detector().is_armed(t));
    assert!(client.detector().is_armed(start + Duration::from_millis(1000)));
}

#[test]
fn server_stop_playback_is_safe_when_idle() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Desktop);
    let now = Instant::now();

    client.on_server(chunk("one", 0), now);
    let stop = ServerMessage::StopPlayback {
        reason: "interrupted".to_string(),
    };
    assert_eq!(
        client.on_server(stop.clone(), now),
        vec![ClientMessage::AiFinishedSpeaking]
    );
    assert!(client.on_server(stop, now).is_empty());
}

#[test]
fn stale_fragment_end_after_stop_is_ignored() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Desktop);
    let now = Instant::now();

    client.on_server(chunk("one", 0), now);
    let id = playing(&log);
    client.on_server(
        ServerMessage::StopPlayback {
            reason: "interrupted".to_string(),
        },
        now,
    );

    client.on_server(chunk("fresh", 0), now);
    assert!(client.on_fragment_end(id, now).is_empty());
    assert!(client.queue().is_active());
}

#[test]
fn mute_after_speech_ends_turn() {
    let log = Log::default();
    let mut client = conversing(&log, DeviceProfile::Desktop);
    let now = Instant::now();

    client.on_frame(&[0.2; 64], now);
    assert_eq!(client.toggle_mute(), vec![ClientMessage::UserFinishedSpeaking]);
    assert!(client.on_frame(&[0.2; 64], now).is_empty());
    assert!(client.toggle_mute().is_empty());
}
