use super::*;
use crate::test_support::{Fixture, MemoryAudio, ScriptedConnector, TransportBehavior};
use shared::protocol::{Command, SessionOutcome};

#[tokio::test]
async fn every_target_gets_its_own_stream() {
    let fixture = Fixture::with_audio(ScriptedConnector::accepting(), MemoryAudio::new(5));
    fixture.spawn(3).await;

    let broadcast = fixture
        .fleet
        .broadcaster()
        .broadcast_audio(
            PathBuf::from("clip.wav"),
            TargetSelection::All,
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(broadcast.outcome.ok.len(), 3);

    let summary = broadcast.wait(Duration::from_secs(5)).await;
    let mut finished = summary.finished.clone();
    finished.sort();
    assert_eq!(finished, vec![ClientId(0), ClientId(1), ClientId(2)]);
    assert!(summary.is_settled());
    assert_eq!(fixture.audio.opens(), 3);
    for id in 0..3 {
        assert_eq!(fixture.transport(id).frames_sent(), 5, "client {id}");
    }
}

#[tokio::test]
async fn stuck_stream_does_not_hold_back_the_rest() {
    let fixture = Fixture::with_audio(
        ScriptedConnector::accepting().with_behaviors([
            TransportBehavior::default(),
            TransportBehavior::stuck_audio(),
            TransportBehavior::default(),
        ]),
        MemoryAudio::new(3),
    );
    fixture.spawn(3).await;

    let broadcast = fixture
        .fleet
        .broadcaster()
        .broadcast_audio(
            PathBuf::from("clip.wav"),
            TargetSelection::All,
            Duration::from_secs(1),
        )
        .await;
    assert_eq!(broadcast.playing().len(), 3);

    let summary = broadcast.wait(Duration::from_millis(500)).await;
    let mut finished = summary.finished.clone();
    finished.sort();
    assert_eq!(finished, vec![ClientId(0), ClientId(2)]);
    assert_eq!(summary.still_playing, vec![ClientId(1)]);
}

#[tokio::test]
async fn missing_source_fails_each_target() {
    let fixture = Fixture::new(ScriptedConnector::accepting());
    fixture.spawn(2).await;

    let broadcast = fixture
        .fleet
        .broadcaster()
        .broadcast_audio(
            PathBuf::from("missing.wav"),
            TargetSelection::FirstN(2),
            Duration::from_secs(1),
        )
        .await;

    assert_eq!(broadcast.outcome.failed.len(), 2);
    assert!(matches!(
        broadcast.outcome.outcome_for(ClientId(0)),
        Some(SessionOutcome::Failed {
            reason: CommandError::SourceNotFound(_)
        })
    ));
    assert!(broadcast.playing().is_empty());
    let summary = broadcast.wait(Duration::from_secs(1)).await;
    assert_eq!(summary, PlaybackSummary::default());
}

#[tokio::test]
async fn stop_command_ends_running_playbacks() {
    let fixture = Fixture::with_audio(ScriptedConnector::accepting(), MemoryAudio::new(100_000));
    fixture.spawn(2).await;
    let broadcaster = fixture.fleet.broadcaster();

    let broadcast = broadcaster
        .broadcast_audio(
            PathBuf::from("long.wav"),
            TargetSelection::All,
            Duration::from_secs(1),
        )
        .await;
    let stop = fixture
        .fleet
        .dispatcher()
        .dispatch(Command::StopAudio, TargetSelection::All, Duration::from_secs(1))
        .await;
    assert!(stop.all_ok());

    let summary = broadcast.wait(Duration::from_secs(2)).await;
    let mut stopped = summary.stopped.clone();
    stopped.sort();
    assert_eq!(stopped, vec![ClientId(0), ClientId(1)]);
    assert!(summary.finished.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completions_beyond_the_fleet_event_buffer_are_all_reported() {
    let sessions = crate::PLAYBACK_EVENT_BUFFER + 176;
    let fixture = Fixture::with_audio(ScriptedConnector::accepting(), MemoryAudio::new(0));
    let report = fixture.spawn(sessions).await;
    assert_eq!(report.connected.len(), sessions);

    let broadcast = fixture
        .fleet
        .broadcaster()
        .broadcast_audio(
            PathBuf::from("empty.wav"),
            TargetSelection::All,
            Duration::from_secs(5),
        )
        .await;
    assert_eq!(broadcast.outcome.ok.len(), sessions);

    let summary = broadcast.wait(Duration::from_secs(5)).await;
    assert_eq!(summary.finished.len(), sessions);
    assert!(summary.still_playing.is_empty());
    assert!(summary.is_settled());
}
