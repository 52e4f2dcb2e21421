/// Integration tests for the producer-to-theatre flow
/// Covers publication, window enforcement, single-session eviction and
/// integrity failures against the library API.
mod common;

#[cfg(test)]
mod tests {
    use super::common;
    use cinemashield::error::{AuthError, DeliveryError, SessionError};
    use cinemashield::modules::crypto::ShardKey;
    use cinemashield::modules::manifest::Manifest;
    use cinemashield::modules::media_api::AppState;
    use cinemashield::modules::pipeline::{HistoryRecord, ProgressStep};
    use chrono::{DateTime, Duration, Utc};
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    struct Published {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
        media: Vec<u8>,
        record: HistoryRecord,
        start: DateTime<Utc>,
    }

    fn run_pipeline(state: &AppState, movie_id: &str, media: &[u8]) -> HistoryRecord {
        let source = state
            .workspace
            .uploads_dir()
            .join(format!("{}_feature.mp4", movie_id));
        fs::write(&source, media).unwrap();
        state.pipeline.register_upload(
            movie_id.into(),
            "feature.mp4".into(),
            "THEATRE_001".into(),
            source,
            None,
        );
        let job = state.pipeline.start(movie_id).unwrap();
        let mut last_step = None;
        let record = state
            .pipeline
            .run(&job, |event| last_step = Some(event.step))
            .unwrap();
        assert_eq!(last_step, Some(ProgressStep::Done));
        record
    }

    fn publish(playback_hours: u32) -> Published {
        let dir = tempfile::tempdir().unwrap();
        let state = common::app_state(dir.path(), playback_hours);
        let media = common::sample_media(3000);
        let record = run_pipeline(&state, "ab12cd34", &media);

        let start = Manifest::load(&state.workspace.manifest_path())
            .unwrap()
            .playback_window
            .start;
        Published {
            _dir: dir,
            state,
            media,
            record,
            start,
        }
    }

    #[test]
    fn test_two_hour_window_scenario() {
        let fx = publish(2);
        assert_eq!(fx.record.shards, 3);
        let t = fx.start;

        // Inside the window the asset streams in full
        let auth = fx
            .state
            .authorization
            .authorize(&fx.record.key, t + Duration::hours(1), None)
            .unwrap();
        assert_eq!(auth.shards, 3);
        assert_eq!(auth.time_remaining(), "60 min");

        let plan = fx
            .state
            .delivery
            .stream(&auth.token, None, t + Duration::hours(1), None)
            .unwrap();
        assert!(!plan.partial);
        assert_eq!(fs::read(&plan.path).unwrap(), fx.media);

        // After the window the token and a fresh key presentation both fail
        let late = t + Duration::hours(3);
        assert!(matches!(
            fx.state.delivery.stream(&auth.token, None, late, None),
            Err(DeliveryError::Session(SessionError::Expired))
        ));
        assert!(!plan.path.exists());
        assert!(matches!(
            fx.state.authorization.authorize(&fx.record.key, late, None),
            Err(AuthError::Expired { .. })
        ));
    }

    #[test]
    fn test_before_window_is_too_early() {
        let fx = publish(2);
        let result = fx
            .state
            .authorization
            .authorize(&fx.record.key, fx.start - Duration::minutes(1), None);
        assert!(matches!(result, Err(AuthError::TooEarly { start }) if start == fx.start));
        assert_eq!(fx.state.sessions.active_count(), 0);
    }

    #[test]
    fn test_wrong_key_leaves_no_session() {
        let fx = publish(3);
        let wrong = ShardKey::generate().to_encoded();
        let result = fx
            .state
            .authorization
            .authorize(&wrong, fx.start + Duration::minutes(1), None);
        assert!(matches!(result, Err(AuthError::InvalidKey)));
        assert_eq!(fx.state.sessions.active_count(), 0);
        assert_eq!(
            fs::read_dir(fx.state.workspace.artifacts_dir()).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_single_active_session() {
        let fx = publish(3);
        let now = fx.start + Duration::minutes(30);

        let first = fx
            .state
            .authorization
            .authorize(&fx.record.key, now, None)
            .unwrap();
        let second = fx
            .state
            .authorization
            .authorize(&fx.record.key, now, None)
            .unwrap();

        assert_eq!(fx.state.sessions.active_count(), 1);
        assert!(!fx.state.workspace.artifact_path(&first.token).exists());
        assert!(matches!(
            fx.state.delivery.stream(&first.token, None, now, None),
            Err(DeliveryError::Session(SessionError::NotFound))
        ));
        assert!(fx.state.delivery.stream(&second.token, None, now, None).is_ok());
    }

    #[test]
    fn test_tampered_shard_is_integrity_violation() {
        let fx = publish(3);
        let manifest = Manifest::load(&fx.state.workspace.manifest_path()).unwrap();
        let victim = fx
            .state
            .workspace
            .shards_dir()
            .join(&manifest.shards[2].id);
        let mut bytes = fs::read(&victim).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&victim, bytes).unwrap();

        let result = fx.state.authorization.authorize(
            &fx.record.key,
            fx.start + Duration::minutes(1),
            None,
        );
        assert!(matches!(result, Err(AuthError::IntegrityViolation { .. })));
        assert_eq!(fx.state.sessions.active_count(), 0);
        assert_eq!(
            fs::read_dir(fx.state.workspace.artifacts_dir()).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_shutdown_removes_artifacts() {
        let fx = publish(3);
        let auth = fx
            .state
            .authorization
            .authorize(&fx.record.key, fx.start + Duration::minutes(1), None)
            .unwrap();
        let artifact = fx.state.workspace.artifact_path(&auth.token);
        assert!(artifact.exists());

        fx.state.shutdown();
        assert!(!artifact.exists());
        assert_eq!(fx.state.sessions.active_count(), 0);
    }

    #[test]
    fn test_republish_while_authorizing() {
        let fx = publish(3);
        let replacement: Vec<u8> = common::sample_media(5000).into_iter().rev().collect();

        let producer = {
            let state = fx.state.clone();
            let media = replacement.clone();
            thread::spawn(move || run_pipeline(&state, "ef56ab78", &media))
        };

        // Every authorization sees one complete publication: the old one
        // accepts the old key, the new one rejects it.
        let mut attempts = 0;
        while !producer.is_finished() || attempts == 0 {
            attempts += 1;
            match fx
                .state
                .authorization
                .authorize(&fx.record.key, Utc::now(), None)
            {
                Ok(auth) => {
                    let plan = fx
                        .state
                        .delivery
                        .stream(&auth.token, None, Utc::now(), None)
                        .unwrap();
                    assert_eq!(fs::read(&plan.path).unwrap(), fx.media);
                }
                Err(AuthError::InvalidKey) => {}
                Err(e) => panic!("authorization saw a torn publication: {}", e),
            }
        }
        let second = producer.join().unwrap();

        assert!(matches!(
            fx.state
                .authorization
                .authorize(&fx.record.key, Utc::now(), None),
            Err(AuthError::InvalidKey)
        ));
        let auth = fx
            .state
            .authorization
            .authorize(&second.key, Utc::now(), None)
            .unwrap();
        let plan = fx
            .state
            .delivery
            .stream(&auth.token, None, Utc::now(), None)
            .unwrap();
        assert_eq!(fs::read(&plan.path).unwrap(), replacement);
        assert_eq!(fx.state.sessions.active_count(), 1);
    }
}
