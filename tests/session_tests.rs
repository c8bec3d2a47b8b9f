//! 会话并发上限、过期与持久化

use chrono::Duration;
use sentinel_core::{
    clock::ManualClock,
    models::{AuthEventKind, Role, SessionStatus},
    repository::{FileStore, SharedStore},
    services::session_service::REASON_CONCURRENT_LIMIT,
};
use std::sync::Arc;

mod common;
use common::{create_test_app, create_test_app_with, create_test_config, origin};

#[test]
fn test_fourth_session_revokes_the_oldest() {
    let app = create_test_app();
    let user = app.create_user("alice", &[Role::Operator]);

    let mut sessions = Vec::new();
    for i in 0..3 {
        sessions.push(
            app.state
                .sessions
                .create_session(&user, &origin(&format!("10.0.1.{}", i)))
                .unwrap(),
        );
        app.clock.advance(Duration::seconds(1));
    }
    assert_eq!(app.state.sessions.user_sessions(user.id, true).unwrap().len(), 3);

    let fourth = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.1.9"))
        .unwrap();

    let active = app.state.sessions.user_sessions(user.id, true).unwrap();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|s| s.id != sessions[0].id));
    assert!(active.iter().any(|s| s.id == fourth.id));

    assert!(app
        .state
        .sessions
        .validate_session(&sessions[0].token, false)
        .unwrap()
        .is_none());
    let oldest = app
        .state
        .sessions
        .user_sessions(user.id, false)
        .unwrap()
        .into_iter()
        .find(|s| s.id == sessions[0].id)
        .unwrap();
    assert_eq!(oldest.status, SessionStatus::Revoked);
    assert_eq!(oldest.revocation_reason(), Some(REASON_CONCURRENT_LIMIT));
    assert_eq!(app.count_events(AuthEventKind::SessionRevoked), 1);
}

#[test]
fn test_session_expires_at_ttl_even_when_active() {
    let app = create_test_app();
    let user = app.create_user("bob", &[Role::Viewer]);
    let session = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.2.1"))
        .unwrap();

    // 每小时活动一次，空闲超时不会触发
    for _ in 0..7 {
        app.clock.advance(Duration::hours(1));
        assert!(app
            .state
            .sessions
            .validate_session(&session.token, true)
            .unwrap()
            .is_some());
    }

    app.clock.advance(Duration::hours(1));
    assert!(app
        .state
        .sessions
        .validate_session(&session.token, true)
        .unwrap()
        .is_none());

    let stored = &app.state.sessions.user_sessions(user.id, false).unwrap()[0];
    assert_eq!(stored.status, SessionStatus::Expired);
    assert_eq!(stored.revocation_reason(), Some("ttl_elapsed"));
    assert_eq!(app.count_events(AuthEventKind::SessionExpired), 1);
}

#[test]
fn test_idle_session_expires_and_is_swept() {
    let app = create_test_app();
    let user = app.create_user("carol", &[Role::Viewer]);
    let idle = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.3.1"))
        .unwrap();
    let busy = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.3.2"))
        .unwrap();

    app.clock.advance(Duration::minutes(90));
    assert!(app
        .state
        .sessions
        .validate_session(&busy.token, true)
        .unwrap()
        .is_some());
    app.clock.advance(Duration::minutes(31));

    assert_eq!(app.state.sessions.sweep_expired().unwrap(), 1);
    assert_eq!(app.state.sessions.active_session_count(), 1);
    assert!(app
        .state
        .sessions
        .validate_session(&idle.token, false)
        .unwrap()
        .is_none());

    let idle_stored = app
        .state
        .sessions
        .user_sessions(user.id, false)
        .unwrap()
        .into_iter()
        .find(|s| s.id == idle.id)
        .unwrap();
    assert_eq!(idle_stored.revocation_reason(), Some("activity_timeout"));
}

#[test]
fn test_extend_session_moves_absolute_expiry() {
    let app = create_test_app();
    let user = app.create_user("dave", &[Role::Viewer]);
    let session = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.4.1"))
        .unwrap();

    app.clock.advance(Duration::hours(1));
    let extended = app
        .state
        .sessions
        .extend_session(&session.token, 24)
        .unwrap()
        .unwrap();
    assert!(extended.expires_at > session.expires_at);
    assert_eq!(app.count_events(AuthEventKind::SessionExtended), 1);

    assert!(app
        .state
        .sessions
        .extend_session("no-such-token", 24)
        .unwrap()
        .is_none());
}

#[test]
fn test_extend_session_rejects_out_of_range_hours() {
    let app = create_test_app();
    let user = app.create_user("dora", &[Role::Viewer]);
    let session = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.4.2"))
        .unwrap();

    for hours in [0, -1, 25, i64::MAX] {
        let err = app
            .state
            .sessions
            .extend_session(&session.token, hours)
            .unwrap_err();
        assert_eq!(err.code(), "validation_failed");
        assert_eq!(err.field_errors()[0].field, "hours");
    }

    // 被拒绝的续期不改变会话
    let current = app
        .state
        .sessions
        .validate_session(&session.token, false)
        .unwrap()
        .unwrap();
    assert_eq!(current.expires_at, session.expires_at);
    assert_eq!(app.count_events(AuthEventKind::SessionExtended), 0);

    // 上限本身是合法的
    assert!(app
        .state
        .sessions
        .extend_session(&session.token, 24)
        .unwrap()
        .is_some());
}

#[test]
fn test_extend_session_ignores_ended_sessions() {
    let app = create_test_app();
    let user = app.create_user("eve", &[Role::Viewer]);
    let revoked = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.4.3"))
        .unwrap();
    let idle = app
        .state
        .sessions
        .create_session(&user, &origin("10.0.4.4"))
        .unwrap();

    assert!(app.state.sessions.revoke(revoked.id, "manual").unwrap());
    assert!(app
        .state
        .sessions
        .extend_session(&revoked.token, 4)
        .unwrap()
        .is_none());

    app.clock.advance(Duration::hours(3));
    assert!(app
        .state
        .sessions
        .extend_session(&idle.token, 4)
        .unwrap()
        .is_none());

    let stored = app
        .state
        .sessions
        .user_sessions(user.id, false)
        .unwrap()
        .into_iter()
        .find(|s| s.id == idle.id)
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);
    assert_eq!(app.count_events(AuthEventKind::SessionExtended), 0);
}

#[test]
fn test_locked_user_cannot_open_session() {
    let app = create_test_app();
    let admin = app.create_user("root", &[Role::Administrator]);
    let user = app.create_user("erin", &[Role::Viewer]);

    let locked = app.state.admin.lock_user(&admin, user.id, "investigation").unwrap();
    let err = app
        .state
        .sessions
        .create_session(&locked, &origin("10.0.5.1"))
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
}

#[test]
fn test_active_sessions_survive_restart_on_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();

    let (user, token) = {
        let store: SharedStore = Arc::new(FileStore::open(dir.path()).unwrap());
        let app = create_test_app_with(create_test_config(), store, clock.clone());
        let user = app.create_user("frank", &[Role::Viewer]);
        let session = app
            .state
            .sessions
            .create_session(&user, &origin("10.0.6.1"))
            .unwrap();
        (user, session.token)
    };

    let store: SharedStore = Arc::new(FileStore::open(dir.path()).unwrap());
    let app = create_test_app_with(create_test_config(), store, clock);
    let session = app
        .state
        .sessions
        .validate_session(&token, false)
        .unwrap()
        .expect("session should be restored");
    assert_eq!(session.user_id, user.id);
    assert!(app.state.audit.verify_integrity(None, None).unwrap().passed);
}
