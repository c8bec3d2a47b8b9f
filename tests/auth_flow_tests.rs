//! 登录、刷新、登出与账户锁定的端到端流程

use sentinel_core::{
    auth::InvalidReason,
    models::{AuditFilter, AuthEventKind, IncidentKind, Permission, Role, SessionStatus, TokenType},
};

mod common;
use common::{create_test_app, origin, PASSWORD};

#[test]
fn test_login_round_trip() {
    let app = create_test_app();
    let user = app.create_user("alice", &[Role::Viewer]);
    let from = origin("10.0.0.10");

    let login = app
        .state
        .auth
        .login("alice", PASSWORD, &from)
        .unwrap()
        .expect("login should succeed");
    assert_eq!(login.user.id, user.id);
    assert_eq!(login.tokens.token_type, "Bearer");

    // 会话有效
    let session = app
        .state
        .sessions
        .validate_session(&login.session_token, false)
        .unwrap()
        .unwrap();
    assert_eq!(session.user_id, user.id);
    assert!(app
        .state
        .sessions
        .validate_csrf(&login.session_token, &login.csrf_token)
        .unwrap());

    // 访问令牌有效
    let claims = app
        .state
        .tokens
        .validate(&login.tokens.access_token, Some(TokenType::Access))
        .unwrap()
        .claims()
        .unwrap();
    assert_eq!(claims.user_id(), Some(user.id));

    // 会话与令牌都可以驱动权限判断
    assert!(app
        .state
        .auth
        .authorize_session(&login.session_token, Permission::TemplateRead, None, None)
        .unwrap());
    assert!(!app
        .state
        .auth
        .authorize_token(&login.tokens.access_token, Permission::UserManage, None, None)
        .unwrap());

    let success = app
        .state
        .audit
        .search(&AuditFilter {
            kind: Some(AuthEventKind::LoginSuccess),
            user_id: Some(user.id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].event.origin_ip.as_deref(), Some("10.0.0.10"));
}

#[test]
fn test_unknown_user_and_wrong_password_are_refused() {
    let app = create_test_app();
    app.create_user("alice", &[Role::Viewer]);

    assert!(app
        .state
        .auth
        .login("nobody", PASSWORD, &origin("10.0.0.11"))
        .unwrap()
        .is_none());
    assert!(app
        .state
        .auth
        .login("alice", "Wrong!Passw0rd", &origin("10.0.0.11"))
        .unwrap()
        .is_none());

    assert_eq!(app.count_events(AuthEventKind::LoginFailure), 2);
    assert_eq!(app.count_events(AuthEventKind::SessionCreated), 0);
}

#[test]
fn test_lockout_after_five_failures_then_unlock() {
    let app = create_test_app();
    let admin = app.create_user("root", &[Role::Administrator]);
    let user = app.create_user("bob", &[Role::Operator]);
    let from = origin("198.51.100.20");

    let before = app.state.auth.login("bob", PASSWORD, &from).unwrap().unwrap();

    for attempt in 1..=5 {
        assert!(app
            .state
            .auth
            .login("bob", "Wrong!Passw0rd", &from)
            .unwrap()
            .is_none());
        let current = app.state.credentials.get_user(user.id).unwrap();
        assert_eq!(current.failed_login_attempts, attempt);
        assert_eq!(current.is_locked, attempt == 5);
    }

    // 锁定后正确密码也被拒绝
    assert!(app.state.auth.login("bob", PASSWORD, &from).unwrap().is_none());
    assert_eq!(app.count_events(AuthEventKind::AccountLocked), 1);

    let locked_failure = app
        .state
        .audit
        .search(&AuditFilter {
            kind: Some(AuthEventKind::LoginFailure),
            limit: Some(1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(
        locked_failure[0].event.error_message.as_deref(),
        Some("Account locked")
    );

    // 已有会话被锁定，令牌被撤销
    let sessions = app.state.sessions.user_sessions(user.id, false).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Locked);
    assert_eq!(
        app.state
            .tokens
            .validate(&before.tokens.access_token, None)
            .unwrap()
            .reason(),
        Some(InvalidReason::Revoked)
    );

    // 同一来源的连续失败触发暴力破解告警
    let incidents = app.state.monitor.incidents(None).unwrap();
    assert!(incidents.iter().any(|i| i.kind == IncidentKind::BruteForce));

    let unlocked = app
        .state
        .admin
        .unlock_user(&admin, user.id, "verified by phone")
        .unwrap();
    assert!(!unlocked.is_locked);
    assert_eq!(unlocked.failed_login_attempts, 0);
    assert_eq!(app.count_events(AuthEventKind::AccountUnlocked), 1);

    assert!(app.state.auth.login("bob", PASSWORD, &from).unwrap().is_some());
}

#[test]
fn test_refresh_rotates_the_refresh_token() {
    let app = create_test_app();
    app.create_user("carol", &[Role::Operator]);
    let from = origin("10.0.0.12");
    let login = app.state.auth.login("carol", PASSWORD, &from).unwrap().unwrap();

    let pair = app
        .state
        .auth
        .refresh(&login.tokens.refresh_token, &from)
        .unwrap()
        .expect("refresh should succeed");
    assert_ne!(pair.refresh_token, login.tokens.refresh_token);

    // 旧刷新令牌只能使用一次
    assert_eq!(
        app.state
            .tokens
            .validate(&login.tokens.refresh_token, Some(TokenType::Refresh))
            .unwrap()
            .reason(),
        Some(InvalidReason::Revoked)
    );
    assert!(app
        .state
        .auth
        .refresh(&login.tokens.refresh_token, &from)
        .unwrap()
        .is_none());

    // 访问令牌不能当作刷新令牌
    assert!(app
        .state
        .auth
        .refresh(&pair.access_token, &from)
        .unwrap()
        .is_none());

    assert!(app
        .state
        .tokens
        .validate(&pair.access_token, Some(TokenType::Access))
        .unwrap()
        .is_valid());
}

#[test]
fn test_logout_revokes_session_and_refresh_token() {
    let app = create_test_app();
    let user = app.create_user("dave", &[Role::Viewer]);
    let from = origin("10.0.0.13");
    let login = app.state.auth.login("dave", PASSWORD, &from).unwrap().unwrap();

    assert!(app
        .state
        .auth
        .logout(&login.session_token, Some(&login.tokens.refresh_token), &from)
        .unwrap());

    assert!(app
        .state
        .sessions
        .validate_session(&login.session_token, false)
        .unwrap()
        .is_none());
    assert!(!app
        .state
        .tokens
        .validate(&login.tokens.refresh_token, None)
        .unwrap()
        .is_valid());

    // 重复登出不产生新事件
    assert!(!app
        .state
        .auth
        .logout(&login.session_token, None, &from)
        .unwrap());

    let logout = app
        .state
        .audit
        .search(&AuditFilter {
            kind: Some(AuthEventKind::Logout),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(logout.len(), 1);
    assert_eq!(logout[0].event.user_id, Some(user.id));
    assert_eq!(logout[0].event.username.as_deref(), Some("dave"));
    assert_eq!(logout[0].event.session_id, Some(login.session_id));
}

#[test]
fn test_forced_password_change_blocks_login_until_changed() {
    let app = create_test_app();
    let admin = app.create_user("root", &[Role::Administrator]);
    let user = app.create_user("erin", &[Role::Viewer]);
    let from = origin("10.0.0.14");

    let old_login = app.state.auth.login("erin", PASSWORD, &from).unwrap().unwrap();

    app.state
        .admin
        .reset_password(&admin, user.id, "Temp0rary!Pass", true)
        .unwrap();

    // 重置会收回已有会话
    assert!(app
        .state
        .sessions
        .validate_session(&old_login.session_token, false)
        .unwrap()
        .is_none());

    assert!(app
        .state
        .auth
        .login("erin", "Temp0rary!Pass", &from)
        .unwrap()
        .is_none());
    let expired = app
        .state
        .audit
        .search(&AuditFilter {
            kind: Some(AuthEventKind::LoginFailure),
            limit: Some(1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(expired[0].event.error_message.as_deref(), Some("Password expired"));

    let current = app.state.credentials.get_user(user.id).unwrap();
    app.state
        .admin
        .change_own_password(&current, "Temp0rary!Pass", "N3w!Passw0rd", None)
        .unwrap();

    assert!(app
        .state
        .auth
        .login("erin", "N3w!Passw0rd", &from)
        .unwrap()
        .is_some());
}
