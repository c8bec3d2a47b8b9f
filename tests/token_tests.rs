//! 令牌签发、撤销与密钥轮换

use chrono::Duration;
use sentinel_core::{
    auth::InvalidReason,
    clock::Clock,
    models::{AuthEventKind, Role, TokenType},
};

mod common;
use common::create_test_app;

fn kid_of(token: &str) -> String {
    jsonwebtoken::decode_header(token).unwrap().kid.unwrap()
}

#[test]
fn test_issued_pair_carries_role_snapshot() {
    let app = create_test_app();
    let user = app.create_user("alice", &[Role::Auditor]);

    let pair = app.state.tokens.issue_token_pair(&user).unwrap();
    assert_eq!(pair.expires_in, 900);

    let access = app
        .state
        .tokens
        .validate(&pair.access_token, Some(TokenType::Access))
        .unwrap()
        .claims()
        .unwrap();
    assert_eq!(access.roles, vec!["auditor".to_string()]);
    assert!(access.permissions.contains(&"audit:read".to_string()));
    assert_eq!(access.exp - access.iat, 900);

    let refresh = app
        .state
        .tokens
        .validate(&pair.refresh_token, Some(TokenType::Refresh))
        .unwrap()
        .claims()
        .unwrap();
    assert!(refresh.roles.is_empty());
    assert_eq!(refresh.exp - refresh.iat, 7 * 86400);

    assert_eq!(
        app.state
            .tokens
            .validate(&pair.access_token, Some(TokenType::Refresh))
            .unwrap()
            .reason(),
        Some(InvalidReason::WrongType)
    );
}

#[test]
fn test_expiry_honours_clock_skew() {
    let app = create_test_app();
    let user = app.create_user("bob", &[Role::Viewer]);
    let token = app.state.tokens.issue_access_token(&user).unwrap();

    app.clock.advance(Duration::seconds(900 + 20));
    assert!(app.state.tokens.validate(&token, None).unwrap().is_valid());

    app.clock.advance(Duration::seconds(20));
    assert_eq!(
        app.state.tokens.validate(&token, None).unwrap().reason(),
        Some(InvalidReason::Expired)
    );
}

#[test]
fn test_garbage_and_spliced_tokens_are_rejected() {
    let app = create_test_app();
    let alice = app.create_user("carol", &[Role::Viewer]);
    let mallory = app.create_user("mallory", &[Role::Viewer]);

    assert_eq!(
        app.state.tokens.validate("not-a-jwt", None).unwrap().reason(),
        Some(InvalidReason::Malformed)
    );

    // 将一个令牌的签名拼接到另一个令牌上
    let a = app.state.tokens.issue_access_token(&alice).unwrap();
    let m = app.state.tokens.issue_access_token(&mallory).unwrap();
    let (a_body, _) = a.rsplit_once('.').unwrap();
    let (_, m_sig) = m.rsplit_once('.').unwrap();
    let spliced = format!("{}.{}", a_body, m_sig);
    assert_eq!(
        app.state.tokens.validate(&spliced, None).unwrap().reason(),
        Some(InvalidReason::BadSignature)
    );
}

#[test]
fn test_revocation_single_and_per_user() {
    let app = create_test_app();
    let user = app.create_user("dave", &[Role::Operator]);
    let other = app.create_user("erin", &[Role::Operator]);

    let first = app.state.tokens.issue_token_pair(&user).unwrap();
    let second = app.state.tokens.issue_token_pair(&user).unwrap();
    let others = app.state.tokens.issue_token_pair(&other).unwrap();

    let jti = app
        .state
        .tokens
        .validate(&first.access_token, None)
        .unwrap()
        .claims()
        .unwrap()
        .token_id()
        .unwrap();
    assert!(app.state.tokens.revoke(jti, "test").unwrap());
    // 重复撤销返回 false
    assert!(!app.state.tokens.revoke(jti, "test").unwrap());
    assert_eq!(
        app.state.tokens.validate(&first.access_token, None).unwrap().reason(),
        Some(InvalidReason::Revoked)
    );

    let revoked = app
        .state
        .tokens
        .revoke_all_for_user(user.id, Some(TokenType::Refresh))
        .unwrap();
    assert_eq!(revoked, 2);
    assert!(!app.state.tokens.validate(&second.refresh_token, None).unwrap().is_valid());
    assert!(app.state.tokens.validate(&second.access_token, None).unwrap().is_valid());

    assert_eq!(app.state.tokens.revoke_all_for_user(user.id, None).unwrap(), 1);
    assert!(!app.state.tokens.validate(&second.access_token, None).unwrap().is_valid());

    // 其他用户不受影响
    assert!(app.state.tokens.validate(&others.access_token, None).unwrap().is_valid());
    assert!(app.state.tokens.validate(&others.refresh_token, None).unwrap().is_valid());

    assert_eq!(app.count_events(AuthEventKind::TokenRevoked), 3);
}

#[test]
fn test_token_without_issued_record_is_untracked() {
    let app = create_test_app();
    let user = app.create_user("frank", &[Role::Viewer]);
    let token = app.state.tokens.issue_access_token(&user).unwrap();

    // 直接在存储层抹掉签发记录
    let removed = app
        .store
        .delete_expired_tokens(app.clock.now() + Duration::days(30))
        .unwrap();
    assert_eq!(removed.len(), 1);

    assert_eq!(
        app.state.tokens.validate(&token, None).unwrap().reason(),
        Some(InvalidReason::Untracked)
    );
}

#[test]
fn test_rotation_keeps_old_tokens_valid_through_grace() {
    let app = create_test_app();
    let user = app.create_user("grace", &[Role::Viewer]);

    let old_kid = app.state.tokens.active_kid().unwrap();
    let before = app.state.tokens.issue_access_token(&user).unwrap();
    assert_eq!(kid_of(&before), old_kid);

    let new_kid = app.state.tokens.rotate_keys().unwrap();
    assert_ne!(new_kid, old_kid);
    assert_eq!(app.state.tokens.active_kid(), Some(new_kid.clone()));

    let after = app.state.tokens.issue_access_token(&user).unwrap();
    assert_eq!(kid_of(&after), new_kid);

    // 宽限期内两把公钥都可用
    assert!(app.state.tokens.validate(&before, None).unwrap().is_valid());
    let jwks = app.state.tokens.jwks();
    assert_eq!(jwks.keys.len(), 2);
    assert!(jwks.find(&old_kid).is_some());
    assert!(jwks.find(&new_kid).is_some());
    assert_eq!(app.count_events(AuthEventKind::KeyRotated), 2);

    // 宽限期结束后旧密钥被移除
    app.clock.advance(Duration::seconds(3601));
    app.state.tokens.cleanup_expired_tokens().unwrap();
    let jwks = app.state.tokens.jwks();
    assert_eq!(jwks.keys.len(), 1);
    assert!(jwks.find(&old_kid).is_none());
    assert_eq!(
        app.state.tokens.validate(&before, None).unwrap().reason(),
        Some(InvalidReason::UnknownKey)
    );
}

#[test]
fn test_rotate_if_due_follows_the_interval() {
    let app = create_test_app();
    assert!(app.state.tokens.rotate_if_due().unwrap().is_none());

    app.clock.advance(Duration::seconds(86400));
    let kid = app.state.tokens.rotate_if_due().unwrap();
    assert!(kid.is_some());
    assert_eq!(app.state.tokens.active_kid(), kid);
}

#[test]
fn test_cleanup_drops_expired_records() {
    let app = create_test_app();
    let user = app.create_user("heidi", &[Role::Viewer]);
    app.state.tokens.issue_token_pair(&user).unwrap();

    // 访问令牌已过期，刷新令牌仍有效
    app.clock.advance(Duration::hours(1));
    assert_eq!(app.state.tokens.cleanup_expired_tokens().unwrap(), 1);

    app.clock.advance(Duration::days(8));
    assert_eq!(app.state.tokens.cleanup_expired_tokens().unwrap(), 1);
    assert_eq!(app.state.tokens.cleanup_expired_tokens().unwrap(), 0);
}
