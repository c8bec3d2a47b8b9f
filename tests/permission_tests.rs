//! 权限判定：角色、资源归属、上下文规则与越权监控

use chrono::{TimeZone, Utc};
use sentinel_core::{
    models::{AuditFilter, AuthEventKind, IncidentKind, Permission, Role},
    services::PermissionContext,
};

mod common;
use common::create_test_app;

#[test]
fn test_owner_context_grants_beyond_role() {
    let app = create_test_app();
    let viewer = app.create_user("alice", &[Role::Viewer]);
    let someone_else = app.create_user("bob", &[Role::Viewer]);

    assert!(!app
        .state
        .permissions
        .check(&viewer, Permission::TemplateUpdate, Some("template:42"), None)
        .unwrap());

    let own = PermissionContext::owned_by(viewer.id);
    assert!(app
        .state
        .permissions
        .check(&viewer, Permission::TemplateUpdate, Some("template:42"), Some(&own))
        .unwrap());

    let foreign = PermissionContext::owned_by(someone_else.id);
    assert!(!app
        .state
        .permissions
        .check(&viewer, Permission::TemplateUpdate, Some("template:43"), Some(&foreign))
        .unwrap());

    let granted = app
        .state
        .audit
        .search(&AuditFilter {
            kind: Some(AuthEventKind::PermissionGranted),
            user_id: Some(viewer.id),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].event.resource.as_deref(), Some("template:42"));
    assert_eq!(granted[0].event.metadata["reason"], "resource_owner");
}

#[test]
fn test_ip_allow_list_and_custom_rule() {
    let app = create_test_app();
    let operator = app.create_user("carol", &[Role::Operator]);

    let office = PermissionContext::from_ip("10.1.0.5").allow_ips(&["10.1.0.5", "10.1.0.6"]);
    assert!(app
        .state
        .permissions
        .check(&operator, Permission::WorkflowExecute, None, Some(&office))
        .unwrap());

    let cafe = PermissionContext::from_ip("203.0.113.9").allow_ips(&["10.1.0.5"]);
    assert!(!app
        .state
        .permissions
        .check(&operator, Permission::WorkflowExecute, None, Some(&cafe))
        .unwrap());

    let refuse = PermissionContext::default().with_rule(|user, _| user.username != "carol");
    assert!(!app
        .state
        .permissions
        .check(&operator, Permission::WorkflowExecute, None, Some(&refuse))
        .unwrap());

    let denied = app
        .state
        .audit
        .search(&AuditFilter {
            kind: Some(AuthEventKind::PermissionDenied),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(denied.len(), 2);
    assert_eq!(denied[1].event.origin_ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(denied[1].event.metadata["reason"], "ip_not_allowed");
    assert_eq!(denied[0].event.metadata["reason"], "custom_rule");
}

#[test]
fn test_business_hours_rule_follows_the_clock() {
    let app = create_test_app();
    let operator = app.create_user("dave", &[Role::Operator]);
    let ctx = PermissionContext::default().business_hours();

    // 周三上午
    app.clock.set(Utc.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap());
    assert!(app
        .state
        .permissions
        .evaluate(&operator, Permission::FileUpload, Some(&ctx))
        .is_granted());

    // 周三晚上
    app.clock.set(Utc.with_ymd_and_hms(2024, 3, 6, 20, 0, 0).unwrap());
    assert_eq!(
        app.state
            .permissions
            .evaluate(&operator, Permission::FileUpload, Some(&ctx))
            .reason(),
        "outside_business_hours"
    );

    // 周六
    app.clock.set(Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap());
    assert!(!app
        .state
        .permissions
        .evaluate(&operator, Permission::FileUpload, Some(&ctx))
        .is_granted());
}

#[test]
fn test_locked_user_is_denied_even_for_owned_resources() {
    let app = create_test_app();
    let admin = app.create_user("root", &[Role::Administrator]);
    let user = app.create_user("erin", &[Role::Operator]);

    let locked = app.state.admin.lock_user(&admin, user.id, "investigation").unwrap();
    let decision = app.state.permissions.evaluate(
        &locked,
        Permission::TemplateRead,
        Some(&PermissionContext::owned_by(locked.id)),
    );
    assert!(!decision.is_granted());
    assert_eq!(decision.reason(), "account_locked");
}

#[test]
fn test_only_administrators_manage_roles() {
    let app = create_test_app();
    let admin = app.create_user("root", &[Role::Administrator]);
    let operator = app.create_user("frank", &[Role::Operator]);
    let target = app.create_user("grace", &[Role::Viewer]);

    let err = app
        .state
        .admin
        .assign_role(&operator, target.id, Role::Administrator)
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
    let err = app
        .state
        .admin
        .assign_role(&operator, operator.id, Role::Administrator)
        .unwrap_err();
    assert_eq!(err.code(), "forbidden");
    assert!(!app
        .state
        .credentials
        .get_user(target.id)
        .unwrap()
        .has_role(Role::Administrator));

    // 管理员分配角色后，旧的访问令牌失效
    let token = app.state.tokens.issue_access_token(&target).unwrap();
    let promoted = app
        .state
        .admin
        .assign_role(&admin, target.id, Role::Auditor)
        .unwrap();
    assert!(promoted.has_role(Role::Auditor));
    assert!(!app.state.tokens.validate(&token, None).unwrap().is_valid());
    assert!(app
        .state
        .permissions
        .check(&promoted, Permission::AuditRead, None, None)
        .unwrap());
}

#[test]
fn test_repeated_denials_raise_one_flooding_incident() {
    let app = create_test_app();
    let viewer = app.create_user("heidi", &[Role::Viewer]);

    for i in 0..12 {
        let resource = format!("workflow:{}", i);
        assert!(!app
            .state
            .permissions
            .check(&viewer, Permission::WorkflowDelete, Some(&resource), None)
            .unwrap());
    }

    let incidents = app.state.monitor.incidents(None).unwrap();
    let flooding: Vec<_> = incidents
        .iter()
        .filter(|i| i.kind == IncidentKind::PermissionFlooding)
        .collect();
    assert_eq!(flooding.len(), 1);
    assert_eq!(flooding[0].user_id, Some(viewer.id));
    assert_eq!(flooding[0].evidence["violations"], 10);
}

#[test]
fn test_has_any_and_has_all() {
    let app = create_test_app();
    let auditor = app.create_user("ivan", &[Role::Auditor]);
    let perms = &app.state.permissions;

    assert!(perms
        .has_any(&auditor, &[Permission::UserManage, Permission::AuditRead], None)
        .unwrap());
    assert!(!perms
        .has_all(&auditor, &[Permission::AuditRead, Permission::SecurityManage], None)
        .unwrap());
    assert!(perms.has_role_at_least(&auditor, Role::Viewer));
    assert!(!perms.has_role_at_least(&auditor, Role::Operator));
}
