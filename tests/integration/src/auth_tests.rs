//! Authorization cache integration tests.
//!
//! Drive the user, role and strategy caches through a wired registry so
//! group membership flows from the user cache into strategy checks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use naming_control::cache::RoleFilter;
use naming_control::core::model::{
    PolicyAction, Principal, ResourceEntry, ResourceLabel, ResourceType, Role, StrategyDetail,
    StrategyResource, User, UserGroup, UserRoleType,
};
use naming_control::prelude::*;

async fn registry(store: &Arc<MemoryStore>) -> Arc<CacheRegistry> {
    let registry = CacheRegistry::builder()
        .store(Arc::clone(store) as Arc<dyn Store>)
        .revision_workers(2)
        .build()
        .expect("registry should build");
    registry.initialize().expect("registry should initialize");
    registry.update_all().await.expect("first load");
    Arc::new(registry)
}

fn strategy(id: &str, action: PolicyAction, principals: Vec<Principal>, resources: Vec<StrategyResource>) -> StrategyDetail {
    StrategyDetail {
        id: id.into(),
        name: id.into(),
        action,
        principals,
        resources,
        revision: format!("{id}-rev"),
        valid: true,
        ..Default::default()
    }
}

fn user(id: &str, owner: &str, user_type: UserRoleType) -> User {
    User {
        id: id.into(),
        name: format!("{id}-name"),
        owner: owner.into(),
        user_type,
        valid: true,
        ..Default::default()
    }
}

// === Strategy Tests ===

#[tokio::test]
async fn wildcard_namespace_grant_and_revoke() {
    let store = Arc::new(MemoryStore::new());
    let mut rule = strategy(
        "rule-1",
        PolicyAction::Allow,
        vec![Principal::user("user-1")],
        vec![StrategyResource::new(ResourceType::Namespaces, "*")],
    );
    store.put_strategy(rule.clone());
    let registry = registry(&store).await;
    let strategies = registry.strategies().unwrap();

    let principal = Principal::user("user-1");
    let entry = ResourceEntry::new(ResourceType::Namespaces, "namespace-1");
    assert!(strategies.is_resource_editable(&principal, &entry));
    assert!(strategies.is_resource_link_strategy(ResourceType::Namespaces, "*"));

    store.advance(Duration::from_secs(10));
    rule.valid = false;
    store.put_strategy(rule);
    registry.update_all().await.unwrap();

    assert!(!strategies.is_resource_editable(&principal, &entry));
    assert!(!strategies.is_resource_link_strategy(ResourceType::Namespaces, "*"));
    assert_eq!(strategies.principals_count(), 0);
    registry.close();
}

#[tokio::test]
async fn deny_beats_allow_across_user_and_group() {
    let store = Arc::new(MemoryStore::new());
    store.put_user(user("user-1", "owner-1", UserRoleType::Sub));
    store.put_group(UserGroup {
        id: "group-1".into(),
        name: "ops".into(),
        user_ids: HashSet::from(["user-1".to_string()]),
        valid: true,
        ..Default::default()
    });
    store.put_strategy(strategy(
        "allow-user",
        PolicyAction::Allow,
        vec![Principal::user("user-1")],
        vec![StrategyResource::new(ResourceType::Services, "svc-1")],
    ));
    store.put_strategy(strategy(
        "deny-group",
        PolicyAction::Deny,
        vec![Principal::group("group-1")],
        vec![StrategyResource::new(ResourceType::Services, "svc-1")],
    ));
    let registry = registry(&store).await;
    let strategies = registry.strategies().unwrap();
    let users = registry.users().unwrap();
    assert!(users.is_user_in_group("user-1", "group-1"));

    let principal = Principal::user("user-1");
    let entry = ResourceEntry::new(ResourceType::Services, "svc-1");
    // The user alone is allowed; through its group it is denied.
    assert_eq!(strategies.hint(&principal, &entry), PolicyAction::Allow);
    assert!(!strategies.is_resource_editable(&principal, &entry));

    // Leaving the group lifts the deny.
    store.advance(Duration::from_secs(10));
    store.put_group(UserGroup {
        id: "group-1".into(),
        name: "ops".into(),
        valid: true,
        ..Default::default()
    });
    registry.update_all().await.unwrap();
    assert!(!users.is_user_in_group("user-1", "group-1"));
    assert!(strategies.is_resource_editable(&principal, &entry));
    registry.close();
}

#[tokio::test]
async fn group_grant_reaches_members() {
    let store = Arc::new(MemoryStore::new());
    store.put_user(user("user-2", "owner-1", UserRoleType::Sub));
    store.put_group(UserGroup {
        id: "group-2".into(),
        name: "dev".into(),
        user_ids: HashSet::from(["user-2".to_string()]),
        valid: true,
        ..Default::default()
    });
    store.put_strategy(strategy(
        "group-allow",
        PolicyAction::Allow,
        vec![Principal::group("group-2")],
        vec![StrategyResource::new(ResourceType::ConfigGroups, "cfg-1")],
    ));
    let registry = registry(&store).await;
    let strategies = registry.strategies().unwrap();

    let entry = ResourceEntry::new(ResourceType::ConfigGroups, "cfg-1");
    assert!(strategies.is_resource_editable(&Principal::user("user-2"), &entry));
    assert!(!strategies.is_resource_editable(&Principal::user("user-3"), &entry));
    assert_eq!(strategies.hint(&Principal::user("user-2"), &entry), PolicyAction::Deny);
    registry.close();
}

#[tokio::test]
async fn label_grants_apply_only_without_direct_match() {
    let store = Arc::new(MemoryStore::new());
    let principal = Principal::user("user-1");
    let mut labelled = strategy("label-allow", PolicyAction::Allow, vec![principal.clone()], Vec::new());
    labelled.resource_labels = vec![ResourceLabel {
        res_type: ResourceType::Services,
        key: "env".into(),
        value: "dev".into(),
    }];
    store.put_strategy(labelled);
    store.put_strategy(strategy(
        "direct-deny",
        PolicyAction::Deny,
        vec![principal.clone()],
        vec![StrategyResource::new(ResourceType::Services, "locked")],
    ));
    let registry = registry(&store).await;
    let strategies = registry.strategies().unwrap();

    let open = ResourceEntry::new(ResourceType::Services, "orders").with_label("env", "dev");
    let locked = ResourceEntry::new(ResourceType::Services, "locked").with_label("env", "dev");
    let prod = ResourceEntry::new(ResourceType::Services, "orders").with_label("env", "prod");

    assert_eq!(strategies.hint(&principal, &open), PolicyAction::Allow);
    assert_eq!(strategies.hint(&principal, &locked), PolicyAction::Deny);
    assert_eq!(strategies.hint(&principal, &prod), PolicyAction::Deny);
    registry.close();
}

#[tokio::test]
async fn principal_change_moves_the_grant() {
    let store = Arc::new(MemoryStore::new());
    let resources = vec![StrategyResource::new(ResourceType::Services, "svc-1")];
    store.put_strategy(strategy("s-1", PolicyAction::Allow, vec![Principal::user("a")], resources.clone()));
    let registry = registry(&store).await;
    let strategies = registry.strategies().unwrap();
    let entry = ResourceEntry::new(ResourceType::Services, "svc-1");
    assert_eq!(strategies.hint(&Principal::user("a"), &entry), PolicyAction::Allow);

    store.advance(Duration::from_secs(10));
    store.put_strategy(strategy("s-1", PolicyAction::Allow, vec![Principal::user("b")], resources));
    registry.update_all().await.unwrap();

    assert_eq!(strategies.hint(&Principal::user("a"), &entry), PolicyAction::Deny);
    assert_eq!(strategies.hint(&Principal::user("b"), &entry), PolicyAction::Allow);
    assert!(strategies
        .get_principal_policies(PolicyAction::Allow, &Principal::user("a"))
        .is_empty());
    assert_eq!(strategies.principals_count(), 1);
    registry.close();
}

#[tokio::test]
async fn query_pages_newest_first() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        let mut s = strategy(
            &format!("s-{i}"),
            PolicyAction::Allow,
            vec![Principal::user("user-1")],
            vec![StrategyResource::new(ResourceType::Services, format!("svc-{i}"))],
        );
        s.owner = "owner-1".into();
        s.default = i == 0;
        store.put_strategy(s);
        store.advance(Duration::from_secs(1));
    }
    let registry = registry(&store).await;
    let strategies = registry.strategies().unwrap();

    let query = StrategyQuery {
        owner: Some("owner-1".into()),
        offset: 1,
        limit: 2,
        ..Default::default()
    };
    let (total, page) = strategies.query(&query);
    assert_eq!(total, 5);
    let ids: Vec<&str> = page.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["s-3", "s-2"]);

    let query = StrategyQuery {
        resource: Some((ResourceType::Services, "svc-4".into())),
        ..Default::default()
    };
    assert_eq!(strategies.query(&query).0, 1);

    let query = StrategyQuery::default().with_predicate(|s| !s.default);
    assert_eq!(strategies.query(&query).0, 4);
    registry.close();
}

// === User and Role Tests ===

#[tokio::test]
async fn users_found_by_owner_and_name() {
    let store = Arc::new(MemoryStore::new());
    store.put_user(user("main", "", UserRoleType::Owner));
    store.put_user(user("sub", "main", UserRoleType::Sub));
    let registry = registry(&store).await;
    let users = registry.users().unwrap();

    assert_eq!(users.get_user_by_name("", "main-name").unwrap().id, "main");
    assert_eq!(users.get_user_by_name("main", "sub-name").unwrap().id, "sub");
    assert!(users.get_user_by_name("", "sub-name").is_none());
    assert!(users.is_owner("main"));
    assert!(!users.is_owner("sub"));

    store.advance(Duration::from_secs(10));
    let mut gone = user("sub", "main", UserRoleType::Sub);
    gone.valid = false;
    store.put_user(gone);
    registry.update_all().await.unwrap();
    assert!(users.get_user_by_name("main", "sub-name").is_none());
    assert_eq!(users.users_count(), 1);
    registry.close();
}

#[tokio::test]
async fn roles_drop_unreferenced_principals() {
    let store = Arc::new(MemoryStore::new());
    let role = |id: &str, principals: Vec<Principal>| Role {
        id: id.into(),
        name: id.into(),
        owner: "owner-1".into(),
        principals,
        valid: true,
        ..Default::default()
    };
    store.put_role(role("admin", vec![Principal::user("u1"), Principal::group("g1")]));
    store.put_role(role("viewer", vec![Principal::user("u1")]));
    let registry = registry(&store).await;
    let roles = registry.roles().unwrap();

    assert_eq!(roles.get_principal_roles(&Principal::user("u1")).len(), 2);
    assert_eq!(roles.principals_count(), 2);

    store.advance(Duration::from_secs(10));
    store.put_role(role("admin", vec![Principal::user("u1")]));
    registry.update_all().await.unwrap();

    assert!(roles.get_principal_roles(&Principal::group("g1")).is_empty());
    assert_eq!(roles.principals_count(), 1);

    let filter = RoleFilter {
        principal: Some(Principal::user("u1")),
        limit: 1,
        ..Default::default()
    };
    let (total, page) = roles.query_roles(&filter);
    assert_eq!(total, 2);
    assert_eq!(page[0].id, "admin");
    registry.close();
}
