//! Cluster Registry Tests
//! End-to-end behaviour of the registry against in-memory fake clusters:
//! permissions, RBAC lifecycle, partial updates, probing and concurrency.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use shepherd_api::clusters::store::CredentialStore;
use shepherd_api::clusters::{
    ClusterError, ClusterId, ClusterQuery, ClusterRegistry, CreateOptions, DeleteOptions,
    RegistrySettings, UpdateRequest,
};
use shepherd_api::auth::rbac::PermissionEvaluator;
use shepherd_api::db::Database;
use shepherd_common::auth::Action;
use shepherd_common::cluster::{IN_CLUSTER_NAME, IN_CLUSTER_SERVER, REDACTED};
use shepherd_common::table::render_cluster_table;
use shepherd_common::{Cluster, ClusterField, ConnectionStatus};

fn by_name(name: &str) -> ClusterId {
    ClusterId::Name(name.to_string())
}

fn by_server(server: &str) -> ClusterId {
    ClusterId::Server(server.to_string())
}

// ============== Create & List Tests ==============

#[tokio::test]
async fn test_create_then_list_converges() {
    let env = TestEnv::new();
    let created = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    assert!(created.resource_version > 0);
    assert_eq!(created.config.bearer_token.as_deref(), Some(REDACTED));

    let registry = env.registry.clone();
    let listed = retry_until_success(
        || {
            let registry = registry.clone();
            async move {
                registry
                    .list(&admin(), &ClusterQuery::default())
                    .await
                    .ok()
                    .and_then(|items| items.into_iter().find(|c| c.server == SERVER_A))
                    .filter(|c| c.status() == ConnectionStatus::Successful)
            }
        },
        100,
        20,
    )
    .await
    .expect("created cluster never converged in list");

    assert_eq!(listed.name, "alpha");
    assert_eq!(listed.server_version.as_deref(), Some("1.29"));
    assert!(listed.connection_state.message.is_empty());
    // Probe results do not count as spec changes
    assert_eq!(listed.resource_version, created.resource_version);
}

#[tokio::test]
async fn test_in_cluster_registration_row() {
    let env = TestEnv::new();
    env.connector.add_cluster(IN_CLUSTER_SERVER, "1.30");

    let created = env
        .registry
        .create(&admin(), Cluster::new(IN_CLUSTER_SERVER), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(created.name, IN_CLUSTER_NAME);

    wait_for_status(&env, IN_CLUSTER_SERVER, ConnectionStatus::Successful).await;
    let clusters = env
        .registry
        .list(&admin(), &ClusterQuery::default())
        .await
        .unwrap();
    let table = render_cluster_table(&clusters);

    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("SERVER"));
    let cells: Vec<&str> = lines[1].split_whitespace().collect();
    assert_eq!(
        cells,
        vec![IN_CLUSTER_SERVER, IN_CLUSTER_NAME, "1.30", "Successful"]
    );
}

#[tokio::test]
async fn test_list_sorted_and_filtered() {
    let env = TestEnv::new();
    for (server, name, project) in [
        (SERVER_A, "zeta", "p1"),
        (SERVER_B, "alpha", "p2"),
        (SERVER_C, "mid", "p1"),
    ] {
        env.registry
            .create(&admin(), create_test_cluster(server, name, project), CreateOptions::default())
            .await
            .unwrap();
    }

    let all = env.registry.list(&admin(), &ClusterQuery::default()).await.unwrap();
    let names: Vec<&str> = all.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);

    let p1 = env
        .registry
        .list(
            &admin(),
            &ClusterQuery {
                project: Some("p1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(p1.len(), 2);

    let one = env
        .registry
        .list(
            &admin(),
            &ClusterQuery {
                server: Some("HTTPS://Cluster-B.example.com:6443/".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].name, "alpha");
}

// ============== Permission Tests ==============

#[tokio::test]
async fn test_auto_id_resolves_server_or_name() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    let upper = ClusterId::Auto("HTTPS://CLUSTER-A.example.com:6443".to_string());
    let found = env.registry.get(&admin(), &upper).await.unwrap();
    assert_eq!(found.server, SERVER_A);

    let found = env.registry.get(&admin(), &ClusterId::Auto("alpha".to_string())).await.unwrap();
    assert_eq!(found.server, SERVER_A);

    let err = env
        .registry
        .get(&admin(), &ClusterId::Auto("cluster-a.example.com:6443".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
}

#[tokio::test]
async fn test_create_get_actor_cannot_delete() {
    let env = TestEnv::new();
    let member = project_member("dev", "team", &[Action::Create, Action::Get]);

    env.registry
        .create(&member, create_test_cluster(SERVER_A, "dev-cluster", "team"), CreateOptions::default())
        .await
        .unwrap();

    let visible = env.registry.list(&member, &ClusterQuery::default()).await.unwrap();
    assert_eq!(visible.len(), 1);

    let err = env
        .registry
        .delete(&member, &by_name("dev-cluster"), DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { .. }));
    assert_eq!(
        err.to_string(),
        format!("permission denied: clusters, delete, team/{}", SERVER_A)
    );

    // Nothing was torn down
    assert_eq!(env.connector.objects(SERVER_A).len(), 3);
    assert!(env.store.get(SERVER_A).await.is_some());
}

#[tokio::test]
async fn test_create_only_actor_sees_empty_list() {
    let env = TestEnv::new();
    let member = project_member("ci", "team", &[Action::Create]);

    env.registry
        .create(&member, create_test_cluster(SERVER_A, "ci-cluster", "team"), CreateOptions::default())
        .await
        .unwrap();

    let visible = env.registry.list(&member, &ClusterQuery::default()).await.unwrap();
    assert!(visible.is_empty());
    assert_eq!(
        render_cluster_table(&visible),
        "SERVER  NAME  VERSION  STATUS  MESSAGE  PROJECT"
    );

    let err = env.registry.get(&member, &by_name("ci-cluster")).await.unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { action: Action::Get, .. }));
}

#[tokio::test]
async fn test_create_outside_project_denied() {
    let env = TestEnv::new();
    let member = project_member("dev", "team", &[Action::Create, Action::Get]);

    let err = env
        .registry
        .create(&member, create_test_cluster(SERVER_A, "x", "other"), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { action: Action::Create, .. }));
    assert!(env.connector.objects(SERVER_A).is_empty());
    assert!(env.store.is_empty().await);
}

#[tokio::test]
async fn test_readonly_role_can_list_but_not_update() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", "p1"), CreateOptions::default())
        .await
        .unwrap();

    let viewer = shepherd_common::auth::Actor::new("viewer")
        .with_role(shepherd_common::auth::ROLE_READONLY);
    assert_eq!(
        env.registry.list(&viewer, &ClusterQuery::default()).await.unwrap().len(),
        1
    );

    let err = env
        .registry
        .update(
            &viewer,
            &by_name("alpha"),
            UpdateRequest {
                fields: vec![ClusterField::Labels],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { action: Action::Update, .. }));
}

#[tokio::test]
async fn test_unknown_project_rejected() {
    let env = TestEnv::with_settings(RegistrySettings {
        projects: vec!["p1".into()],
        ..Default::default()
    });

    let err = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "a", "p9"), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidArgument(_)));

    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "a", "p1"), CreateOptions::default())
        .await
        .unwrap();
}

// ============== Upsert Tests ==============

#[tokio::test]
async fn test_create_existing_requires_upsert() {
    let env = TestEnv::new();
    let original = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    // Same spec again is a no-op
    let again = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(again.resource_version, original.resource_version);

    let mut changed = create_test_cluster(SERVER_A, "alpha", "");
    changed.namespaces = vec!["apps".into()];
    let err = env
        .registry
        .create(&admin(), changed.clone(), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyExists(_)));
    assert_eq!(
        err.to_string(),
        format!(
            "existing cluster spec for '{}' is different; use upsert flag to force update",
            SERVER_A
        )
    );

    let replaced = env
        .registry
        .create(
            &admin(),
            changed,
            CreateOptions {
                upsert: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(replaced.namespaces, vec!["apps"]);
    assert!(replaced.resource_version > original.resource_version);
    assert_eq!(env.store.len().await, 1);
}

#[tokio::test]
async fn test_create_name_taken_in_project() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "shared", "p1"), CreateOptions::default())
        .await
        .unwrap();

    let err = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_B, "shared", "p1"), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));
    assert!(env.connector.objects(SERVER_B).is_empty());

    // Same name in another project is fine
    env.registry
        .create(&admin(), create_test_cluster(SERVER_B, "shared", "p2"), CreateOptions::default())
        .await
        .unwrap();
}

// ============== RBAC Lifecycle Tests ==============

#[tokio::test]
async fn test_delete_by_name_removes_rbac_objects() {
    let env = TestEnv::new();
    let created = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    let rbac = created.rbac.clone().unwrap();
    assert_eq!(rbac.service_account, "argocd-manager");
    assert_eq!(rbac.cluster_role, "argocd-manager-role");
    assert_eq!(rbac.cluster_role_binding, "argocd-manager-role-binding");
    assert_eq!(
        env.connector.objects(SERVER_A),
        vec![
            "ServiceAccount kube-system/argocd-manager",
            "ClusterRole argocd-manager-role",
            "ClusterRoleBinding argocd-manager-role-binding",
        ]
    );

    let outcome = env
        .registry
        .delete(&admin(), &by_name("alpha"), DeleteOptions::default())
        .await
        .unwrap();
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.cluster.server, SERVER_A);
    assert!(env.connector.objects(SERVER_A).is_empty());

    let err = env.registry.get(&admin(), &by_name("alpha")).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_with_partial_teardown_failure() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    env.connector.fail_delete(SERVER_A, "ClusterRole");

    let outcome = env
        .registry
        .delete(&admin(), &by_server(SERVER_A), DeleteOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].starts_with("ClusterRole argocd-manager-role"));

    // Remaining objects were still removed, the entry is gone
    assert_eq!(env.connector.objects(SERVER_A), vec!["ClusterRole argocd-manager-role"]);
    let err = env.registry.get(&admin(), &by_server(SERVER_A)).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_unreachable_cluster_warns() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    env.connector.set_reachable(SERVER_A, false);

    let outcome = env
        .registry
        .delete(&admin(), &by_name("alpha"), DeleteOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.warnings.len(), 3);
    assert!(env.store.get(SERVER_A).await.is_none());
}

#[tokio::test]
async fn test_delete_teardown_timeout_still_removes_entry() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    env.connector.set_delay(SERVER_A, Duration::from_millis(300));

    let outcome = env
        .registry
        .delete(
            &admin(),
            &by_name("alpha"),
            DeleteOptions {
                timeout: Some(Duration::from_millis(50)),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.warnings.len(), 3);
    assert!(outcome.warnings.iter().all(|w| w.contains("timed out")));

    let err = env.registry.get(&admin(), &by_server(SERVER_A)).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
    assert!(env.store.get(SERVER_A).await.is_none());
}

#[tokio::test]
async fn test_provisioning_failure_is_not_persisted() {
    let env = TestEnv::new();
    env.connector.fail_apply(SERVER_A, "ClusterRoleBinding");

    let err = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::RemoteProvisioningFailed { .. }));
    assert!(err.is_retryable());

    // Compensation removed the objects applied before the failure
    assert!(env.connector.objects(SERVER_A).is_empty());
    assert!(env.store.get(SERVER_A).await.is_none());

    // Retrying after the cause is fixed converges
    env.connector.clear_failures(SERVER_A);
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(env.connector.objects(SERVER_A).len(), 3);
}

#[tokio::test]
async fn test_verification_failure_rolls_back() {
    let env = TestEnv::new();
    env.connector.lose_applied(SERVER_A, "ClusterRole");

    let err = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing after apply"));
    assert!(env.connector.objects(SERVER_A).is_empty());
    assert!(env.store.is_empty().await);
}

#[tokio::test]
async fn test_provisioning_timeout_is_retryable() {
    let env = TestEnv::new();
    env.connector.set_delay(SERVER_A, Duration::from_millis(300));

    let err = env
        .registry
        .create(
            &admin(),
            create_test_cluster(SERVER_A, "alpha", ""),
            CreateOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Timeout { .. }));
    assert!(err.is_retryable());
    assert!(env.store.get(SERVER_A).await.is_none());
}

#[tokio::test]
async fn test_unknown_host_fails_provisioning() {
    let env = TestEnv::new();
    let err = env
        .registry
        .create(
            &admin(),
            create_test_cluster("https://nowhere.example.com", "ghost", ""),
            CreateOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::RemoteProvisioningFailed { .. }));
    assert!(err.to_string().contains("no such host"));
}

// ============== Update Tests ==============

#[tokio::test]
async fn test_update_labels_only() {
    let env = TestEnv::new();
    let mut cluster = create_test_cluster(SERVER_A, "alpha", "");
    cluster.namespaces = vec!["default".into(), "apps".into()];
    let created = env
        .registry
        .create(&admin(), cluster, CreateOptions::default())
        .await
        .unwrap();

    let mut patch = Cluster::default();
    patch.labels.insert("test".into(), "val".into());
    patch.namespaces = vec!["ignored".into()];
    patch.config.bearer_token = Some("ignored".into());

    let updated = env
        .registry
        .update(
            &admin(),
            &by_name("alpha"),
            UpdateRequest {
                fields: vec![ClusterField::Labels],
                patch,
                expected_version: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.labels.get("test").map(String::as_str), Some("val"));
    assert_eq!(updated.namespaces, vec!["default", "apps"]);
    assert!(updated.resource_version > created.resource_version);

    let stored = env.store.get(SERVER_A).await.unwrap();
    assert_eq!(stored.config.bearer_token.as_deref(), Some("token-for-alpha"));
    assert_eq!(stored.config_generation, created.config_generation);
}

#[tokio::test]
async fn test_update_keeps_redacted_secrets() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    let before = env.store.get(SERVER_A).await.unwrap();

    // Round-trip the redacted view with a config change
    let mut patch = env.registry.get(&admin(), &by_name("alpha")).await.unwrap();
    assert_eq!(patch.config.bearer_token.as_deref(), Some(REDACTED));
    patch.config.tls_client_config.insecure = true;

    env.registry
        .update(
            &admin(),
            &by_name("alpha"),
            UpdateRequest {
                fields: vec![ClusterField::Config],
                patch,
                expected_version: None,
            },
        )
        .await
        .unwrap();

    let stored = env.store.get(SERVER_A).await.unwrap();
    assert!(stored.config.tls_client_config.insecure);
    assert_eq!(stored.config.bearer_token.as_deref(), Some("token-for-alpha"));
    assert!(stored.config_generation > before.config_generation);
}

#[tokio::test]
async fn test_update_with_stale_version_conflicts() {
    let env = TestEnv::new();
    let created = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    let request = |version| {
        let mut patch = Cluster::default();
        patch.labels.insert("owner".into(), "team".into());
        UpdateRequest {
            fields: vec![ClusterField::Labels],
            patch,
            expected_version: Some(version),
        }
    };

    env.registry
        .update(&admin(), &by_name("alpha"), request(created.resource_version))
        .await
        .unwrap();
    let err = env
        .registry
        .update(&admin(), &by_name("alpha"), request(created.resource_version))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));
}

#[tokio::test]
async fn test_rename_into_taken_name_conflicts() {
    let env = TestEnv::new();
    for (server, name) in [(SERVER_A, "alpha"), (SERVER_B, "beta")] {
        env.registry
            .create(&admin(), create_test_cluster(server, name, "p1"), CreateOptions::default())
            .await
            .unwrap();
    }

    let request = |name: &str| UpdateRequest {
        fields: vec![ClusterField::Name],
        patch: Cluster::default().with_name(name),
        expected_version: None,
    };

    let err = env
        .registry
        .update(&admin(), &by_server(SERVER_B), request("alpha"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));

    let renamed = env
        .registry
        .update(&admin(), &by_server(SERVER_B), request("gamma"))
        .await
        .unwrap();
    assert_eq!(renamed.name, "gamma");
    assert!(env.registry.get(&admin(), &by_name("beta")).await.is_err());
    assert_eq!(
        env.registry.get(&admin(), &by_name("gamma")).await.unwrap().server,
        SERVER_B
    );
}

#[tokio::test]
async fn test_move_to_project_requires_permission_there() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", "p1"), CreateOptions::default())
        .await
        .unwrap();

    let member = project_member("dev", "p1", &[Action::Get, Action::Update]);
    let err = env
        .registry
        .update(
            &member,
            &by_name("alpha"),
            UpdateRequest {
                fields: vec![ClusterField::Project],
                patch: Cluster::default().with_project("p2"),
                expected_version: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { .. }));
    assert_eq!(env.store.get(SERVER_A).await.unwrap().project, "p1");
}

// ============== Name Resolution Tests ==============

#[tokio::test]
async fn test_name_shared_across_projects() {
    let env = TestEnv::new();
    for (server, project) in [(SERVER_A, "p1"), (SERVER_B, "p2")] {
        env.registry
            .create(&admin(), create_test_cluster(server, "shared", project), CreateOptions::default())
            .await
            .unwrap();
    }

    let err = env.registry.get(&admin(), &by_name("shared")).await.unwrap_err();
    assert!(matches!(err, ClusterError::Conflict(_)));

    let member = project_member("dev", "p2", &[Action::Get]);
    let found = env.registry.get(&member, &by_name("shared")).await.unwrap();
    assert_eq!(found.server, SERVER_B);

    let auto = ClusterId::parse(SERVER_A, None).unwrap();
    assert_eq!(env.registry.get(&admin(), &auto).await.unwrap().project, "p1");
}

// ============== Probe Tests ==============

#[tokio::test]
async fn test_failed_probe_keeps_last_version() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();
    wait_for_status(&env, SERVER_A, ConnectionStatus::Successful).await;

    env.connector.set_reachable(SERVER_A, false);
    env.registry.refresh(&admin(), &by_name("alpha")).await.unwrap();

    let failed = wait_for_status(&env, SERVER_A, ConnectionStatus::Failed).await;
    assert_eq!(failed.server_version.as_deref(), Some("1.29"));
    assert!(failed.connection_state.message.contains("connection refused"));

    env.connector.set_reachable(SERVER_A, true);
    env.connector.set_version(SERVER_A, "1.30");
    env.registry.refresh(&admin(), &by_name("alpha")).await.unwrap();
    let recovered = wait_for_status(&env, SERVER_A, ConnectionStatus::Successful).await;
    assert_eq!(recovered.server_version.as_deref(), Some("1.30"));
}

#[tokio::test]
async fn test_deleted_entry_is_not_resurrected_by_probe() {
    let env = TestEnv::new();
    env.registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    env.connector.set_delay(SERVER_A, Duration::from_millis(100));
    env.registry.refresh(&admin(), &by_name("alpha")).await.unwrap();
    env.registry
        .delete(&admin(), &by_name("alpha"), DeleteOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(env.store.get(SERVER_A).await.is_none());
    assert_eq!(env.registry.scheduler().in_flight(), 0);
}

#[tokio::test]
async fn test_ensure_in_cluster_is_idempotent() {
    let env = TestEnv::new();
    env.connector.add_cluster(IN_CLUSTER_SERVER, "1.31");

    let first = env.registry.ensure_in_cluster().await.unwrap();
    let second = env.registry.ensure_in_cluster().await.unwrap();
    assert_eq!(first.server, second.server);
    assert_eq!(first.name, IN_CLUSTER_NAME);
    assert!(first.rbac.is_none());
    assert_eq!(env.store.len().await, 1);

    // No RBAC teardown for the local cluster
    wait_for_status(&env, IN_CLUSTER_SERVER, ConnectionStatus::Successful).await;
    let outcome = env
        .registry
        .delete(&admin(), &by_name(IN_CLUSTER_NAME), DeleteOptions::default())
        .await
        .unwrap();
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn test_project_member_replaces_seeded_in_cluster_entry() {
    let env = TestEnv::new();
    env.connector.add_cluster(IN_CLUSTER_SERVER, "1.29");
    env.registry.ensure_in_cluster().await.unwrap();
    assert!(env.store.get(IN_CLUSTER_SERVER).await.unwrap().seeded);

    let member = project_member("argo", "argo-project", &[Action::Create, Action::Get]);
    let created = env
        .registry
        .create(
            &member,
            Cluster::new(IN_CLUSTER_SERVER).with_project("argo-project"),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(created.project, "argo-project");
    assert_eq!(created.name, IN_CLUSTER_NAME);

    let visible = env.registry.list(&member, &ClusterQuery::default()).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].project, "argo-project");
    assert_eq!(env.connector.objects(IN_CLUSTER_SERVER).len(), 3);

    let stored = env.store.get(IN_CLUSTER_SERVER).await.unwrap();
    assert!(!stored.seeded);
    assert!(stored.rbac.is_some());

    // Now a regular entry: a different spec needs upsert
    let err = env
        .registry
        .create(
            &member,
            Cluster::new(IN_CLUSTER_SERVER)
                .with_name("local")
                .with_project("argo-project"),
            CreateOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyExists(_)));

    let err = env
        .registry
        .delete(&member, &by_server(IN_CLUSTER_SERVER), DeleteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { .. }));
}

// ============== Concurrency Tests ==============

#[tokio::test]
async fn test_concurrent_disjoint_field_updates() {
    let env = TestEnv::new();
    let created = env
        .registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
        .await
        .unwrap();

    let mut label_patch = Cluster::default();
    label_patch.labels.insert("team".into(), "platform".into());
    let mut namespace_patch = Cluster::default();
    namespace_patch.namespaces = vec!["apps".into()];

    let updates = (0..10).map(|i| {
        let registry = env.registry.clone();
        let (field, patch) = if i % 2 == 0 {
            (ClusterField::Labels, label_patch.clone())
        } else {
            (ClusterField::Namespaces, namespace_patch.clone())
        };
        async move {
            registry
                .update(
                    &admin(),
                    &by_name("alpha"),
                    UpdateRequest {
                        fields: vec![field],
                        patch,
                        expected_version: None,
                    },
                )
                .await
        }
    });

    for result in join_all(updates).await {
        result.unwrap();
    }

    let stored = env.store.get(SERVER_A).await.unwrap();
    assert_eq!(stored.labels.get("team").map(String::as_str), Some("platform"));
    assert_eq!(stored.namespaces, vec!["apps"]);
    // Probe results may interleave and consume revisions too
    assert!(stored.resource_version >= created.resource_version + 10);
}

#[tokio::test]
async fn test_writes_to_different_clusters_run_in_parallel() {
    let env = TestEnv::new();
    for server in [SERVER_A, SERVER_B] {
        env.connector.set_delay(server, Duration::from_millis(100));
    }

    let started = tokio::time::Instant::now();
    let creates = [(SERVER_A, "alpha"), (SERVER_B, "beta")].map(|(server, name)| {
        let registry = env.registry.clone();
        async move {
            registry
                .create(&admin(), create_test_cluster(server, name, ""), CreateOptions::default())
                .await
        }
    });
    for result in join_all(creates).await {
        result.unwrap();
    }

    // Six delayed calls per cluster; run serially both would take at least 1.2s
    assert!(started.elapsed() < Duration::from_millis(1100));
    assert_eq!(env.store.len().await, 2);
}

#[tokio::test]
async fn test_concurrent_creates_of_same_server_serialize() {
    let env = TestEnv::new();
    env.connector.set_delay(SERVER_A, Duration::from_millis(20));

    let creates = (0..4).map(|_| {
        let registry = env.registry.clone();
        async move {
            registry
                .create(&admin(), create_test_cluster(SERVER_A, "alpha", ""), CreateOptions::default())
                .await
        }
    });
    let results = join_all(creates).await;

    // The first one provisions, the rest see an identical entry
    let versions: Vec<u64> = results.into_iter().map(|r| r.unwrap().resource_version).collect();
    assert!(versions.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(env.connector.objects(SERVER_A).len(), 3);
}

// ============== Persistence Tests ==============

#[tokio::test]
async fn test_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("shepherd.db").display());
    let env = TestEnv::new();

    let database = Arc::new(Database::new(&url, 1).await.unwrap());
    database.migrate().await.unwrap();
    let store = Arc::new(CredentialStore::with_database(database.clone()));
    let registry = ClusterRegistry::new(
        store.clone(),
        Arc::new(env.connector.clone()),
        Arc::new(PermissionEvaluator::default()),
        RegistrySettings::default(),
    );
    let created = registry
        .create(&admin(), create_test_cluster(SERVER_A, "alpha", "p1"), CreateOptions::default())
        .await
        .unwrap();
    drop(registry);

    let reloaded = CredentialStore::with_database(database.clone());
    assert_eq!(reloaded.load().await.unwrap(), 1);
    let entry = reloaded.get(SERVER_A).await.unwrap();
    assert_eq!(entry.name, "alpha");
    assert_eq!(entry.config.bearer_token.as_deref(), Some("token-for-alpha"));
    assert!(entry.resource_version >= created.resource_version);
    assert!(entry.rbac.is_some());

    database.close().await;
}
