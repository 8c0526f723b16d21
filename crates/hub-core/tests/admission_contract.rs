//! Contract Test: Admission
//!
//! Constraints verified:
//! - A new uuid gets the first free address of its kind's pool
//! - Repeated joins are idempotent
//! - FQDN collisions get a numeric suffix
//! - An exhausted pool is reported as an invalid request and saves nothing
//! - Blacklisted uuids are rejected and their identity removed
//! - Discovery mode off admits whitelisted uuids only

mod common;

use common::*;
use hub_core::admission::{AdmissionDecision, JoinRequest};
use hub_core::engine::EngineEvent;
use hub_core::error::ErrorClass;
use hub_core::model::{AccessConfig, Identity, IdentityKind};
use hub_core::{SubnetKey, SubnetPool};
use tokio_test::{assert_err, assert_ok};

fn request(kind: IdentityKind, uuid: &str, hostname: &str) -> JoinRequest {
    JoinRequest {
        kind,
        uuid: uuid.to_string(),
        hostname: hostname.to_string(),
    }
}

async fn admit(harness: &Harness, request: JoinRequest) -> hub_core::Result<AdmissionDecision> {
    harness.engine.admit(request).into_handle().unwrap().wait().await
}

fn admitted(decision: AdmissionDecision) -> (Identity, bool) {
    match decision {
        AdmissionDecision::Admitted { identity, created } => (identity, created),
        other => panic!("expected admission, got {:?}", other),
    }
}

#[tokio::test]
async fn new_peer_is_assigned_address_and_name() {
    let mut harness = HarnessBuilder::new().build();

    let decision = assert_ok!(admit(&harness, request(IdentityKind::Server, "u-1", "Web.corp.example")).await);
    let (identity, created) = admitted(decision);
    assert!(created);
    assert_eq!(identity.ipv4_address, server_address(0));
    assert_eq!(identity.fqdn, "web.hub.test");
    harness.settle().await;

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::IdentityAdmitted { uuid, created: true, .. } if uuid == "u-1"
    )));
    assert!(
        events.iter().any(|e| matches!(e, EngineEvent::FullSyncCompleted { .. })),
        "a new identity triggers a full sync"
    );
}

#[tokio::test]
async fn repeated_join_is_idempotent() {
    let harness = HarnessBuilder::new().build();
    let (first, _) = admitted(admit(&harness, request(IdentityKind::UserDevice, "d-1", "phone")).await.unwrap());
    let (second, created) =
        admitted(admit(&harness, request(IdentityKind::UserDevice, "d-1", "renamed")).await.unwrap());

    assert!(!created);
    assert_eq!(first, second);
    assert_eq!(harness.store.identities().await.unwrap().len(), 1);
}

#[tokio::test]
async fn colliding_hostnames_get_suffixes() {
    let harness = HarnessBuilder::new().build();
    let mut names = Vec::new();
    for uuid in ["a", "b", "c"] {
        let (identity, _) = admitted(admit(&harness, request(IdentityKind::Server, uuid, "db")).await.unwrap());
        names.push(identity.fqdn);
    }
    assert_eq!(names, vec!["db.hub.test", "db-2.hub.test", "db-3.hub.test"]);

    let addresses: Vec<_> = harness
        .store
        .identities()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.ipv4_address)
        .collect();
    assert_eq!(addresses, vec![server_address(0), server_address(1), server_address(2)]);
}

#[tokio::test]
async fn exhausted_pool_rejects_without_saving() {
    let harness = HarnessBuilder::new().build();
    let pool = SubnetPool::new(SubnetKey::new(SUBNET_KEY).unwrap(), IdentityKind::UserDevice);
    assert_eq!(pool.capacity(), 1024);
    for (n, address) in pool.addresses().enumerate() {
        seed(
            harness.store.as_ref(),
            IdentityKind::UserDevice,
            &format!("d-{}", n),
            address,
            false,
        )
        .await;
    }

    let result = admit(&harness, request(IdentityKind::UserDevice, "late", "laptop")).await;
    let err = assert_err!(result);
    assert_eq!(err.class(), ErrorClass::Invalid);
    assert_eq!(harness.store.identities().await.unwrap().len(), 1024);

    // the server pool is independent
    let decision = admit(&harness, request(IdentityKind::Server, "srv", "web")).await.unwrap();
    assert!(decision.is_admitted());
}

#[tokio::test]
async fn blacklist_rejects_and_removes() {
    let mut harness = HarnessBuilder::new().build();
    let (identity, _) = admitted(admit(&harness, request(IdentityKind::Server, "bad", "web")).await.unwrap());

    let mut access = AccessConfig::default();
    access.uuid_blacklist.insert("bad".to_string());
    let removed = harness.engine.save_access_config(access).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id, identity.id);
    assert!(harness.store.identity(identity.id).await.unwrap().is_none());

    let decision = admit(&harness, request(IdentityKind::Server, "bad", "web")).await.unwrap();
    assert!(matches!(decision, AdmissionDecision::Rejected { removed: None, .. }));

    harness.settle().await;
    assert!(
        harness
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::IdentityRejected { uuid, .. } if uuid == "bad"))
    );
}

#[tokio::test]
async fn discovery_off_admits_whitelist_only() {
    let harness = HarnessBuilder::new().build();
    let mut access = AccessConfig::default();
    access.discovery_mode = false;
    access.uuid_whitelist.insert("known".to_string());
    harness.engine.save_access_config(access).await.unwrap();

    let stranger = admit(&harness, request(IdentityKind::UserDevice, "stranger", "x")).await.unwrap();
    assert!(!stranger.is_admitted());

    let known = admit(&harness, request(IdentityKind::UserDevice, "known", "x")).await.unwrap();
    assert!(known.is_admitted());
}

#[tokio::test]
async fn invalid_uuid_is_rejected_as_invalid() {
    let harness = HarnessBuilder::new().build();
    let err = admit(&harness, request(IdentityKind::Server, " ", "web")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
}

#[tokio::test]
async fn client_config_pushes_address_and_peer() {
    let harness = HarnessBuilder::new().build();
    admit(&harness, request(IdentityKind::UserDevice, "d-1", "phone")).await.unwrap();

    let config = harness
        .engine
        .client_config(IdentityKind::UserDevice, "d-1")
        .into_handle()
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(config, "ifconfig-push 100.10.208.2 100.10.208.1");

    let missing = harness
        .engine
        .client_config(IdentityKind::UserDevice, "nope")
        .into_handle()
        .unwrap()
        .wait()
        .await;
    assert_err!(missing);
}
