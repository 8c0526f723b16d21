//! Contract Test: Packet-Filter Sync
//!
//! Constraints verified:
//! - Administrative mutations reach the packet filter only through jobs
//! - Membership changes re-apply every referencing rule and policy
//! - Policy jumps are tagged, so deleting a policy leaves others intact
//! - Deleting a rule removes its chain and every jump into it
//! - Init is idempotent; teardown restores the skeleton or removes it all
//! - A chain flushed out-of-band still receives every policy entry

mod common;

use common::*;
use hub_core::error::ErrorClass;
use hub_core::firewall::{ENTRY_CHAIN, MAIN_CHAIN, POLICY_CHAIN, policy_entry, rule_chain};
use hub_core::model::{ALL_SERVERS, Group, Identity, IdentityKind, Policy, PortSpec, Protocol, Rule};
use hub_core::traits::FilterEntry;
use std::sync::Arc;
use tokio_test::assert_ok;

struct Topology {
    harness: Harness,
    device: Identity,
    web1: Identity,
    web2: Identity,
    web: Group,
}

async fn topology() -> Topology {
    let harness = HarnessBuilder::new().build();
    let store = harness.store.clone();
    let device = seed(store.as_ref(), IdentityKind::UserDevice, "laptop", device_address(0), true).await;
    let web1 = seed(store.as_ref(), IdentityKind::Server, "web1", server_address(0), true).await;
    let web2 = seed(store.as_ref(), IdentityKind::Server, "web2", server_address(1), true).await;

    assert_ok!(harness.engine.init(true).into_handle().unwrap().wait().await);
    let web = harness
        .engine
        .save_group(Group::new(IdentityKind::Server, "web"))
        .await
        .unwrap();
    harness.engine.add_member(web.id, web1.id).await.unwrap();
    harness.settle().await;

    Topology {
        harness,
        device,
        web1,
        web2,
        web,
    }
}

async fn ssh_rule(t: &Topology) -> Rule {
    let mut rule = Rule::new("ssh", Protocol::Tcp, PortSpec::parse("22").unwrap());
    rule.source_users.insert(t.device.id);
    t.harness.engine.save_rule(rule).await.unwrap()
}

async fn web_policy(t: &Topology, rule: &Rule) -> Policy {
    let mut policy = Policy::new("ssh to web");
    policy.rules.insert(rule.id);
    policy.target_servergroups.insert(t.web.id);
    t.harness.engine.save_policy(policy).await.unwrap()
}

fn policy_chain(t: &Topology) -> Vec<FilterEntry> {
    t.harness.filter.entries(POLICY_CHAIN).unwrap_or_default()
}

#[tokio::test]
async fn rule_and_policy_compile_through_the_queue() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    let policy = web_policy(&t, &rule).await;
    t.harness.settle().await;

    let chain = t.harness.filter.entries(&rule_chain(rule.id)).expect("rule chain exists");
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].source, Some(t.device.ipv4_address.into()));
    assert_eq!(chain[0].dports.as_deref(), Some("22"));

    let jumps = policy_chain(&t);
    assert_eq!(
        jumps,
        vec![policy_entry(policy.id, t.web1.ipv4_address, &rule_chain(rule.id))]
    );
}

#[tokio::test]
async fn membership_change_reapplies_policy() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    let policy = web_policy(&t, &rule).await;

    t.harness.engine.add_member(t.web.id, t.web2.id).await.unwrap();
    t.harness.settle().await;

    let jumps = policy_chain(&t);
    assert_eq!(jumps.len(), 2);
    let chain = rule_chain(rule.id);
    assert!(jumps.contains(&policy_entry(policy.id, t.web1.ipv4_address, &chain)));
    assert!(jumps.contains(&policy_entry(policy.id, t.web2.ipv4_address, &chain)));

    t.harness.engine.remove_member(t.web.id, t.web1.id).await.unwrap();
    t.harness.settle().await;
    assert_eq!(
        policy_chain(&t),
        vec![policy_entry(policy.id, t.web2.ipv4_address, &chain)]
    );
}

#[tokio::test]
async fn reserved_membership_cannot_be_removed() {
    let t = topology().await;
    let all_servers = t
        .harness
        .store
        .groups()
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.name == ALL_SERVERS)
        .unwrap();
    assert!(t.web1.groups.contains(&all_servers.id));

    let err = t
        .harness
        .engine
        .remove_member(all_servers.id, t.web1.id)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);

    let err = t.harness.engine.delete_group(all_servers.id).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
}

#[tokio::test]
async fn deleting_a_policy_keeps_other_policies() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    let first = web_policy(&t, &rule).await;

    let mut second = Policy::new("ssh to web2");
    second.rules.insert(rule.id);
    second.target_servers.insert(t.web2.id);
    let second = t.harness.engine.save_policy(second).await.unwrap();
    t.harness.settle().await;
    assert_eq!(policy_chain(&t).len(), 2);

    t.harness.engine.delete_policy(first.id).await.unwrap();
    t.harness.settle().await;
    assert_eq!(
        policy_chain(&t),
        vec![policy_entry(second.id, t.web2.ipv4_address, &rule_chain(rule.id))]
    );
}

#[tokio::test]
async fn deleting_a_rule_removes_chain_and_jumps() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    web_policy(&t, &rule).await;
    t.harness.settle().await;

    let removed = t.harness.engine.delete_rule(rule.id).await.unwrap();
    assert!(removed.is_some());
    t.harness.settle().await;

    assert!(t.harness.filter.entries(&rule_chain(rule.id)).is_none());
    assert!(policy_chain(&t).is_empty());
}

#[tokio::test]
async fn init_is_idempotent() {
    let t = topology().await;
    for _ in 0..3 {
        assert_ok!(t.harness.engine.init(true).into_handle().unwrap().wait().await);
    }

    let forward = t.harness.filter.entries(ENTRY_CHAIN).unwrap();
    assert_eq!(forward.len(), 1, "exactly one entry jump");
    assert_eq!(t.harness.filter.entries(MAIN_CHAIN).unwrap().len(), 3);
}

#[tokio::test]
async fn teardown_restores_skeleton_then_removes_everything() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    web_policy(&t, &rule).await;
    t.harness.settle().await;

    assert_ok!(t.harness.engine.teardown(false).into_handle().unwrap().wait().await);
    assert!(t.harness.filter.entries(&rule_chain(rule.id)).is_none());
    assert!(policy_chain(&t).is_empty());
    assert_eq!(t.harness.filter.entries(MAIN_CHAIN).unwrap().len(), 3);

    assert_ok!(t.harness.engine.teardown(true).into_handle().unwrap().wait().await);
    assert!(t.harness.filter.entries(MAIN_CHAIN).is_none());
    assert!(t.harness.filter.entries(POLICY_CHAIN).is_none());
    assert!(t.harness.filter.entries(ENTRY_CHAIN).unwrap().is_empty());

    // full sync after teardown rebuilds rules and policies
    assert_ok!(t.harness.engine.init(false).into_handle().unwrap().wait().await);
    assert_eq!(policy_chain(&t).len(), 1);
}

#[tokio::test]
async fn out_of_band_flush_is_absorbed_by_priming() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    let policy = web_policy(&t, &rule).await;
    t.harness.settle().await;

    t.harness.filter.flush_out_of_band(POLICY_CHAIN);
    let emitted = t
        .harness
        .engine
        .apply_policy(policy.id)
        .into_handle()
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(emitted, 1);
    assert_eq!(
        policy_chain(&t),
        vec![policy_entry(policy.id, t.web1.ipv4_address, &rule_chain(rule.id))]
    );
}

#[tokio::test]
async fn deleted_identity_triggers_full_sync() {
    let t = topology().await;
    let rule = ssh_rule(&t).await;
    web_policy(&t, &rule).await;
    t.harness.settle().await;

    let store = Arc::clone(&t.harness.store);
    t.harness.engine.delete_identity(t.web1.id).await.unwrap();
    t.harness.settle().await;

    assert!(store.identity(t.web1.id).await.unwrap().is_none());
    assert!(policy_chain(&t).is_empty(), "jump to the removed server is gone");
}
