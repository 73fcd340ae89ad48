use arbor_kernel::capability::InMemoryPersistence;
use arbor_kernel::{AuthorizeOptions, Identity, KernelConfig, SecurityKernel};
use arbor_kernel::{Capability, ConstraintValue, Constraints};
use arbor_kernel::keychain::Keychain;
use std::collections::HashMap;
use std::sync::Arc;

fn signed_request(
    identity: &Identity,
    resource_uri: &str,
    action: &str,
    nonce: &str,
) -> arbor_kernel::identity::SignedRequest {
    use chrono::Utc;
    let mut req = arbor_kernel::identity::SignedRequest {
        principal_id: identity.agent_id.clone(),
        resource_uri: resource_uri.to_string(),
        action: action.to_string(),
        timestamp: Utc::now(),
        nonce: nonce.to_string(),
        signature: [0u8; 64],
    };
    req.signature = arbor_kernel::crypto::sign(&req.canonical_bytes(), &identity.private_key.unwrap());
    req
}

#[tokio::test]
async fn quota_exceeded_end_to_end() {
    let mut config = KernelConfig::default();
    config.identity_verification = false;
    config.max_capabilities_per_agent = 1;
    let kernel = SecurityKernel::new(config, Arc::new(InMemoryPersistence::new()));

    let identity = Identity::generate();
    kernel.register_identity(identity.public_only()).unwrap();

    kernel
        .grant(&identity.agent_id, "arbor://fs/read/a", "read", Constraints::new(), None, HashMap::new())
        .await
        .unwrap();

    let second = kernel
        .grant(&identity.agent_id, "arbor://fs/read/b", "read", Constraints::new(), None, HashMap::new())
        .await;
    assert!(second.is_err(), "per-principal quota should reject the second grant");
}

#[tokio::test]
async fn replay_attack_is_rejected_with_identity_verification_on() {
    let mut config = KernelConfig::default();
    config.identity_verification = true;
    let kernel = SecurityKernel::new(config, Arc::new(InMemoryPersistence::new()));

    let identity = Identity::generate();
    kernel.register_identity(identity.clone()).unwrap();
    kernel
        .grant(&identity.agent_id, "arbor://fs/read/home", "read", Constraints::new(), None, HashMap::new())
        .await
        .unwrap();

    let request = signed_request(&identity, "arbor://fs/read/home", "read", "replay-nonce-1");

    let first = kernel
        .authorize(
            &identity.agent_id,
            "arbor://fs/read/home",
            "read",
            AuthorizeOptions {
                signed_request: Some(request.clone()),
            },
        )
        .await;
    assert!(first.is_ok());

    let replayed = kernel
        .authorize(
            &identity.agent_id,
            "arbor://fs/read/home",
            "read",
            AuthorizeOptions {
                signed_request: Some(request),
            },
        )
        .await;
    assert!(replayed.is_err(), "replaying the same nonce must be rejected");
}

#[tokio::test]
async fn authorize_rejects_missing_signed_request_when_verification_is_on() {
    let mut config = KernelConfig::default();
    config.identity_verification = true;
    let kernel = SecurityKernel::new(config, Arc::new(InMemoryPersistence::new()));

    let identity = Identity::generate();
    kernel.register_identity(identity.clone()).unwrap();
    kernel
        .grant(&identity.agent_id, "arbor://fs/read/home", "read", Constraints::new(), None, HashMap::new())
        .await
        .unwrap();

    let result = kernel
        .authorize(&identity.agent_id, "arbor://fs/read/home", "read", AuthorizeOptions::default())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn delegated_capability_narrows_allowed_paths() {
    let mut config = KernelConfig::default();
    config.identity_verification = false;
    let kernel = SecurityKernel::new(config, Arc::new(InMemoryPersistence::new()));

    let root_identity = Identity::generate();
    kernel.register_identity(root_identity.public_only()).unwrap();
    let root_private = root_identity.private_key.unwrap();

    let mut root_constraints = Constraints::new();
    root_constraints.insert(
        "allowed_paths".to_string(),
        ConstraintValue::AllowedPaths {
            paths: vec!["/home".to_string()],
        },
    );
    let root_cap = kernel
        .grant(&root_identity.agent_id, "arbor://fs/read/home", "read", root_constraints, None, HashMap::new())
        .await
        .unwrap();

    let child_identity = Identity::generate();
    kernel.register_identity(child_identity.public_only()).unwrap();

    let mut child_constraints = Constraints::new();
    child_constraints.insert(
        "allowed_paths".to_string(),
        ConstraintValue::AllowedPaths {
            paths: vec!["/home/docs".to_string()],
        },
    );
    let broader_constraints = {
        let mut c = Constraints::new();
        c.insert(
            "allowed_paths".to_string(),
            ConstraintValue::AllowedPaths {
                paths: vec!["/etc".to_string()],
            },
        );
        c
    };

    kernel
        .delegate(&root_private, &root_cap.id, &child_identity.agent_id, child_constraints, None)
        .await
        .expect("narrowing delegation should succeed");

    let rejected = kernel
        .delegate(&root_private, &root_cap.id, &child_identity.agent_id, broader_constraints, None)
        .await;
    assert!(rejected.is_err(), "a delegation widening allowed_paths must be rejected");
}

#[test]
fn double_ratchet_channel_survives_out_of_order_delivery() {
    let mut alice = Keychain::new("alice".to_string());
    let mut bob = Keychain::new("bob".to_string());
    alice.add_peer("bob".to_string(), bob.signing_public(), bob.encryption_public());
    bob.add_peer("alice".to_string(), alice.signing_public(), alice.encryption_public());

    let root = [7u8; 32];
    alice.establish_ratchet_as_initiator("bob", root).unwrap();
    bob.establish_ratchet_as_responder("alice", root).unwrap();

    let first = alice.seal_for_peer("bob", b"message one", b"").unwrap();
    let second = alice.seal_for_peer("bob", b"message two", b"").unwrap();
    let third = alice.seal_for_peer("bob", b"message three", b"").unwrap();

    // Deliver out of order: third, then first, then second. Bob must still
    // recover every plaintext, buffering skipped message keys as needed.
    let plaintext_three = bob.unseal_from_peer("alice", &third).unwrap();
    let plaintext_one = bob.unseal_from_peer("alice", &first).unwrap();
    let plaintext_two = bob.unseal_from_peer("alice", &second).unwrap();

    assert_eq!(plaintext_three, b"message three");
    assert_eq!(plaintext_one, b"message one");
    assert_eq!(plaintext_two, b"message two");
}

#[tokio::test]
async fn fileguard_rejects_path_traversal_outside_capability_root() {
    use arbor_kernel::capability::{CapabilityStore, QuotaLimits};
    use arbor_kernel::fileguard;

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("sandbox")).unwrap();
    std::fs::write(dir.path().join("sandbox/doc.txt"), b"hello").unwrap();

    let store = CapabilityStore::new(
        QuotaLimits {
            max_per_principal: 10,
            max_global: 10,
            max_delegation_depth: 10,
        },
        Arc::new(InMemoryPersistence::new()),
    );
    let root_uri = fileguard::build_uri("read", &dir.path().join("sandbox"));
    store
        .put(Capability::new(root_uri, "agent_x".to_string()))
        .await
        .unwrap();

    let within = fileguard::authorize(&store, "agent_x", &dir.path().join("sandbox/doc.txt"), "read");
    assert!(within.is_ok());

    let escape = fileguard::authorize(&store, "agent_x", &dir.path().join("sandbox/../outside.txt"), "read");
    assert!(escape.is_err());
}
