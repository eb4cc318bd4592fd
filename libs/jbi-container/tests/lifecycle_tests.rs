#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Component and service assembly lifecycle across container restarts.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use jbi_container::endpoint::Endpoint;
use jbi_container::{ComponentNameSpace, JbiError, LifeCycleState, QName};
use support::{Harness, TEST_NS, Unit, endpoint_link};

#[tokio::test]
async fn persisted_component_state_follows_every_transition() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();

    let c1 = container.registry().get_component("c1").unwrap();
    assert!(c1.is_started());

    c1.stop().await.unwrap();
    assert_eq!(c1.persisted_state().unwrap(), Some(LifeCycleState::Stopped));
    c1.shut_down().await.unwrap();
    assert_eq!(c1.persisted_state().unwrap(), Some(LifeCycleState::Shutdown));
    c1.start().await.unwrap();
    assert_eq!(c1.persisted_state().unwrap(), Some(LifeCycleState::Started));
    c1.stop().await.unwrap();
    assert_eq!(c1.persisted_state().unwrap(), Some(LifeCycleState::Stopped));

    container.shutdown().await;
    assert_eq!(c1.persisted_state().unwrap(), Some(LifeCycleState::Stopped));

    h.journal.clear();
    let restarted = h.started().await;
    let c1 = restarted.registry().get_component("c1").unwrap();
    assert_eq!(c1.state(), LifeCycleState::Stopped);
    // STOPPED is replayed through a full start followed by a stop.
    assert_eq!(h.journal.calls(), ["c1:init", "c1:start", "c1:stop"]);
    restarted.shutdown().await;
}

#[tokio::test]
async fn component_shut_down_on_purpose_stays_down_after_restart() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    container
        .registry()
        .get_component("c1")
        .unwrap()
        .shut_down()
        .await
        .unwrap();
    container.shutdown().await;

    let restarted = h.started().await;
    let c1 = restarted.registry().get_component("c1").unwrap();
    assert!(c1.is_shut_down());
    assert!(restarted.registry().pending_components().is_empty());
    restarted.shutdown().await;
}

#[tokio::test]
async fn failed_start_leaves_component_in_previous_state() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    let c1 = container.registry().get_component("c1").unwrap();
    c1.shut_down().await.unwrap();

    h.faults.fail_start.store(true, Ordering::SeqCst);
    let err = c1.start().await.unwrap_err();
    assert!(matches!(err, JbiError::Plugin { task: "start", .. }));
    // init succeeded, start did not: the component is initialised but not running.
    assert_eq!(c1.state(), LifeCycleState::Stopped);
    assert_eq!(c1.persisted_state().unwrap(), Some(LifeCycleState::Shutdown));

    h.faults.fail_start.store(false, Ordering::SeqCst);
    c1.start().await.unwrap();
    assert!(c1.is_started());
    container.shutdown().await;
}

#[tokio::test]
async fn duplicate_internal_endpoint_keeps_the_first_registration() {
    let h = Harness::new();
    let container = h.started().await;
    let endpoints = container.registry().endpoints();
    let first = ComponentNameSpace::new("test", "c1");
    let second = ComponentNameSpace::new("test", "c2");
    let service = QName::new(TEST_NS, "orders");

    endpoints
        .register_internal_endpoint(&first, service.clone(), "ep", Vec::new())
        .unwrap();
    let err = endpoints
        .register_internal_endpoint(&second, service.clone(), "ep", Vec::new())
        .unwrap_err();
    assert!(matches!(err, JbiError::DuplicateEndpoint { kind: "internal", .. }));

    let resolved = endpoints.get_internal_endpoint(&service, "ep").unwrap();
    assert_eq!(resolved.component(), Some(first));
    container.shutdown().await;
}

#[tokio::test]
async fn assembly_activating_a_taken_endpoint_fails_to_start() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    let deployment = container.deployment();
    deployment
        .deploy(&h.assembly_zip("sa-a", &[Unit::new("su-a", "c1").providing("shared", "ep")]))
        .await
        .unwrap();
    deployment
        .deploy(&h.assembly_zip("sa-b", &[Unit::new("su-b", "c1").providing("shared", "ep")]))
        .await
        .unwrap();

    deployment.start("sa-a").await.unwrap();
    let err = deployment.start("sa-b").await.unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert!(err.failures()[0].to_string().contains("already registered"));
    assert_eq!(deployment.state("sa-b").unwrap(), LifeCycleState::Shutdown);

    let owner = container
        .registry()
        .endpoints()
        .get_internal_endpoint(&QName::new(TEST_NS, "shared"), "ep")
        .unwrap()
        .component();
    assert_eq!(owner, Some(ComponentNameSpace::new("test", "c1")));
    assert_eq!(deployment.state("sa-a").unwrap(), LifeCycleState::Started);
    container.shutdown().await;
}

#[tokio::test]
async fn stopping_a_component_stops_its_assemblies_and_starting_resumes_them() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    container
        .deployment()
        .deploy(&h.assembly_zip("sa", &[Unit::new("su", "c1")]))
        .await
        .unwrap();
    container.deployment().start("sa").await.unwrap();

    let registry = container.registry();
    let c1 = registry.get_component("c1").unwrap();
    c1.stop().await.unwrap();
    let assemblies = registry.get_deployed_service_assemblies_for_component("c1");
    assert_eq!(assemblies.len(), 1);
    assert!(assemblies.iter().all(|sa| sa.is_stopped()));

    c1.start().await.unwrap();
    let assemblies = registry.get_deployed_service_assemblies_for_component("c1");
    assert!(assemblies.iter().all(|sa| sa.is_started()));
    assert_eq!(h.journal.count("c1:start:su"), 2);
    container.shutdown().await;
}

#[tokio::test]
async fn hanging_unit_start_is_reported_as_timeout() {
    let h = Harness::new();
    let container = h.container_with(jbi_container::ContainerConfig {
        deployment_timeout_ms: 200,
        ..h.config()
    });
    container.start().await.unwrap();
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    container
        .deployment()
        .deploy(&h.assembly_zip("sa", &[Unit::new("su", "c1")]))
        .await
        .unwrap();

    h.faults.hang_unit_start.store(true, Ordering::SeqCst);
    let started = tokio::time::Instant::now();
    let err = container.deployment().start("sa").await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(container.deployment().state("sa").unwrap(), LifeCycleState::Shutdown);

    h.faults.hang_unit_start.store(false, Ordering::SeqCst);
    container.deployment().start("sa").await.unwrap();
    container.shutdown().await;
}

#[tokio::test]
async fn started_assembly_is_restored_after_container_restart() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("component1", &[]))
        .await
        .unwrap();
    let sa = container
        .deployment()
        .deploy(&h.assembly_zip("sa", &[Unit::new("su", "component1")]))
        .await
        .unwrap();
    assert!(sa.is_shut_down());
    container.deployment().start("sa").await.unwrap();
    assert_eq!(sa.persisted_state().unwrap(), Some(LifeCycleState::Started));
    container.shutdown().await;
    assert!(sa.is_shut_down());
    assert_eq!(sa.persisted_state().unwrap(), Some(LifeCycleState::Started));

    h.journal.clear();
    let restarted = h.started().await;
    assert_eq!(restarted.deployment().state("sa").unwrap(), LifeCycleState::Started);
    assert!(restarted.registry().pending_assemblies().is_empty());
    assert_eq!(h.journal.count("component1:init:su"), 1);
    assert_eq!(h.journal.count("component1:deploy:su"), 0);
    assert!(
        restarted
            .registry()
            .endpoints()
            .get_internal_endpoint(&QName::new(TEST_NS, "su"), "ep")
            .is_some()
    );
    restarted.shutdown().await;
}

#[tokio::test]
async fn stopped_assembly_is_restored_stopped() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    container
        .deployment()
        .deploy(&h.assembly_zip("sa", &[Unit::new("su", "c1")]))
        .await
        .unwrap();
    container.deployment().start("sa").await.unwrap();
    container.deployment().stop("sa").await.unwrap();
    container.shutdown().await;

    let restarted = h.started().await;
    assert_eq!(restarted.deployment().state("sa").unwrap(), LifeCycleState::Stopped);
    restarted.shutdown().await;
}

#[tokio::test]
async fn container_phases_are_enforced() {
    let h = Harness::new();
    let container = h.started().await;
    assert!(container.is_started().await);
    let err = container.start().await.unwrap_err();
    assert!(matches!(err, JbiError::InvalidContainerPhase { task: "start", .. }));

    container.shutdown().await;
    container.shutdown().await;
    assert!(!container.is_started().await);
}

#[tokio::test]
async fn components_start_in_registration_order_and_stop_in_reverse() {
    let h = Harness::new();
    let container = h.container();
    container.init().await.unwrap();
    for name in ["c3", "c1", "c2"] {
        container
            .installation()
            .install_component(&h.component_zip(name, &[]))
            .await
            .unwrap();
    }
    let components = container.registry().components();
    assert_eq!(components.names(), ["c3", "c1", "c2"]);

    h.journal.clear();
    components.start_all().await.unwrap();
    assert_eq!(
        h.journal.calls(),
        ["c3:init", "c3:start", "c1:init", "c1:start", "c2:init", "c2:start"]
    );

    h.journal.clear();
    components.stop_all().await.unwrap();
    assert_eq!(h.journal.calls(), ["c2:stop", "c1:stop", "c3:stop"]);

    h.journal.clear();
    components.start_all().await.unwrap();
    assert_eq!(h.journal.calls(), ["c3:start", "c1:start", "c2:start"]);

    h.journal.clear();
    components.shut_down_all().await.unwrap();
    assert_eq!(
        h.journal.calls(),
        ["c2:stop", "c1:stop", "c3:stop", "c2:shut_down", "c1:shut_down", "c3:shut_down"]
    );
    assert!(components.components().iter().all(|c| c.is_shut_down()));
    container.shutdown().await;
}

#[tokio::test]
async fn every_unit_failure_is_collected_and_the_rest_still_run() {
    let h = Harness::new();
    let container = h.started().await;
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    let units = [Unit::new("su1", "c1"), Unit::new("su2", "c1"), Unit::new("su3", "c1")];
    let sa = container
        .deployment()
        .deploy(&h.assembly_zip("sa", &units))
        .await
        .unwrap();

    h.faults.fail_unit_init("su1");
    h.faults.fail_unit_init("su3");
    let err = container.deployment().start("sa").await.unwrap_err();
    assert!(matches!(err, JbiError::Composite { task: "start", .. }), "{err}");
    assert_eq!(err.failures().len(), 2);
    assert!(err.failures()[0].to_string().contains("init of su1 refused"));
    assert!(err.failures()[1].to_string().contains("init of su3 refused"));

    assert_eq!(h.journal.count("c1:init:su2"), 1);
    assert_eq!(h.journal.count("c1:start:su2"), 1);
    assert_eq!(h.journal.count("c1:shut_down:su2"), 1);
    assert_eq!(sa.state(), LifeCycleState::Shutdown);
    assert!(sa.units().iter().all(|u| u.state().is_shut_down()));

    h.faults.failing_unit_inits.lock().clear();
    container.deployment().start("sa").await.unwrap();
    assert!(sa.units().iter().all(|u| u.state().is_started()));
    container.shutdown().await;
}

#[tokio::test]
async fn failed_start_rolls_back_connections_and_units() {
    let h = Harness::new();
    let container = h.container_with(jbi_container::ContainerConfig {
        deployment_timeout_ms: 200,
        ..h.config()
    });
    container.start().await.unwrap();
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    let connections = [endpoint_link("alias", "ep", "su", "ep")];
    let deployment = container.deployment();
    let sa = deployment
        .deploy(&h.assembly_zip_with("sa", &[Unit::new("su", "c1")], &connections))
        .await
        .unwrap();

    h.faults.hang_unit_start.store(true, Ordering::SeqCst);
    let err = deployment.start("sa").await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");

    let endpoints = container.registry().endpoints();
    let alias = QName::new(TEST_NS, "alias");
    assert!(endpoints.get_endpoint(&alias, "ep").is_none());
    assert!(endpoints.get_linked_endpoints().is_empty());
    assert!(endpoints.get_internal_endpoint(&QName::new(TEST_NS, "su"), "ep").is_none());
    assert!(sa.units().iter().all(|u| u.state().is_shut_down()));
    assert_eq!(h.journal.count("c1:shut_down:su"), 1);
    assert_eq!(sa.state(), LifeCycleState::Shutdown);

    h.faults.hang_unit_start.store(false, Ordering::SeqCst);
    deployment.undeploy("sa", false).await.unwrap();
    deployment
        .deploy(&h.assembly_zip_with("sa", &[Unit::new("su", "c1")], &connections))
        .await
        .unwrap();
    deployment.start("sa").await.unwrap();
    assert!(matches!(endpoints.get_endpoint(&alias, "ep"), Some(Endpoint::Linked(_))));
    container.shutdown().await;
}

#[tokio::test]
async fn undeploy_shuts_down_units_a_failed_start_left_initialised() {
    let h = Harness::new();
    let container = h.container_with(jbi_container::ContainerConfig {
        deployment_timeout_ms: 200,
        ..h.config()
    });
    container.start().await.unwrap();
    container
        .installation()
        .install_component(&h.component_zip("c1", &[]))
        .await
        .unwrap();
    let deployment = container.deployment();
    let sa = deployment
        .deploy(&h.assembly_zip("sa", &[Unit::new("su", "c1")]))
        .await
        .unwrap();

    h.faults.hang_unit_start.store(true, Ordering::SeqCst);
    h.faults.fail_unit_shut_down.store(true, Ordering::SeqCst);
    deployment.start("sa").await.unwrap_err();
    assert_eq!(sa.state(), LifeCycleState::Shutdown);
    assert!(sa.units().iter().all(|u| u.state().is_stopped()));
    let endpoints = container.registry().endpoints();
    let service = QName::new(TEST_NS, "su");
    assert!(endpoints.get_internal_endpoint(&service, "ep").is_some());

    h.faults.hang_unit_start.store(false, Ordering::SeqCst);
    h.faults.fail_unit_shut_down.store(false, Ordering::SeqCst);
    h.journal.clear();
    deployment.undeploy("sa", false).await.unwrap();
    assert_eq!(h.journal.calls(), ["c1:shut_down:su", "c1:undeploy:su"]);
    assert!(endpoints.get_internal_endpoint(&service, "ep").is_none());
    assert!(container.registry().get_service_assembly("sa").is_none());
    container.shutdown().await;
}
