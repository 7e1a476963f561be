use bastion_core::fakes::{FakeEngine, FakeHost};
use bastion_core::{
    BastionConfig, EndpointResolver, ErrorKind, ExecutionContext, HostFacts, PlatformVariant,
    Resolution, ResolutionSource,
};
use serial_test::serial;

const SOCKET: &str = "/var/run/bastion-docker.sock";
const ADDRESS: &str = "unix:///var/run/bastion-docker.sock";

fn linux_host() -> HostFacts {
    HostFacts::new(PlatformVariant::Linux, ExecutionContext::Host)
}

fn serving_primary(host: &FakeHost) {
    host.add_context("bastion", ADDRESS);
    host.add_socket(SOCKET);
    host.add_engine(ADDRESS, FakeEngine::isolated());
}

#[test]
fn given_drifted_primary_when_resolved_then_repaired_before_probing() {
    let host = FakeHost::new();
    host.add_context("bastion", "unix:///var/run/docker.sock");
    host.add_socket(SOCKET);
    host.add_engine(ADDRESS, FakeEngine::isolated());
    let config = BastionConfig::default();

    let resolution = EndpointResolver::new(&host, &config, linux_host()).resolve(None);

    assert_eq!(resolution.endpoint(), Some("bastion"));
    assert_eq!(resolution.source(), Some(ResolutionSource::Primary));
    assert!(resolution.warnings().is_empty());
    assert_eq!(host.context_address("bastion").as_deref(), Some(ADDRESS));
    let commands = host.commands();
    let update = commands
        .iter()
        .position(|c| c.starts_with("docker context update bastion"))
        .unwrap();
    let info = commands
        .iter()
        .position(|c| c.starts_with("docker --context bastion info"))
        .unwrap();
    assert!(update < info);
}

#[test]
fn given_isolated_workload_when_resolved_then_default_without_any_probe() {
    let host = FakeHost::new();
    serving_primary(&host);
    let config = BastionConfig::default();
    let facts = HostFacts::new(PlatformVariant::Containerized, ExecutionContext::IsolatedWorkload);

    let resolution = EndpointResolver::new(&host, &config, facts).resolve(Some("bastion"));

    assert_eq!(
        resolution,
        Resolution::Endpoint {
            name: "default".to_string(),
            source: ResolutionSource::NestedWorkload,
            warnings: Vec::new(),
        }
    );
    assert!(host.commands().is_empty());
}

#[test]
fn given_containerized_variant_on_host_when_resolved_then_no_repair_attempted() {
    let host = FakeHost::new();
    host.add_context("bastion", "unix:///var/run/docker.sock");
    let config = BastionConfig::default();
    let facts = HostFacts::new(PlatformVariant::Containerized, ExecutionContext::Host);

    let _ = EndpointResolver::new(&host, &config, facts).resolve(None);

    assert_eq!(host.count_commands("docker context update"), 0);
}

#[test]
fn given_healthy_override_when_resolved_then_override_wins() {
    let host = FakeHost::new();
    serving_primary(&host);
    host.add_context("scratch", ADDRESS);
    let config = BastionConfig::default();

    let resolution = EndpointResolver::new(&host, &config, linux_host()).resolve(Some("scratch"));

    assert_eq!(resolution.endpoint(), Some("scratch"));
    assert_eq!(resolution.source(), Some(ResolutionSource::Override));
}

#[test]
fn given_same_state_when_resolved_twice_then_same_answer() {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    let config = BastionConfig::default();
    let resolver = EndpointResolver::new(&host, &config, linux_host());

    assert_eq!(resolver.resolve(None), resolver.resolve(None));
}

#[test]
fn given_nothing_reachable_when_resolved_then_attempts_explain_each_failure() {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    let config = BastionConfig::default();

    let resolution = EndpointResolver::new(&host, &config, linux_host()).resolve(None);

    match resolution {
        Resolution::NotFound { attempts, .. } => {
            let kinds: Vec<_> = attempts.iter().map(|a| a.error_kind()).collect();
            assert_eq!(
                kinds,
                vec![Some(ErrorKind::SocketNotFound), Some(ErrorKind::ContextNotFound)]
            );
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert!(host.mutations().is_empty());
}

#[test]
#[serial]
fn given_context_env_override_when_resolved_then_env_endpoint_probed_first() {
    let host = FakeHost::new();
    serving_primary(&host);
    host.add_context("from-env", ADDRESS);
    let config = BastionConfig::default();

    std::env::set_var("BASTION_CONTEXT", "from-env");
    let resolution = EndpointResolver::new(&host, &config, linux_host()).resolve_with_env(None);
    std::env::remove_var("BASTION_CONTEXT");

    assert_eq!(resolution.endpoint(), Some("from-env"));
    assert_eq!(resolution.source(), Some(ResolutionSource::Override));
}

#[test]
#[serial]
fn given_explicit_override_and_env_when_resolved_then_explicit_wins() {
    let host = FakeHost::new();
    serving_primary(&host);
    host.add_context("explicit", ADDRESS);
    host.add_context("from-env", ADDRESS);
    let config = BastionConfig::default();

    std::env::set_var("BASTION_CONTEXT", "from-env");
    let resolution =
        EndpointResolver::new(&host, &config, linux_host()).resolve_with_env(Some("explicit"));
    std::env::remove_var("BASTION_CONTEXT");

    assert_eq!(resolution.endpoint(), Some("explicit"));
}
