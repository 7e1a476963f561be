use bastion_core::fakes::{FakeEngine, FakeHost};
use bastion_core::{AvailabilityProbe, EngineCli, ErrorKind, Host, ProbeOptions};
use std::time::Duration;

const SOCKET: &str = "/var/run/bastion-docker.sock";
const ADDRESS: &str = "unix:///var/run/bastion-docker.sock";

fn probe(host: &dyn Host) -> AvailabilityProbe<'_> {
    let engine = EngineCli::new(host, Duration::from_secs(10), Duration::from_secs(120));
    AvailabilityProbe::new(
        host,
        engine,
        ProbeOptions {
            runtime: "sysbox-runc".to_string(),
            require_runtime: true,
        },
    )
}

fn serving_host(engine: FakeEngine) -> FakeHost {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    host.add_socket(SOCKET);
    host.add_engine(ADDRESS, engine);
    host
}

#[test]
fn given_healthy_isolated_engine_when_probed_then_available() {
    let host = serving_host(FakeEngine::isolated());

    let result = probe(&host).check("bastion");

    assert!(result.is_available(), "{}", result);
    assert_eq!(result.address(), Some(ADDRESS));
    assert!(result.warnings().is_empty());
}

#[test]
fn given_missing_context_when_probed_then_context_not_found() {
    let host = FakeHost::new();

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::ContextNotFound));
    assert!(result.diagnostic().contains("does not exist"));
}

#[test]
fn given_context_inspect_times_out_when_checked_then_timeout_not_context_not_found() {
    let host = serving_host(FakeEngine::isolated());
    host.set_inspect_times_out();

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert_eq!(host.count_commands("docker --context bastion info"), 0);
}

#[test]
fn given_context_inspect_permission_error_when_checked_then_permission_denied() {
    let host = serving_host(FakeEngine::isolated());
    host.fail_command(
        "docker context inspect bastion",
        "open /home/op/.docker/contexts/meta: permission denied",
    );

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::PermissionDenied));
    assert!(result.diagnostic().contains("permission denied"));
}

#[test]
fn given_absent_socket_when_probed_then_socket_not_found_without_info_call() {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::SocketNotFound));
    assert_eq!(host.count_commands("docker --context bastion info"), 0);
}

#[test]
fn given_engine_without_hardened_runtime_when_probed_then_runtime_not_found() {
    let host = serving_host(FakeEngine::plain());

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::RuntimeNotFound));
    assert!(result.diagnostic().contains("runc"));
}

#[test]
fn given_capability_check_disabled_when_probed_then_plain_engine_available() {
    let host = serving_host(FakeEngine::plain());

    let result = probe(&host).without_capability_check().check("bastion");

    assert!(result.is_available());
}

#[test]
fn given_permission_error_when_probed_then_permission_denied() {
    let host = serving_host(FakeEngine::isolated().with_error(
        "permission denied while trying to connect to the Docker daemon socket at unix:///var/run/bastion-docker.sock",
    ));

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::PermissionDenied));
}

#[test]
fn given_server_errors_in_info_when_probed_then_classified_failure() {
    let host = serving_host(
        FakeEngine::isolated().with_server_error("Cannot connect to the Docker daemon. Is the docker daemon running?"),
    );

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::DaemonUnavailable));
}

#[test]
fn given_info_times_out_when_probed_then_timeout() {
    let host = serving_host(FakeEngine::isolated());
    host.set_info_times_out();

    let result = probe(&host).check("bastion");

    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
}

#[test]
fn given_timeout_mechanism_unavailable_when_probed_then_rerun_unbounded_with_warning() {
    let host = serving_host(FakeEngine::isolated());
    host.set_timeout_unavailable();

    let result = probe(&host).check("bastion");

    assert!(result.is_available(), "{}", result);
    assert_eq!(result.warnings().len(), 1);
    assert!(result.warnings()[0].contains("no timeout mechanism"));
    assert_eq!(host.count_commands("docker --context bastion info"), 2);
}

#[test]
fn given_repeated_probes_when_state_changes_then_results_are_not_cached() {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    host.add_engine(ADDRESS, FakeEngine::isolated());
    let probe = probe(&host);

    assert_eq!(probe.check("bastion").error_kind(), Some(ErrorKind::SocketNotFound));
    host.add_socket(SOCKET);
    assert!(probe.check("bastion").is_available());
}

#[test]
fn given_any_probe_when_run_then_nothing_is_mutated() {
    let host = serving_host(FakeEngine::plain());

    let _ = probe(&host).check("bastion");
    let _ = probe(&host).check("missing");

    assert!(host.mutations().is_empty());
}
