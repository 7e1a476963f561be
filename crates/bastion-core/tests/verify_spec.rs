use bastion_core::fakes::{FakeEngine, FakeHost};
use bastion_core::verify::{CheckStatus, Fatality, VerificationCheck};
use bastion_core::{BastionConfig, HealthReport, PlatformVariant, RecommendedAction, VerificationRunner};

const SOCKET: &str = "/var/run/bastion-docker.sock";
const ADDRESS: &str = "unix:///var/run/bastion-docker.sock";

fn verify_with(engine: FakeEngine) -> (FakeHost, HealthReport) {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    host.add_socket(SOCKET);
    host.add_engine(ADDRESS, engine.with_image("alpine:3.20"));
    let config = BastionConfig::default();
    let report = VerificationRunner::new(&host, &config, PlatformVariant::Linux).run();
    (host, report)
}

fn status(report: &HealthReport, check: VerificationCheck) -> CheckStatus {
    report.check(check).unwrap().status
}

#[test]
fn given_identity_uid_map_with_clean_exit_when_verified_then_isolation_fails() {
    let (_, report) = verify_with(FakeEngine::isolated().with_uid_map("0 0 4294967295\n"));

    assert_eq!(status(&report, VerificationCheck::IsolationDepth), CheckStatus::Fail);
    assert!(!report.isolation_available);
    assert_eq!(report.recommended_action, RecommendedAction::InvestigateIsolation);
}

#[test]
fn given_partial_root_mapping_when_verified_then_isolation_fails() {
    let (_, report) = verify_with(FakeEngine::isolated().with_uid_map("0 0 1000\n1000 165536 65536\n"));

    assert_eq!(status(&report, VerificationCheck::IsolationDepth), CheckStatus::Fail);
}

#[test]
fn given_multi_range_remap_when_verified_then_isolation_passes() {
    let (_, report) =
        verify_with(FakeEngine::isolated().with_uid_map("0 165536 1000\n1000 166536 64536\n"));

    let check = report.check(VerificationCheck::IsolationDepth).unwrap();
    assert_eq!(check.status, CheckStatus::Pass);
    assert!(check.detail.contains("165536"));
}

#[test]
fn given_garbage_uid_map_when_verified_then_isolation_fails_explicitly() {
    let (_, report) = verify_with(FakeEngine::isolated().with_uid_map("not a map\n"));

    let check = report.check(VerificationCheck::IsolationDepth).unwrap();
    assert_eq!(check.status, CheckStatus::Fail);
    assert!(check.detail.contains("unparseable"));
}

#[test]
fn given_empty_uid_map_output_when_verified_then_isolation_fails() {
    let (_, report) = verify_with(FakeEngine::isolated().with_uid_map(""));

    assert_eq!(status(&report, VerificationCheck::IsolationDepth), CheckStatus::Fail);
}

#[test]
fn given_isolated_engine_when_verified_then_workloads_name_the_runtime_explicitly() {
    let (host, report) = verify_with(FakeEngine::isolated());

    assert!(report.passed());
    assert!(host
        .commands()
        .iter()
        .any(|c| c.contains("run --rm --runtime sysbox-runc alpine:3.20 cat /proc/self/uid_map")));
}

#[test]
fn given_endpoint_bound_elsewhere_when_verified_then_repair_recommended() {
    let host = FakeHost::new();
    host.add_context("bastion", "unix:///var/run/docker.sock");
    host.add_socket("/var/run/docker.sock");
    host.add_engine("unix:///var/run/docker.sock", FakeEngine::isolated().with_image("alpine:3.20"));
    let config = BastionConfig::default();

    let report = VerificationRunner::new(&host, &config, PlatformVariant::Linux).run();

    let check = report.check(VerificationCheck::EndpointExists).unwrap();
    assert_eq!(check.status, CheckStatus::Fail);
    assert!(check.remediation.as_deref().unwrap().starts_with("docker context update bastion"));
    assert_eq!(report.recommended_action, RecommendedAction::RepairEndpoint);
}

#[test]
fn given_stopped_daemon_when_verified_then_start_service_recommended() {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    host.add_socket(SOCKET);
    let config = BastionConfig::default();

    let report = VerificationRunner::new(&host, &config, PlatformVariant::Linux).run();

    assert_eq!(status(&report, VerificationCheck::EndpointExists), CheckStatus::Pass);
    assert_eq!(status(&report, VerificationCheck::EngineReachable), CheckStatus::Fail);
    assert_eq!(report.recommended_action, RecommendedAction::StartService);
}

#[test]
fn given_smoke_failure_only_when_verified_then_isolation_still_available() {
    let host = FakeHost::new();
    host.add_context("bastion", ADDRESS);
    host.add_socket(SOCKET);
    host.add_engine(ADDRESS, FakeEngine::isolated().with_image("alpine:3.20"));
    host.fail_command(
        "docker --context bastion run --rm --runtime sysbox-runc alpine:3.20 echo",
        "OCI runtime exec failed",
    );
    let config = BastionConfig::default();

    let report = VerificationRunner::new(&host, &config, PlatformVariant::Linux).run();

    assert!(report.isolation_available);
    let smoke = report.check(VerificationCheck::SmokeWorkload).unwrap();
    assert_eq!(smoke.fatality, Fatality::Warning);
    assert_eq!(smoke.status, CheckStatus::Fail);
}

#[test]
fn given_passing_report_when_round_tripped_through_json_then_equal() {
    let (_, report) = verify_with(FakeEngine::isolated());

    let json = serde_json::to_string(&report).unwrap();
    let back: HealthReport = serde_json::from_str(&json).unwrap();

    assert_eq!(back, report);
}
