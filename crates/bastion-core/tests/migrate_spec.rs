use bastion_core::fakes::FakeHost;
use bastion_core::migrate::{LegacyResource, LegacyResourceKind, MigrationAction};
use bastion_core::{
    BastionConfig, Confirmer, LegacyMigrator, MigrationOptions, NonInteractive, PlatformVariant,
};
use std::cell::RefCell;
use std::path::PathBuf;

const LEGACY_VM_SOCKET: &str = "/Users/op/.bastion/docker.sock";

struct Recording {
    answer: bool,
    asked: RefCell<Vec<String>>,
}

impl Recording {
    fn answering(answer: bool) -> Self {
        Self {
            answer,
            asked: RefCell::new(Vec::new()),
        }
    }
}

impl Confirmer for Recording {
    fn confirm(&self, resource: &LegacyResource) -> bool {
        self.asked.borrow_mut().push(resource.to_string());
        self.answer
    }
}

fn mac_config() -> BastionConfig {
    let mut config = BastionConfig::default();
    config.legacy.vm_socket_paths = vec![PathBuf::from(LEGACY_VM_SOCKET)];
    config
}

fn legacy_mac_host() -> FakeHost {
    let host = FakeHost::new();
    host.add_socket(LEGACY_VM_SOCKET);
    host.add_vm("bastion-legacy", "Running");
    host.add_vm("bastion", "Running");
    host
}

fn verified() -> MigrationOptions {
    MigrationOptions {
        verified: true,
        force: false,
        dry_run: false,
    }
}

#[test]
fn given_legacy_vm_verified_without_force_non_interactive_then_vm_retained_with_instructions() {
    let host = legacy_mac_host();
    let config = mac_config();
    let migrator = LegacyMigrator::new(&host, &config, PlatformVariant::VmHosted, &NonInteractive);

    let report = migrator.migrate(verified());

    assert!(!host.has_path(LEGACY_VM_SOCKET));
    assert_eq!(host.vm_status("bastion-legacy").as_deref(), Some("Running"));
    let retained: Vec<_> = report.retained().cloned().collect();
    assert_eq!(
        retained.iter().map(|r| &r.kind).collect::<Vec<_>>(),
        vec![&LegacyResourceKind::VirtualMachine("bastion-legacy".to_string())]
    );
    assert_eq!(report.instructions.len(), 1);
    assert!(report.instructions[0].contains("limactl delete --force bastion-legacy"));
    assert_eq!(host.count_commands("limactl delete"), 0);
}

#[test]
fn given_legacy_vm_verified_and_forced_then_deleted_without_prompt() {
    let host = legacy_mac_host();
    let config = mac_config();
    let confirmer = Recording::answering(false);
    let migrator = LegacyMigrator::new(&host, &config, PlatformVariant::VmHosted, &confirmer);

    let report = migrator.migrate(MigrationOptions {
        force: true,
        ..verified()
    });

    assert!(confirmer.asked.borrow().is_empty());
    assert!(host.vm_status("bastion-legacy").is_none());
    assert_eq!(host.vm_status("bastion").as_deref(), Some("Running"));
    assert!(report.instructions.is_empty());
}

#[test]
fn given_forced_but_unverified_then_stateful_resources_never_removed() {
    let host = legacy_mac_host();
    host.add_context("bastion-legacy", "unix:///Users/op/.bastion/docker.sock");
    let config = mac_config();
    let confirmer = Recording::answering(true);
    let migrator = LegacyMigrator::new(&host, &config, PlatformVariant::VmHosted, &confirmer);

    let report = migrator.migrate(MigrationOptions {
        verified: false,
        force: true,
        dry_run: false,
    });

    assert!(confirmer.asked.borrow().is_empty());
    assert_eq!(report.retained().count(), 2);
    assert!(host.context_address("bastion-legacy").is_some());
    assert!(host.vm_status("bastion-legacy").is_some());
    assert!(report.entries.iter().all(|e| match &e.action {
        MigrationAction::Retained { reason } => reason.contains("not verified"),
        _ => !e.resource.is_stateful(),
    }));
}

#[test]
fn given_operator_confirms_at_prompt_then_each_stateful_resource_asked_once() {
    let host = legacy_mac_host();
    host.add_context("bastion", "unix:///Users/op/.lima/bastion/sock/docker.sock");
    host.add_context("bastion-legacy", "unix:///Users/op/.bastion/docker.sock");
    let config = mac_config();
    let confirmer = Recording::answering(true);
    let migrator = LegacyMigrator::new(&host, &config, PlatformVariant::VmHosted, &confirmer);

    let report = migrator.migrate(verified());

    assert_eq!(
        *confirmer.asked.borrow(),
        vec![
            "legacy endpoint bastion-legacy".to_string(),
            "legacy VM bastion-legacy".to_string()
        ]
    );
    assert_eq!(report.removed().count(), 3);
    assert!(!report.has_failures());
}

#[test]
fn given_nothing_legacy_present_then_empty_report_and_no_mutations() {
    let host = FakeHost::new();
    let config = BastionConfig::default();
    let migrator = LegacyMigrator::new(&host, &config, PlatformVariant::Linux, &NonInteractive);

    let report = migrator.migrate(verified());

    assert!(report.is_empty());
    assert!(host.mutations().is_empty());
}

#[test]
fn given_dry_run_then_plan_lists_exact_commands_and_nothing_changes() {
    let host = legacy_mac_host();
    let config = mac_config();
    let migrator = LegacyMigrator::new(&host, &config, PlatformVariant::VmHosted, &NonInteractive);

    let report = migrator.migrate(MigrationOptions {
        dry_run: true,
        force: true,
        ..verified()
    });

    let planned: Vec<Vec<String>> = report
        .entries
        .iter()
        .map(|e| match &e.action {
            MigrationAction::Planned { commands } => commands.clone(),
            other => panic!("expected plan, got {:?}", other),
        })
        .collect();
    assert_eq!(
        planned,
        vec![
            vec![format!("rm {}", LEGACY_VM_SOCKET)],
            vec!["limactl delete --force bastion-legacy".to_string()],
        ]
    );
    assert!(host.mutations().is_empty());
    assert!(host.has_path(LEGACY_VM_SOCKET));
}
