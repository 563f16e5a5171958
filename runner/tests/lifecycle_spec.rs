use config_loader::WorkerConfig;
use package_checks::CheckKind;
use runner::{
    AnsibleProvisioner, Backend, Environment, EnvironmentState, ExecutorError, ProvisionContext,
    ProvisionError, Provisioner, RenderError, Repository, ResourceHandle, RunnerError,
    SimulatedCommandExecutor, Target,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn templates_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../templates")
}

fn config() -> Arc<WorkerConfig> {
    Arc::new(WorkerConfig {
        templates_dir: templates_dir(),
        ..WorkerConfig::default()
    })
}

#[derive(Default)]
struct RecordingProvisioner {
    invocations: Mutex<Vec<(String, bool)>>,
    failure: Option<String>,
}

impl RecordingProvisioner {
    fn failing(stderr: &str) -> Self {
        Self {
            failure: Some(stderr.to_string()),
            ..Self::default()
        }
    }

    fn invocations(&self) -> Vec<(String, bool)> {
        self.invocations.lock().unwrap().clone()
    }
}

impl Provisioner for RecordingProvisioner {
    fn provision(&self, ctx: &ProvisionContext<'_>, verbose: bool) -> Result<(), ProvisionError> {
        self.invocations
            .lock()
            .unwrap()
            .push((ctx.handle.id().to_string(), verbose));
        match &self.failure {
            Some(stderr) => Err(ProvisionError::Provisioner {
                message: "playbook failed".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn environment(
    backend: Backend,
    target: Target,
    executor: &SimulatedCommandExecutor,
    provisioner: Arc<dyn Provisioner>,
) -> Environment {
    Environment::new("t1", backend, target, config())
        .unwrap()
        .with_executor(Arc::new(executor.clone()))
        .with_provisioner(provisioner)
}

fn debian_11() -> Target {
    Target::new("debian", "11", "x86_64")
}

fn position(lines: &[String], fragment: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(fragment))
        .unwrap_or_else(|| panic!("no command containing '{fragment}' in {lines:#?}"))
}

fn cmd(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn given_debian_container_when_provisioned_end_to_end_then_state_is_provisioned() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = Environment::new("e2e", Backend::Docker, debian_11(), config())
        .unwrap()
        .with_repositories(vec![Repository::new("base", "http://mirror.example/debian")])
        .with_executor(Arc::new(executor.clone()))
        .with_provisioner(Arc::new(AnsibleProvisioner));

    env.create().unwrap();
    assert_eq!(env.state(), EnvironmentState::Created);
    assert_eq!(
        env.handle(),
        Some(&ResourceHandle::Container {
            name: "envctl_docker_debian_11_x86_64_e2e".to_string()
        })
    );

    let definition = fs::read_to_string(env.work_dir().unwrap().join("docker.tf")).unwrap();
    assert!(definition.contains("name         = \"debian:11\""));
    assert!(definition.contains("\"http://mirror.example/debian\""));
    assert!(!definition.contains("networks_advanced"));

    env.initial_provision(false).unwrap();
    assert_eq!(env.state(), EnvironmentState::Provisioned);

    let lines = executor.command_lines();
    let update = position(&lines, "apt-get update");
    let install = position(&lines, "apt-get install -y python3");
    let playbook = position(&lines, "ansible-playbook");
    assert!(update < install && install < playbook);
    assert!(lines[update].starts_with("docker exec envctl_docker_debian_11_x86_64_e2e "));

    env.destroy().unwrap();
    assert_eq!(env.state(), EnvironmentState::Destroyed);
}

#[test]
fn given_interpreter_install_fails_when_provisioning_then_failed_with_stderr() {
    let executor = SimulatedCommandExecutor::new().fail_with(
        "install -y python3",
        100,
        "E: Unable to locate package python3",
    );
    let provisioner = Arc::new(RecordingProvisioner::default());
    let mut env = environment(Backend::Docker, debian_11(), &executor, provisioner.clone());

    env.create().unwrap();
    let err = env.initial_provision(false).unwrap_err();

    assert_eq!(env.state(), EnvironmentState::Failed);
    match err {
        RunnerError::Provision(e) => {
            assert!(e.stderr().contains("E: Unable to locate package python3"));
            assert!(e.to_string().contains("Cannot install package python3"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(provisioner.invocations().is_empty());
}

#[test]
fn given_metadata_refresh_fails_when_provisioning_then_install_never_attempted() {
    let executor = SimulatedCommandExecutor::new().fail_with("apt-get update", 100, "E: mirror down");
    let provisioner = Arc::new(RecordingProvisioner::default());
    let mut env = environment(Backend::Docker, debian_11(), &executor, provisioner.clone());

    env.create().unwrap();
    let err = env.initial_provision(false).unwrap_err();

    assert!(matches!(err, RunnerError::Provision(ProvisionError::Bootstrap { ref stderr, .. }) if stderr == "E: mirror down"));
    assert!(!executor.was_called_with("install -y python3"));
    assert!(provisioner.invocations().is_empty());
    assert_eq!(env.state(), EnvironmentState::Failed);
}

#[test]
fn given_rhel_family_container_when_provisioning_then_no_package_manager_commands() {
    let executor = SimulatedCommandExecutor::new();
    let provisioner = Arc::new(RecordingProvisioner::default());
    let mut env = environment(
        Backend::Docker,
        Target::new("almalinux", "9", "x86_64"),
        &executor,
        provisioner.clone(),
    );

    env.create().unwrap();
    env.initial_provision(true).unwrap();

    assert!(!executor.was_called_with("docker exec"));
    assert_eq!(
        provisioner.invocations(),
        vec![("envctl_docker_almalinux_9_x86_64_t1".to_string(), true)]
    );
    assert_eq!(env.state(), EnvironmentState::Provisioned);
}

#[test]
fn given_debian_vm_when_provisioning_then_bootstrap_is_skipped() {
    let executor = SimulatedCommandExecutor::new().succeed_with("output -raw vm_ip", "10.0.4.2\n");
    let provisioner = Arc::new(RecordingProvisioner::default());
    let mut env = environment(Backend::OpenNebula, debian_11(), &executor, provisioner.clone());

    env.create().unwrap();
    assert_eq!(
        env.handle(),
        Some(&ResourceHandle::Host {
            address: "10.0.4.2".to_string()
        })
    );

    env.initial_provision(false).unwrap();
    assert!(!executor.was_called_with("ssh"));
    assert_eq!(provisioner.invocations()[0].0, "10.0.4.2");
}

#[test]
fn given_provisioner_failure_when_provisioning_then_failed_and_destroy_still_callable() {
    let executor = SimulatedCommandExecutor::new();
    let provisioner = Arc::new(RecordingProvisioner::failing("fatal: UNREACHABLE"));
    let mut env = environment(Backend::Docker, debian_11(), &executor, provisioner);

    env.create().unwrap();
    let err = env.initial_provision(false).unwrap_err();
    assert!(matches!(err, RunnerError::Provision(ref e) if e.stderr() == "fatal: UNREACHABLE"));
    assert_eq!(env.state(), EnvironmentState::Failed);

    env.destroy().unwrap();
    assert_eq!(env.state(), EnvironmentState::Destroyed);
    assert!(executor.was_called_with("terraform destroy -auto-approve"));
}

#[test]
fn given_created_environment_when_destroyed_repeatedly_then_every_call_succeeds() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();
    let work_dir = env.work_dir().unwrap().to_path_buf();

    for _ in 0..3 {
        env.destroy().unwrap();
        assert_eq!(env.state(), EnvironmentState::Destroyed);
    }

    let destroys = executor
        .command_lines()
        .iter()
        .filter(|l| l.contains("terraform destroy"))
        .count();
    assert_eq!(destroys, 1);
    assert!(!work_dir.exists());
    assert!(env.work_dir().is_none());
    assert!(env.handle().is_none());
}

#[test]
fn given_never_created_environment_when_destroyed_then_backend_untouched() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = environment(
        Backend::Aws,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );

    env.destroy().unwrap();

    assert!(executor.calls().is_empty());
    assert_eq!(env.state(), EnvironmentState::Destroyed);
}

#[test]
fn given_missing_template_parameter_when_create_then_backend_never_invoked() {
    let templates = tempfile::tempdir().unwrap();
    fs::write(
        templates.path().join("docker.tf.tmpl"),
        "name = \"{{ .container_name }}\"\nzone = \"{{ .availability_zone }}\"\n",
    )
    .unwrap();
    let config = Arc::new(WorkerConfig {
        templates_dir: templates.path().to_path_buf(),
        ..WorkerConfig::default()
    });
    let executor = SimulatedCommandExecutor::new();
    let mut env = Environment::new("t1", Backend::Docker, debian_11(), config)
        .unwrap()
        .with_executor(Arc::new(executor.clone()));

    let err = env.create().unwrap_err();

    assert!(matches!(
        err,
        RunnerError::Render(RenderError::MissingParameter { ref name, .. }) if name == "availability_zone"
    ));
    assert_eq!(env.state(), EnvironmentState::Failed);
    assert!(executor.calls().is_empty());

    env.destroy().unwrap();
    assert!(executor.calls().is_empty());
}

#[test]
fn given_repository_name_with_dot_when_create_then_rejected_before_backend() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = environment(
        Backend::OpenNebula,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    )
    .with_repositories(vec![Repository::new("epel.next", "http://mirror.example/epel")]);

    let err = env.create().unwrap_err();

    assert!(matches!(
        err,
        RunnerError::Render(RenderError::InvalidValue { ref name, .. }) if name == "repositories"
    ));
    assert!(err.to_string().contains("epel.next"));
    assert_eq!(env.state(), EnvironmentState::Failed);
    assert!(executor.calls().is_empty());
}

#[test]
fn given_missing_template_file_when_create_then_render_error() {
    let templates = tempfile::tempdir().unwrap();
    let config = Arc::new(WorkerConfig {
        templates_dir: templates.path().to_path_buf(),
        ..WorkerConfig::default()
    });
    let mut env = Environment::new("t1", Backend::Aws, debian_11(), config).unwrap();

    assert!(matches!(
        env.create(),
        Err(RunnerError::Render(RenderError::TemplateNotFound { .. }))
    ));
    assert_eq!(env.state(), EnvironmentState::Failed);
}

#[test]
fn given_apply_fails_when_create_then_failed_and_destroy_cleans_up() {
    let executor = SimulatedCommandExecutor::new().fail_with(
        "terraform apply",
        1,
        "Error: Unable to find image 'debian:11'",
    );
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );

    let err = env.create().unwrap_err();
    match err {
        RunnerError::Creation(e) => assert!(e.to_string().contains("Unable to find image")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(env.state(), EnvironmentState::Failed);
    assert!(env.handle().is_none());

    env.destroy().unwrap();
    assert!(executor.was_called_with("terraform destroy"));
}

#[test]
fn given_init_fails_when_create_then_destroy_skips_backend_teardown() {
    let executor = SimulatedCommandExecutor::new().fail_with(
        "terraform init",
        1,
        "Error: Failed to query available provider packages",
    );
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    let work_dir = env.work_dir().unwrap().to_path_buf();

    let err = env.create().unwrap_err();
    assert!(err.to_string().contains("provider packages"));
    assert_eq!(env.state(), EnvironmentState::Failed);
    assert!(!executor.was_called_with("terraform apply"));

    env.destroy().unwrap();
    assert_eq!(env.state(), EnvironmentState::Destroyed);
    assert!(!executor.was_called_with("terraform destroy"));
    assert!(!work_dir.exists());
}

#[test]
fn given_terraform_missing_when_create_then_creation_error_wraps_executor_error() {
    let executor = SimulatedCommandExecutor::new().tool_missing("terraform");
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );

    let err = env.create().unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Creation(runner::EnvironmentCreationError::Executor {
            source: ExecutorError::ToolNotFound { .. },
            ..
        })
    ));
}

#[test]
fn given_vm_without_address_when_create_then_missing_handle() {
    let executor = SimulatedCommandExecutor::new().succeed_with("output -raw instance_ip", "  \n");
    let mut env = environment(
        Backend::Aws,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );

    let err = env.create().unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Creation(runner::EnvironmentCreationError::MissingHandle { .. })
    ));
    assert_eq!(env.state(), EnvironmentState::Failed);
}

#[test]
fn given_failed_environment_when_operating_then_fails_fast() {
    let executor = SimulatedCommandExecutor::new().fail_with("terraform apply", 1, "boom");
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    let _ = env.create();
    let calls_before = executor.calls().len();

    assert!(matches!(env.create(), Err(RunnerError::InvalidState { .. })));
    assert!(matches!(
        env.initial_provision(false),
        Err(RunnerError::InvalidState {
            state: EnvironmentState::Failed,
            ..
        })
    ));
    assert!(matches!(
        env.run_command(&cmd(&["true"])),
        Err(RunnerError::InvalidState { .. })
    ));
    assert_eq!(executor.calls().len(), calls_before);
}

#[test]
fn given_destroyed_environment_when_operating_then_fails_fast() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();
    env.destroy().unwrap();

    assert!(matches!(
        env.run_command(&cmd(&["true"])),
        Err(RunnerError::InvalidState {
            state: EnvironmentState::Destroyed,
            ..
        })
    ));
    assert!(matches!(env.create(), Err(RunnerError::InvalidState { .. })));
}

#[test]
fn given_uninitialized_environment_when_running_command_then_invalid_state() {
    let executor = SimulatedCommandExecutor::new();
    let env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );

    assert!(matches!(
        env.run_command(&cmd(&["true"])),
        Err(RunnerError::InvalidState {
            state: EnvironmentState::Uninitialized,
            ..
        })
    ));
}

#[test]
fn given_non_zero_exit_when_running_command_then_output_returned_unchanged() {
    let executor = SimulatedCommandExecutor::new().fail_with("cat /etc/shadow", 1, "Permission denied\n");
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();

    let output = env.run_command(&cmd(&["cat", "/etc/shadow"])).unwrap();

    assert_eq!(output.exit_code, 1);
    assert_eq!(output.stderr, "Permission denied\n");
    assert_eq!(env.state(), EnvironmentState::Created);

    let call = executor.calls().pop().unwrap();
    assert_eq!(call.program, "docker");
    assert_eq!(call.cwd.as_deref(), env.work_dir());
}

#[test]
fn given_vm_when_running_command_then_translated_to_ssh() {
    let executor = SimulatedCommandExecutor::new().succeed_with("output -raw vm_ip", "10.0.4.2");
    let mut env = environment(
        Backend::OpenNebula,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();

    env.run_command(&cmd(&["uname", "-m"])).unwrap();

    let call = executor.calls().pop().unwrap();
    assert_eq!(call.program, "ssh");
    assert_eq!(call.args.last().unwrap(), "uname -m");
    assert!(call.args.contains(&"root@10.0.4.2".to_string()));
}

#[test]
fn given_teardown_fails_when_destroy_then_error_and_retry_possible() {
    let executor = SimulatedCommandExecutor::new().fail_with("terraform destroy", 1, "Error: lock held");
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();

    let err = env.destroy().unwrap_err();
    assert!(matches!(err, RunnerError::Teardown { ref stderr, .. } if stderr == "Error: lock held"));
    assert_eq!(env.state(), EnvironmentState::Created);
    assert!(env.work_dir().unwrap().exists());
}

#[test]
fn given_external_network_when_create_then_definition_attaches_network() {
    let config = Arc::new(WorkerConfig {
        templates_dir: templates_dir(),
        external_network: Some("ci-net".to_string()),
        ..WorkerConfig::default()
    });
    let executor = SimulatedCommandExecutor::new();
    let mut env = Environment::new("t1", Backend::Docker, debian_11(), config)
        .unwrap()
        .with_executor(Arc::new(executor.clone()));

    env.create().unwrap();

    let definition = fs::read_to_string(env.work_dir().unwrap().join("docker.tf")).unwrap();
    assert!(definition.contains("networks_advanced"));
    assert!(definition.contains("name = \"ci-net\""));
    env.destroy().unwrap();
}

#[test]
fn given_provisioned_debian_when_install_package_fails_then_state_unchanged() {
    let executor = SimulatedCommandExecutor::new().fail_with(
        "apt-get install -y curl=7.88",
        100,
        "E: Version '7.88' for 'curl' was not found",
    );
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();
    env.initial_provision(false).unwrap();

    let err = env.install_package("curl", Some("7.88")).unwrap_err();

    assert!(matches!(
        err,
        RunnerError::Provision(ProvisionError::PackageInstall { ref package, .. }) if package == "curl=7.88"
    ));
    assert_eq!(env.state(), EnvironmentState::Provisioned);
}

#[test]
fn given_rhel_8_when_install_package_then_dnf_used() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = environment(
        Backend::Docker,
        Target::new("rocky", "8.9", "x86_64"),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();
    env.initial_provision(false).unwrap();

    env.install_package("widget", Some("2.0-4.el8")).unwrap();

    assert!(executor.was_called_with("dnf install -y widget-2.0-4.el8"));
}

#[test]
fn given_created_environment_when_install_package_then_invalid_state() {
    let executor = SimulatedCommandExecutor::new();
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();

    assert!(matches!(
        env.install_package("curl", None),
        Err(RunnerError::InvalidState { .. })
    ));
    assert!(matches!(
        env.run_package_checks("curl", None),
        Err(RunnerError::InvalidState { .. })
    ));
}

#[test]
fn given_provisioned_environment_when_running_package_checks_then_report_lists_failures() {
    let executor = SimulatedCommandExecutor::new()
        .succeed_with("dpkg-query -W", "install ok installed\n7.88.1-10")
        .succeed_with(
            "dpkg-query -L curl",
            "/.\n/usr\n/usr/bin/curl\n/usr/lib/x86_64-linux-gnu/libcurl.so.4\n",
        )
        .fail_with("test -L", 1, "")
        .succeed_with("file -L -b", "ELF 64-bit LSB pie executable, dynamically linked")
        .succeed_with(
            "ldd /usr/bin/curl",
            "\tlibnghttp2.so.14 => not found\n\tlibc.so.6 => /lib/x86_64-linux-gnu/libc.so.6\n",
        )
        .succeed_with(
            "readelf -d",
            " 0x000000000000001d (RUNPATH)            Library runpath: [/opt/curl/lib:]\n",
        );
    let mut env = environment(
        Backend::Docker,
        debian_11(),
        &executor,
        Arc::new(RecordingProvisioner::default()),
    );
    env.create().unwrap();
    env.initial_provision(false).unwrap();

    let report = env.run_package_checks("curl", Some("7.88.1-10")).unwrap();

    assert!(!report.passed());
    assert!(report.outcome(CheckKind::Installed).unwrap().passed());
    assert!(report.outcome(CheckKind::FilesPresent).unwrap().passed());
    let linkage = report.outcome(CheckKind::Linkage).unwrap();
    assert_eq!(
        linkage.result.as_ref().unwrap_err().missing_libraries(),
        vec!["libnghttp2.so.14"]
    );
    assert!(!report.outcome(CheckKind::Rpath).unwrap().passed());
    assert!(executor.was_called_with("docker exec envctl_docker_debian_11_x86_64_t1 ldd /usr/bin/curl"));
}
