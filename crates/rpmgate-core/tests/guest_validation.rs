//! Build a package, boot a guest, run the suites and report, using the
//! in-process fakes for the build root and hypervisor.

use std::sync::Arc;
use std::time::Duration;

use rpmgate_core::fakes::{FakeBuildRoot, FakeHypervisor};
use rpmgate_core::{
    Arch, BuildExecutor, FsTransport, PackageSpec, SessionRegistry, SharedMount, TestOutcome,
    TestReport, TestRunner, TestSuite, VmDescriptor, VmSession,
};

fn arch() -> Arch {
    "x86_64".parse().unwrap()
}

fn descriptor(dir: &tempfile::TempDir, name: &str) -> VmDescriptor {
    let image = dir.path().join("base.qcow2");
    std::fs::write(&image, b"qcow").unwrap();
    VmDescriptor::new(name, arch(), image).with_shutdown_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn built_packages_are_installed_and_tested() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let provider = Arc::new(FakeBuildRoot::new().produces("foo", "1.0", "1"));
    let builder = BuildExecutor::new(provider, &out, 1);
    let set = builder
        .build(&PackageSpec::new("foo", "/src/foo.spec", "/src"), &arch(), &[])
        .await
        .unwrap();
    assert_eq!(set.package_names(), vec!["foo".to_string()]);

    let staging = dir.path().join("staging");
    std::fs::create_dir_all(&staging).unwrap();
    let mount = SharedMount::new("staging", &staging, "/rpmgate.staging", FsTransport::NineP).read_only();

    let hv = FakeHypervisor::new();
    let registry = SessionRegistry::new();
    let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "acme-x86_64").with_mount(mount))
        .await
        .unwrap();
    session.mount_all().await.unwrap();
    assert_eq!(hv.mounted(), vec!["staging".to_string()]);

    let suites = vec![
        TestSuite::basic_install(&set.package_names(), Duration::from_secs(60)),
        TestSuite::new("smoke", "foo --version", Duration::from_secs(10)),
    ];
    let results = TestRunner::new().run(&mut session, &suites).await;
    session.stop(false).await.unwrap();

    let mut report = TestReport::new("acme");
    report.extend(&arch(), results);
    assert!(report.all_passed());
    assert!(report.summary().ends_with("2 passed, 0 failed, 0 errors"));
    assert_eq!(hv.exec_count_matching("install foo"), 1);
    assert_eq!(hv.live_guests(), 0);
    assert!(!registry.is_live("acme-x86_64"));

    builder.release(&set).await;
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
}

#[tokio::test]
async fn failing_install_stops_validation_and_shows_in_junit() {
    let dir = tempfile::tempdir().unwrap();
    let hv = FakeHypervisor::new();
    hv.script_exit("install foo", 1, "Error: Nothing to do & <no match>");
    let registry = SessionRegistry::new();
    let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "acme-x86_64"))
        .await
        .unwrap();

    let suites = vec![
        TestSuite::basic_install(&["foo".to_string()], Duration::from_secs(60)),
        TestSuite::new("smoke", "foo --version", Duration::from_secs(10)),
    ];
    let results = TestRunner::new().run(&mut session, &suites).await;
    session.stop(false).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].classification, TestOutcome::Failed);
    assert_eq!(hv.exec_count_matching("foo --version"), 0);

    let mut report = TestReport::new("acme");
    report.extend(&arch(), results);
    let xml = report.junit();
    assert!(xml.contains("<failure message=\"exit code 1\">"));
    assert!(xml.contains("&amp; &lt;no match&gt;"));
}
